use crate::config::{IMAGE_PIXELS, IMAGE_SIDE, NUM_CLASSES};
use crate::error::Result;
use crate::layers::{
    Conv2Dlayer, DropoutLayer, FcLayer, FlattenLayer, Layer, MaxPoolLayer, Padding, ReluLayer,
    ReshapeLayer, SoftMaxLayer,
};
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub const CONV1_FEATURES: usize = 32;
pub const CONV2_FEATURES: usize = 64;
pub const KERNEL_SIZE: usize = 5;
pub const POOL_SIZE: usize = 2;
pub const HIDDEN_UNITS: usize = 1024;

pub trait Module {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32>; // Input is (batch_size, features)
    /// Backward pass
    ///
    /// The `backward` function receives a gradient `dz` which corresponds to dLoss/dz,
    /// where z is the current layer output.
    /// The job of the backward pass is to combine its 'local gradients' - namely dz/dx, dz/dw -
    /// with this incoming gradient - dLoss/dz - using the chain rule.
    /// The backward should:
    /// - return dLoss/dx = dz/dx * dLoss/dz
    /// - fill in the gradients for the layer's own weights dLoss/dw = dz/dw * dLoss/dz
    ///
    /// Note:
    /// - the dz/dx Jacobian matrix is not materialized (too wasteful). Instead, each layer
    /// directly computes the matrix-vector product of interest.
    /// - the shape of the function output - which corresponds to dLoss/dx - is the same shape
    /// as the layer inputs.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32>;
    fn zero_grad(&mut self);
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NN {
    pub layers: Vec<Layer>,
}

impl Module for NN {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = input;
        for layer in &mut self.layers {
            x = layer.forward(x);
        }
        x
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = dz;
        // Iterate layers in reverse order, mutate each as we go
        for layer in self.layers.iter_mut().rev() {
            x = layer.backward(x);
        }
        x
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }
}

impl NN {
    /// The two-convolution digit classifier:
    ///
    /// (b, 784) -> (b, 1, 28, 28)
    /// -> conv5x5 SAME 1->32, relu, maxpool2x2  -> (b, 32, 14, 14)
    /// -> conv5x5 SAME 32->64, relu, maxpool2x2 -> (b, 64, 7, 7)
    /// -> flatten (b, 3136) -> fc 1024, relu, dropout -> fc 10, softmax
    ///
    /// The dropout keep probability starts at 1.0, set it with `set_keep_prob` before training.
    pub fn deep_conv<R: Rng + ?Sized>(rng: &mut R) -> NN {
        let conv1 = Conv2Dlayer::new(
            1,
            CONV1_FEATURES,
            (KERNEL_SIZE, KERNEL_SIZE),
            Padding::Same,
            rng,
        );
        let pool1 = MaxPoolLayer::new((POOL_SIZE, POOL_SIZE), Padding::Same);
        let conv2 = Conv2Dlayer::new(
            CONV1_FEATURES,
            CONV2_FEATURES,
            (KERNEL_SIZE, KERNEL_SIZE),
            Padding::Same,
            rng,
        );
        let pool2 = MaxPoolLayer::new((POOL_SIZE, POOL_SIZE), Padding::Same);

        // Shape bookkeeping: the dense layer consumes the flattened second pooling output.
        let (h, w) = conv1.output_hw(IMAGE_SIDE, IMAGE_SIDE);
        let (h, w) = pool1.output_hw(h, w);
        let (h, w) = conv2.output_hw(h, w);
        let (h, w) = pool2.output_hw(h, w);
        let flat_features = conv2.out_channels() * h * w;

        let fc1 = FcLayer::new(flat_features, HIDDEN_UNITS, rng);
        let dropout = DropoutLayer::new(1.0, rng.gen());
        let fc2 = FcLayer::new(HIDDEN_UNITS, NUM_CLASSES, rng);

        NN {
            layers: vec![
                Layer::Reshape(ReshapeLayer::new(&[1, IMAGE_SIDE, IMAGE_SIDE])),
                //
                Layer::Conv(conv1), // (1, 28, 28) --> (32, 28, 28)
                Layer::ReLU(ReluLayer::new()),
                Layer::Pool(pool1), // (32, 28, 28) --> (32, 14, 14)
                //
                Layer::Conv(conv2), // (32, 14, 14) --> (64, 14, 14)
                Layer::ReLU(ReluLayer::new()),
                Layer::Pool(pool2), // (64, 14, 14) --> (64, 7, 7)
                //
                Layer::Flatten(FlattenLayer::new()),
                //
                Layer::FC(fc1), // 3136 --> 1024
                Layer::ReLU(ReluLayer::new()),
                Layer::Dropout(dropout),
                //
                Layer::FC(fc2), // 1024 --> 10
                Layer::Softmax(SoftMaxLayer::new()),
            ],
        }
    }

    /// Feed the dropout keep probability for the following forward passes.
    pub fn set_keep_prob(&mut self, keep_prob: f32) {
        for layer in &mut self.layers {
            if let Layer::Dropout(l) = layer {
                l.set_keep_prob(keep_prob);
            }
        }
    }

    /// Class probabilities `(batch_size, num_classes)` for `(batch_size, 784)` images.
    pub fn predict(&mut self, images: ArrayView2<f32>) -> Array2<f32> {
        assert!(
            images.ncols() == IMAGE_PIXELS,
            "expected {IMAGE_PIXELS} pixels per image, got {}",
            images.ncols()
        );
        self.forward(images.to_owned().into_dyn())
            .into_dimensionality::<Ix2>()
            .expect("Network output should be 2D: (batch_size, num_classes)")
    }

    /// Save the neural network to a checkpoint file
    pub fn to_checkpoint<P: AsRef<Path>>(&self, filepath: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(filepath)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Load a neural network from a checkpoint file
    pub fn from_checkpoint<P: AsRef<Path>>(filepath: P) -> Result<Self> {
        let reader = BufReader::new(File::open(filepath)?);
        let nn: NN = serde_json::from_reader(reader)?;
        Ok(nn)
    }
}
