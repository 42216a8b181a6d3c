pub use crate::layers::activations::{ReluLayer, SoftMaxLayer};
pub use crate::layers::conv::{Conv2Dlayer, FlattenLayer, MaxPoolLayer, Padding, ReshapeLayer};
pub use crate::layers::dropout::DropoutLayer;
pub use crate::layers::fc::FcLayer;
pub use crate::model::Module;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

pub mod activations;
pub mod conv;
pub mod dropout;
pub mod fc;
pub mod init;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Layer {
    Reshape(ReshapeLayer),
    Conv(Conv2Dlayer),
    Pool(MaxPoolLayer),
    ReLU(ReluLayer),
    Flatten(FlattenLayer),
    FC(FcLayer),
    Dropout(DropoutLayer),
    Softmax(SoftMaxLayer),
}

impl Module for Layer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::Reshape(l) => l.forward(input),
            Layer::Conv(l) => l.forward(input),
            Layer::Pool(l) => l.forward(input),
            Layer::ReLU(l) => l.forward(input),
            Layer::Flatten(l) => l.forward(input),
            Layer::FC(l) => l.forward(input),
            Layer::Dropout(l) => l.forward(input),
            Layer::Softmax(l) => l.forward(input),
        }
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::Reshape(l) => l.backward(dz),
            Layer::Conv(l) => l.backward(dz),
            Layer::Pool(l) => l.backward(dz),
            Layer::ReLU(l) => l.backward(dz),
            Layer::Flatten(l) => l.backward(dz),
            Layer::FC(l) => l.backward(dz),
            Layer::Dropout(l) => l.backward(dz),
            Layer::Softmax(l) => l.backward(dz),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Layer::Reshape(l) => l.zero_grad(),
            Layer::Conv(l) => l.zero_grad(),
            Layer::Pool(l) => l.zero_grad(),
            Layer::ReLU(l) => l.zero_grad(),
            Layer::Flatten(l) => l.zero_grad(),
            Layer::FC(l) => l.zero_grad(),
            Layer::Dropout(l) => l.zero_grad(),
            Layer::Softmax(l) => l.zero_grad(),
        }
    }
}
