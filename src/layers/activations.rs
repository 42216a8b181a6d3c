pub use crate::model::Module;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReluLayer {
    #[serde(skip)]
    last_input: Option<ArrayD<f32>>,
}

impl ReluLayer {
    pub fn new() -> ReluLayer {
        ReluLayer { last_input: None }
    }
}

impl Module for ReluLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let out = input.mapv(|x| x.max(0.0));
        self.last_input = Some(input);
        out
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mut dz = dz;
        let last_input = self.last_input.as_ref().expect("run forward before backward");
        dz.zip_mut_with(last_input, |d, &x| {
            if x <= 0.0 {
                *d = 0.0
            }
        });
        dz
    }

    fn zero_grad(&mut self) {
        self.last_input = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SoftMaxLayer {
    #[serde(skip)]
    last_output: Option<Array2<f32>>,
}

impl SoftMaxLayer {
    pub fn new() -> SoftMaxLayer {
        SoftMaxLayer { last_output: None }
    }
}

impl Module for SoftMaxLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("Input to softmax should be 2D");

        let max = input.fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b));
        // exp(x - max)
        let mut out = input - max.insert_axis(Axis(1));
        out.mapv_inplace(|x| x.exp());

        let sum = out.sum_axis(Axis(1));
        let out = out / sum.insert_axis(Axis(1));

        // for backprop
        self.last_output = Some(out.clone());

        out.into_dyn()
    }

    /// NOTE: the input to the softmax backward is the one-hot targets, not a
    /// gradient. Softmax is always followed by the cross-entropy loss, and the
    /// pair simplifies to dLoss/dlogits = (p - y) / batch_size for the
    /// batch-mean loss.
    fn backward(&mut self, labels: ArrayD<f32>) -> ArrayD<f32> {
        let labels = labels
            .into_dimensionality::<Ix2>()
            .expect("softmax backward expects (batch_size, num_classes) targets");
        let batch_size = labels.nrows();

        let last_output = self
            .last_output
            .as_ref()
            .expect("run forward before backward");
        let unnormalized_dz = last_output - &labels;
        (unnormalized_dz / batch_size as f32).into_dyn()
    }

    fn zero_grad(&mut self) {
        self.last_output = None;
    }
}
