use crate::model::Module;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

fn fresh_rng() -> StdRng {
    StdRng::from_entropy()
}

/// Inverted dropout: each activation is kept with probability `keep_prob`
/// and scaled by `1 / keep_prob`, so the expected activation is unchanged.
///
/// `keep_prob` is fed per execution (see `NN::set_keep_prob`): training
/// runs use the configured probability, evaluation uses 1.0 which makes the
/// layer the identity.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DropoutLayer {
    keep_prob: f32,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
    // for backprop
    #[serde(skip)]
    last_mask: Option<ArrayD<f32>>, // 0.0 or 1/keep_prob per activation, None when keep_prob == 1
}

impl DropoutLayer {
    pub fn new(keep_prob: f32, seed: u64) -> DropoutLayer {
        assert!(
            keep_prob > 0.0 && keep_prob <= 1.0,
            "keep probability must be in (0, 1]"
        );
        DropoutLayer {
            keep_prob,
            rng: StdRng::seed_from_u64(seed),
            last_mask: None,
        }
    }

    pub fn keep_prob(&self) -> f32 {
        self.keep_prob
    }

    pub fn set_keep_prob(&mut self, keep_prob: f32) {
        assert!(
            keep_prob > 0.0 && keep_prob <= 1.0,
            "keep probability must be in (0, 1]"
        );
        self.keep_prob = keep_prob;
    }
}

impl Module for DropoutLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        if self.keep_prob >= 1.0 {
            self.last_mask = None;
            return input;
        }

        let keep_prob = self.keep_prob;
        let scale = 1.0 / keep_prob;
        let rng = &mut self.rng;
        let mask = ArrayD::from_shape_simple_fn(input.raw_dim(), || {
            if rng.gen::<f32>() < keep_prob {
                scale
            } else {
                0.0
            }
        });
        let out = input * &mask;
        self.last_mask = Some(mask);
        out
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        match self.last_mask.as_ref() {
            Some(mask) => dz * mask,
            None => dz,
        }
    }

    fn zero_grad(&mut self) {
        self.last_mask = None;
    }
}
