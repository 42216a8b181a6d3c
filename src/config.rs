use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const NUM_CLASSES: usize = 10;

pub const LEARNING_RATE: f32 = 1e-4;
pub const KEEP_PROB: f32 = 0.5;
pub const BATCH_SIZE: usize = 50;
pub const ITERATIONS: usize = 20_000;
pub const LOG_EVERY: usize = 100;
/// Checkpoint every this many logging steps.
pub const CHECKPOINT_STRIDE: usize = 10;
pub const DATA_DIR: &str = "MNIST_data";

/// Everything the training loop needs to know. `Default` reproduces the
/// reference run: 20k Adam steps of 50 images, accuracy logged every 100.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub data_dir: String,
    pub batch_size: usize,
    pub iterations: usize,
    pub log_every: usize,
    pub learning_rate: f32,
    pub keep_prob: f32,
    pub seed: Option<u64>,
    pub checkpoint_folder: Option<String>,
    pub checkpoint_stride: usize,
    pub loss_csv_path: Option<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            data_dir: DATA_DIR.to_string(),
            batch_size: BATCH_SIZE,
            iterations: ITERATIONS,
            log_every: LOG_EVERY,
            learning_rate: LEARNING_RATE,
            keep_prob: KEEP_PROB,
            seed: None,
            checkpoint_folder: None,
            checkpoint_stride: CHECKPOINT_STRIDE,
            loss_csv_path: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }
        if self.iterations == 0 {
            return Err(Error::InvalidConfig("iteration count must be positive".into()));
        }
        if self.log_every == 0 {
            return Err(Error::InvalidConfig("logging interval must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "keep probability must be in (0, 1], got {}",
                self.keep_prob
            )));
        }
        if self.checkpoint_stride == 0 {
            return Err(Error::InvalidConfig("checkpoint stride must be positive".into()));
        }
        Ok(())
    }
}
