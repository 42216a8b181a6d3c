pub mod config;
pub mod error;
pub mod layers;
pub mod mnist_dataset;
pub mod model;
pub mod optim;
pub mod run;
pub mod telemetry;
pub mod train;

pub use error::{Error, Result};
