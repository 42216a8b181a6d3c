use crate::config::IMAGE_PIXELS;
use crate::error::{Error, Result};
use crate::model::NN;
use crate::optim::argmax_rows;
use ndarray::Array2;
use std::fs;
use std::path::Path;
use tracing::info;

/// Run inference using a loaded neural network
///
/// The image is a raw 28x28 greyscale file: 784 bytes, one per pixel, row by row.
/// Returns the predicted digit.
pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(checkpoint_path: P, example_path: Q) -> Result<usize> {
    let checkpoint_path = checkpoint_path.as_ref();
    let mut nn = NN::from_checkpoint(checkpoint_path)?;
    nn.set_keep_prob(1.0);
    info!("loaded checkpoint from {}", checkpoint_path.display());

    let image_bytes = fs::read(example_path)?;
    let input = image_to_input(&image_bytes)?;

    let output = nn.predict(input.view());
    let predicted_label = argmax_rows(&output)[0];

    println!("Prediction: {}", predicted_label);
    println!("Output probabilities: {:?}", output.row(0).to_vec());

    Ok(predicted_label)
}

/// Convert an image from raw bytes to a normalized (1, 784) row.
pub fn image_to_input(image_bytes: &[u8]) -> Result<Array2<f32>> {
    if image_bytes.len() != IMAGE_PIXELS {
        return Err(Error::InvalidImage {
            expected: IMAGE_PIXELS,
            got: image_bytes.len(),
        });
    }
    let img_f32: Vec<f32> = image_bytes.iter().map(|&x| x as f32 / 255.0).collect();
    Ok(Array2::from_shape_vec((1, IMAGE_PIXELS), img_f32)?)
}
