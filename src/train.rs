use crate::config::{TrainConfig, BATCH_SIZE};
use crate::error::Result;
use crate::mnist_dataset::{load_mnist, MnistSplit};
use crate::model::{Module, NN};
use crate::optim::{accuracy, correct_predictions, cross_entropy, Adam, Optimizer};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use tracing::{debug, info};

/// Images per forward pass when evaluating a whole split. Each worker's
/// activation caches are sized by it (the second convolution alone keeps
/// `EVAL_CHUNK * 196 * 800` floats), so it stays at the training batch size.
pub const EVAL_CHUNK: usize = BATCH_SIZE;

/// One logging step: accuracy and mean loss of the batch about to be trained on,
/// measured without dropout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub steps: Vec<StepReport>,
    pub test_accuracy: f32,
}

/// Train the two-convolution network on the MNIST files of `config.data_dir`.
pub fn train(config: &TrainConfig) -> Result<(NN, TrainReport)> {
    config.validate()?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let data = load_mnist(&config.data_dir, &mut rng)?;
    let nn = NN::deep_conv(&mut rng);
    train_on(nn, data.train, Some(&data.validation), &data.test, config)
}

/// The training loop proper, on already loaded splits.
///
/// Every `log_every` steps the batch about to be trained on is evaluated
/// with keep_prob=1.0 and `step <i>, training accuracy <acc>` is printed.
/// After the last step the whole test split is evaluated and
/// `test accuracy <acc>` is printed.
pub fn train_on(
    mut nn: NN,
    mut train_split: MnistSplit,
    validation_split: Option<&MnistSplit>,
    test_split: &MnistSplit,
    config: &TrainConfig,
) -> Result<(NN, TrainReport)> {
    config.validate()?;
    if let Some(folder) = &config.checkpoint_folder {
        fs::create_dir_all(folder)?; // in case the folder does not exist
    }
    let mut csv_file = match &config.loss_csv_path {
        Some(path) => {
            let mut file = BufWriter::new(File::create(path)?);
            writeln!(file, "step,loss,accuracy")?;
            Some(file)
        }
        None => None,
    };

    info!(
        train = train_split.len(),
        test = test_split.len(),
        batch_size = config.batch_size,
        iterations = config.iterations,
        learning_rate = config.learning_rate,
        "starting training"
    );

    let mut optimizer = Adam::new(&nn, config.learning_rate);
    let mut steps = Vec::new();

    let pb = ProgressBar::new(config.iterations as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    for step in 0..config.iterations {
        let (batch_images, batch_labels) = train_split.next_batch(config.batch_size);

        if step % config.log_every == 0 {
            nn.set_keep_prob(1.0);
            let probs = nn.predict(batch_images.view());
            let (loss, _) = cross_entropy(&batch_labels, &probs);
            let report = StepReport {
                step,
                loss: loss.mean().unwrap_or(0.0),
                accuracy: accuracy(&batch_labels, &probs),
            };
            pb.suspend(|| println!("step {}, training accuracy {}", step, report.accuracy));
            debug!(step, loss = report.loss, "batch evaluated");

            if let Some(file) = csv_file.as_mut() {
                save_metrics(file, &report)?;
            }
            if let Some(folder) = &config.checkpoint_folder {
                if steps.len() % config.checkpoint_stride == 0 {
                    let path = save_model(&nn, folder, step)?;
                    match validation_split {
                        Some(split) => info!(
                            validation_accuracy = evaluate(&nn, split),
                            "checkpoint saved to {}",
                            path.display()
                        ),
                        None => info!("checkpoint saved to {}", path.display()),
                    }
                }
            }
            steps.push(report);
        }

        // ----------
        nn.set_keep_prob(config.keep_prob);
        nn.zero_grad();
        let probs = nn.predict(batch_images.view());
        let (_, targets) = cross_entropy(&batch_labels, &probs);
        nn.backward(targets.into_dyn());
        optimizer.step(&mut nn);
        // ----------

        pb.inc(1);
    }
    pb.finish_and_clear();

    if let Some(file) = csv_file.as_mut() {
        file.flush()?;
    }

    nn.set_keep_prob(1.0);
    nn.zero_grad();
    let test_accuracy = evaluate(&nn, test_split);
    println!("test accuracy {}", test_accuracy);

    if let Some(folder) = &config.checkpoint_folder {
        let path = Path::new(folder).join("final.json");
        nn.to_checkpoint(&path)?;
        info!("final checkpoint saved to {}", path.display());
    }

    Ok((
        nn,
        TrainReport {
            steps,
            test_accuracy,
        },
    ))
}

/// Accuracy over a whole split, without dropout.
///
/// The split is cut in `EVAL_CHUNK` sized pieces evaluated in parallel, each
/// rayon worker on its own clone of the network.
pub fn evaluate(nn: &NN, split: &MnistSplit) -> f32 {
    evaluate_chunked(nn, split.images(), split.labels(), EVAL_CHUNK)
}

pub fn evaluate_chunked(
    nn: &NN,
    images: ArrayView2<f32>,
    labels: &[u8],
    chunk_size: usize,
) -> f32 {
    assert!(chunk_size > 0, "chunk size must be positive");
    let nb_samples = labels.len();
    if nb_samples == 0 {
        return 0.0;
    }

    let chunk_starts: Vec<usize> = (0..nb_samples).step_by(chunk_size).collect();
    let total_correct: usize = chunk_starts
        .into_par_iter()
        .map_init(
            || {
                let mut local_nn = nn.clone();
                local_nn.zero_grad();
                local_nn.set_keep_prob(1.0);
                local_nn
            },
            |local_nn, start| {
                let end = (start + chunk_size).min(nb_samples);
                let probs = local_nn.predict(images.slice(s![start..end, ..]));
                local_nn.zero_grad();
                correct_predictions(&labels[start..end], &probs)
            },
        )
        .sum();

    total_correct as f32 / nb_samples as f32
}

fn save_metrics<W: Write>(csv_file: &mut W, report: &StepReport) -> Result<()> {
    writeln!(
        csv_file,
        "{},{:.4},{:.4}",
        report.step, report.loss, report.accuracy
    )?;
    Ok(())
}

fn save_model(nn: &NN, checkpoint_folder: &str, step: usize) -> Result<PathBuf> {
    let ckpt_path = Path::new(checkpoint_folder).join(format!("checkpoint_{step}.json"));
    nn.to_checkpoint(&ckpt_path)?;
    Ok(ckpt_path)
}
