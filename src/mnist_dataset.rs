use crate::config::{IMAGE_PIXELS, IMAGE_SIDE};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use mnist::MnistBuilder;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const TRAIN_LEN: usize = 55_000;
pub const VALIDATION_LEN: usize = 5_000;
pub const TEST_LEN: usize = 10_000;

/// The idx files expected in the data directory. Each may also be present
/// only as its `.gz` archive, as downloaded from the MNIST site.
pub const MNIST_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

pub const IDX_IMAGES_MAGIC: u32 = 2051;
pub const IDX_LABELS_MAGIC: u32 = 2049;

/// One split of the dataset, with pixels scaled to [0, 1].
///
/// Batches are drawn epoch by epoch: the sample order is reshuffled every
/// time the split has been fully consumed, and a batch straddling two epochs
/// takes the tail of the old order and completes it from the new one.
#[derive(Debug, Clone)]
pub struct MnistSplit {
    images: Array2<f32>, // (len, 784)
    labels: Vec<u8>,
    order: Vec<usize>,
    cursor: usize,
    epochs_completed: usize,
    rng: StdRng,
}

impl MnistSplit {
    pub fn new(images: Array2<f32>, labels: Vec<u8>, seed: u64) -> Result<MnistSplit> {
        if labels.is_empty() {
            return Err(Error::EmptyDataset);
        }
        if images.nrows() != labels.len() || images.ncols() != IMAGE_PIXELS {
            return Err(Error::InvalidConfig(format!(
                "{} labels for images of shape {:?}",
                labels.len(),
                images.shape()
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..labels.len()).collect();
        order.shuffle(&mut rng);
        Ok(MnistSplit {
            images,
            labels,
            order,
            cursor: 0,
            epochs_completed: 0,
            rng,
        })
    }

    /// Build a split from raw idx bytes (one byte per pixel, 0-255).
    pub fn from_bytes(pixels: Vec<u8>, labels: Vec<u8>, seed: u64) -> Result<MnistSplit> {
        let nb_images = pixels.len() / IMAGE_PIXELS;
        let pixels: Vec<f32> = pixels.into_iter().map(|p| p as f32 / 255.0).collect();
        let images = Array2::from_shape_vec((nb_images, IMAGE_PIXELS), pixels)?;
        MnistSplit::new(images, labels, seed)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn images(&self) -> ArrayView2<'_, f32> {
        self.images.view()
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    /// Next `batch_size` samples: `(images (batch_size, 784), labels)`.
    pub fn next_batch(&mut self, batch_size: usize) -> (Array2<f32>, Vec<u8>) {
        let mut indices = Vec::with_capacity(batch_size);
        while indices.len() < batch_size {
            if self.cursor == self.order.len() {
                self.epochs_completed += 1;
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            let take = (batch_size - indices.len()).min(self.order.len() - self.cursor);
            indices.extend_from_slice(&self.order[self.cursor..self.cursor + take]);
            self.cursor += take;
        }

        let images = self.images.select(Axis(0), &indices);
        let labels = indices.iter().map(|&idx| self.labels[idx]).collect();
        (images, labels)
    }
}

pub struct MnistData {
    pub train: MnistSplit,
    pub validation: MnistSplit,
    pub test: MnistSplit,
}

/// Loads the MNIST idx files found in `data_dir`.
/// The 60k training images are split into 55k train / 5k validation, the
/// 10k test images are kept whole.
///
/// A file missing in uncompressed form is extracted from its `.gz` archive
/// next to it. Every file header is checked before loading.
pub fn load_mnist<P: AsRef<Path>, R: Rng + ?Sized>(data_dir: P, rng: &mut R) -> Result<MnistData> {
    let data_dir = data_dir.as_ref();
    for file in MNIST_FILES {
        let path = ensure_extracted(data_dir, file)?;
        let nb_items = if file.starts_with("train") {
            TRAIN_LEN + VALIDATION_LEN
        } else {
            TEST_LEN
        };
        if file.contains("images") {
            check_idx_file(&path, IDX_IMAGES_MAGIC, nb_items)?;
        } else {
            check_idx_file(&path, IDX_LABELS_MAGIC, nb_items)?;
        }
    }
    let base_path = format!(
        "{}/",
        data_dir
            .to_str()
            .ok_or_else(|| Error::InvalidConfig(format!(
                "data directory {} is not valid UTF-8",
                data_dir.display()
            )))?
            .trim_end_matches('/')
    );

    let mnist = MnistBuilder::new()
        .label_format_digit()
        .base_path(&base_path)
        .training_set_length(TRAIN_LEN as u32)
        .validation_set_length(VALIDATION_LEN as u32)
        .test_set_length(TEST_LEN as u32)
        .finalize();

    let data = MnistData {
        train: MnistSplit::from_bytes(mnist.trn_img, mnist.trn_lbl, rng.gen())?,
        validation: MnistSplit::from_bytes(mnist.val_img, mnist.val_lbl, rng.gen())?,
        test: MnistSplit::from_bytes(mnist.tst_img, mnist.tst_lbl, rng.gen())?,
    };
    info!(
        train = data.train.len(),
        validation = data.validation.len(),
        test = data.test.len(),
        "loaded MNIST from {}",
        data_dir.display()
    );
    Ok(data)
}

/// Path of the uncompressed `name` in `data_dir`, decompressing `name.gz` first if needed.
fn ensure_extracted(data_dir: &Path, name: &str) -> Result<PathBuf> {
    let path = data_dir.join(name);
    if path.is_file() {
        return Ok(path);
    }
    let gz_path = data_dir.join(format!("{name}.gz"));
    if !gz_path.is_file() {
        return Err(Error::MissingDataset { path });
    }

    info!("extracting {}", gz_path.display());
    let mut decoder = GzDecoder::new(BufReader::new(File::open(&gz_path)?));
    let mut out = BufWriter::new(File::create(&path)?);
    let copied = io::copy(&mut decoder, &mut out).and_then(|_| out.flush());
    if let Err(e) = copied {
        drop(out);
        fs::remove_file(&path).ok(); // no half-written file for the next run
        return Err(Error::InvalidDataset {
            path: gz_path,
            reason: format!("cannot decompress: {e}"),
        });
    }
    Ok(path)
}

/// Checks an idx header against the expected magic number and item count,
/// and the file length against the size the header announces.
///
/// Images: magic, count, rows, cols (4 big-endian u32) then one byte per pixel.
/// Labels: magic, count then one byte per label.
fn check_idx_file(path: &Path, magic: u32, nb_items: usize) -> Result<()> {
    let invalid = |reason: String| Error::InvalidDataset {
        path: path.to_path_buf(),
        reason,
    };
    let (header_len, item_len) = if magic == IDX_IMAGES_MAGIC {
        (16, IMAGE_PIXELS)
    } else {
        (8, 1)
    };

    let file_len = fs::metadata(path)?.len() as usize;
    if file_len < header_len {
        return Err(invalid(format!("{file_len} bytes is too short for an idx header")));
    }
    let mut header = [0u8; 16];
    File::open(path)?.read_exact(&mut header[..header_len])?;
    let field = |i: usize| {
        u32::from_be_bytes([header[4 * i], header[4 * i + 1], header[4 * i + 2], header[4 * i + 3]])
    };

    if field(0) != magic {
        return Err(invalid(format!(
            "magic number {} (expected {magic})",
            field(0)
        )));
    }
    if field(1) as usize != nb_items {
        return Err(invalid(format!(
            "{} items (expected {nb_items})",
            field(1)
        )));
    }
    if magic == IDX_IMAGES_MAGIC && (field(2), field(3)) != (IMAGE_SIDE as u32, IMAGE_SIDE as u32) {
        return Err(invalid(format!(
            "{}x{} images (expected {IMAGE_SIDE}x{IMAGE_SIDE})",
            field(2),
            field(3)
        )));
    }
    let expected_len = header_len + nb_items * item_len;
    if file_len != expected_len {
        return Err(invalid(format!(
            "{file_len} bytes (expected {expected_len})"
        )));
    }
    Ok(())
}
