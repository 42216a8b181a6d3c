use deep_conv_mnist::config::IMAGE_PIXELS;
use deep_conv_mnist::mnist_dataset::{
    load_mnist, MnistSplit, MNIST_FILES, TEST_LEN, TRAIN_LEN, VALIDATION_LEN,
};
use deep_conv_mnist::Error;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Split of `len` images where every pixel of image i holds i / 255,
/// so that samples can be told apart after batching.
fn indexed_split(len: usize, seed: u64) -> MnistSplit {
    let pixels: Vec<u8> = (0..len)
        .flat_map(|i| std::iter::repeat(i as u8).take(IMAGE_PIXELS))
        .collect();
    let labels = (0..len).map(|i| (i % 10) as u8).collect();
    MnistSplit::from_bytes(pixels, labels, seed).unwrap()
}

fn sample_ids(images: &Array2<f32>) -> Vec<usize> {
    images
        .column(0)
        .iter()
        .map(|&p| (p * 255.0).round() as usize)
        .collect()
}

#[test]
fn pixels_are_scaled_to_unit_interval() {
    let pixels: Vec<u8> = [0u8, 255]
        .iter()
        .flat_map(|&p| std::iter::repeat(p).take(IMAGE_PIXELS))
        .collect();
    let split = MnistSplit::from_bytes(pixels, vec![3, 7], 0).unwrap();
    assert_eq!(split.len(), 2);
    assert_eq!(split.images().dim(), (2, IMAGE_PIXELS));
    assert!(split.images().row(0).iter().all(|&p| p == 0.0));
    assert!(split.images().row(1).iter().all(|&p| p == 1.0));
    assert_eq!(split.labels(), &[3, 7]);
}

#[test]
fn every_sample_is_seen_once_per_epoch() {
    let mut split = indexed_split(20, 1);
    let mut seen = Vec::new();
    for _ in 0..4 {
        let (images, labels) = split.next_batch(5);
        assert_eq!(images.dim(), (5, IMAGE_PIXELS));
        let ids = sample_ids(&images);
        for (&id, &label) in ids.iter().zip(&labels) {
            assert_eq!(label as usize, id % 10);
        }
        seen.extend(ids);
    }
    assert_eq!(seen.iter().copied().collect::<HashSet<_>>().len(), 20);
    assert_eq!(split.epochs_completed(), 0);

    split.next_batch(1);
    assert_eq!(split.epochs_completed(), 1);
}

#[test]
fn batch_crossing_an_epoch_completes_the_old_epoch_first() {
    let mut split = indexed_split(7, 2);
    let (first, _) = split.next_batch(5);
    let (second, _) = split.next_batch(5);
    let first = sample_ids(&first);
    let second = sample_ids(&second);

    // the two leftovers of epoch 0 open the second batch
    let epoch0: HashSet<usize> = first.iter().chain(&second[..2]).copied().collect();
    assert_eq!(epoch0, (0..7).collect::<HashSet<_>>());
    assert_eq!(split.epochs_completed(), 1);
}

#[test]
fn same_seed_same_batches() {
    let mut a = indexed_split(30, 9);
    let mut b = indexed_split(30, 9);
    for _ in 0..10 {
        assert_eq!(a.next_batch(7), b.next_batch(7));
    }
}

#[test]
fn empty_split_is_rejected() {
    let result = MnistSplit::new(Array2::zeros((0, IMAGE_PIXELS)), vec![], 0);
    assert!(matches!(result, Err(Error::EmptyDataset)));
}

#[test]
fn missing_files_are_reported() {
    let dir = std::env::temp_dir().join(format!("deep_conv_mnist_empty_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let result = load_mnist(&dir, &mut StdRng::seed_from_u64(0));
    match result {
        Err(Error::MissingDataset { path }) => assert_eq!(path, dir.join(MNIST_FILES[0])),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("loading from an empty directory should fail"),
    }
    std::fs::remove_dir_all(&dir).ok();
}

fn fresh_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("deep_conv_mnist_{name}_{}", std::process::id()));
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn idx_header(fields: &[u32]) -> Vec<u8> {
    fields.iter().flat_map(|f| f.to_be_bytes()).collect()
}

/// Idx images where image i stores i in its first two pixels (big-endian).
fn idx_images(nb_images: usize) -> Vec<u8> {
    let mut bytes = idx_header(&[2051, nb_images as u32, 28, 28]);
    bytes.reserve(nb_images * IMAGE_PIXELS);
    for i in 0..nb_images {
        let mut pixels = [0u8; IMAGE_PIXELS];
        pixels[0] = (i / 256) as u8;
        pixels[1] = (i % 256) as u8;
        bytes.extend_from_slice(&pixels);
    }
    bytes
}

fn idx_labels(nb_labels: usize) -> Vec<u8> {
    let mut bytes = idx_header(&[2049, nb_labels as u32]);
    bytes.extend((0..nb_labels).map(|i| (i % 10) as u8));
    bytes
}

fn full_size_files() -> [(&'static str, Vec<u8>); 4] {
    let nb_train = TRAIN_LEN + VALIDATION_LEN;
    [
        (MNIST_FILES[0], idx_images(nb_train)),
        (MNIST_FILES[1], idx_labels(nb_train)),
        (MNIST_FILES[2], idx_images(TEST_LEN)),
        (MNIST_FILES[3], idx_labels(TEST_LEN)),
    ]
}

fn image_id(split: &MnistSplit, row: usize) -> usize {
    let images = split.images();
    let pixels = images.row(row);
    let byte = |p: f32| (p * 255.0).round() as usize;
    byte(pixels[0]) * 256 + byte(pixels[1])
}

#[test]
fn full_dataset_is_split_into_train_validation_and_test() {
    let dir = fresh_dir("full");
    for (name, bytes) in full_size_files() {
        fs::write(dir.join(name), bytes).unwrap();
    }

    let data = load_mnist(&dir, &mut StdRng::seed_from_u64(0)).unwrap();
    assert_eq!(data.train.len(), 55_000);
    assert_eq!(data.validation.len(), 5_000);
    assert_eq!(data.test.len(), 10_000);

    // validation is the tail of the training file
    assert_eq!(image_id(&data.train, 0), 0);
    assert_eq!(image_id(&data.train, TRAIN_LEN - 1), TRAIN_LEN - 1);
    assert_eq!(image_id(&data.validation, 0), TRAIN_LEN);
    assert_eq!(image_id(&data.validation, VALIDATION_LEN - 1), TRAIN_LEN + VALIDATION_LEN - 1);
    assert_eq!(image_id(&data.test, TEST_LEN - 1), TEST_LEN - 1);

    // labels are plain digits aligned with their images
    assert_eq!(data.train.labels()[..3], [0, 1, 2]);
    assert_eq!(data.validation.labels()[3], ((TRAIN_LEN + 3) % 10) as u8);
    assert_eq!(data.test.labels()[TEST_LEN - 1], 9);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn gzipped_files_are_extracted_before_loading() {
    let dir = fresh_dir("gz");
    for (name, bytes) in full_size_files() {
        let file = fs::File::create(dir.join(format!("{name}.gz"))).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::fast());
        encoder.write_all(&bytes).unwrap();
        encoder.finish().unwrap();
    }

    // a trailing separator on the data directory is accepted too
    let dir_with_slash = format!("{}/", dir.display());
    let data = load_mnist(&dir_with_slash, &mut StdRng::seed_from_u64(1)).unwrap();
    assert_eq!(
        (data.train.len(), data.validation.len(), data.test.len()),
        (55_000, 5_000, 10_000)
    );
    for name in MNIST_FILES {
        assert!(dir.join(name).is_file(), "{name} was not extracted");
    }

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn corrupt_files_are_reported_not_panicked_on() {
    let dir = fresh_dir("corrupt");
    for name in MNIST_FILES {
        fs::write(dir.join(name), b"not an idx file").unwrap();
    }
    match load_mnist(&dir, &mut StdRng::seed_from_u64(0)) {
        Err(Error::InvalidDataset { path, .. }) => assert_eq!(path, dir.join(MNIST_FILES[0])),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("loading garbage should fail"),
    }
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn truncated_or_miscounted_files_are_reported() {
    let nb_train = (TRAIN_LEN + VALIDATION_LEN) as u32;
    let cases = [
        // right header, a single image of data
        (idx_header(&[2051, nb_train, 28, 28]), "bytes"),
        // wrong image count
        (idx_images(100), "items"),
        // labels magic in the images file
        (idx_header(&[2049, nb_train, 28, 28]), "magic"),
    ];
    for (i, (mut images, reason_word)) in cases.into_iter().enumerate() {
        let dir = fresh_dir(&format!("truncated{i}"));
        if reason_word == "bytes" {
            images.extend_from_slice(&[0u8; IMAGE_PIXELS]);
        }
        fs::write(dir.join(MNIST_FILES[0]), images).unwrap();
        for name in &MNIST_FILES[1..] {
            fs::write(dir.join(name), b"").unwrap();
        }
        match load_mnist(&dir, &mut StdRng::seed_from_u64(0)) {
            Err(Error::InvalidDataset { path, reason }) => {
                assert_eq!(path, dir.join(MNIST_FILES[0]));
                assert!(reason.contains(reason_word), "{reason}");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("case {i} should fail"),
        }
        fs::remove_dir_all(&dir).ok();
    }
}
