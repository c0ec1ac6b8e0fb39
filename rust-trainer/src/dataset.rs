use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

const IDX_IMAGES_MAGIC: u32 = 2051;
const IDX_LABELS_MAGIC: u32 = 2049;
const CIFAR_SIDE: usize = 32;
const CIFAR_RECORD_BYTES: usize = 1 + 3 * CIFAR_SIDE * CIFAR_SIDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
    Cifar10,
}

impl FromStr for DatasetKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mnist" => Ok(Self::Mnist),
            "fashion_mnist" | "fashion-mnist" => Ok(Self::FashionMnist),
            "cifar10" | "cifar-10" => Ok(Self::Cifar10),
            other => anyhow::bail!(
                "Unsupported dataset: {other} (expected mnist|fashion_mnist|cifar10)"
            ),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mnist => "mnist",
            Self::FashionMnist => "fashion_mnist",
            Self::Cifar10 => "cifar10",
        };
        f.write_str(name)
    }
}

/// Metadata about a loaded dataset.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetInfo {
    pub kind: DatasetKind,
    pub num_classes: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub num_train_examples: usize,
    pub num_test_examples: usize,
}

impl DatasetInfo {
    pub fn image_len(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// One record as stored on disk: CHW `u8` pixels and a class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub image: Vec<u8>,
    pub label: usize,
}

#[derive(Debug, Clone)]
pub struct ImageDataset {
    pub info: DatasetInfo,
    pub train: Vec<RawRecord>,
    pub test: Vec<RawRecord>,
}

impl ImageDataset {
    /// Keep at most `max_train` / `max_test` records (0 keeps everything).
    pub fn truncate(&mut self, max_train: usize, max_test: usize) {
        if max_train > 0 {
            self.train.truncate(max_train);
        }
        if max_test > 0 {
            self.test.truncate(max_test);
        }
        self.info.num_train_examples = self.train.len();
        self.info.num_test_examples = self.test.len();
    }
}

pub fn load_dataset(kind: DatasetKind, root: &Path) -> anyhow::Result<ImageDataset> {
    if !root.exists() {
        anyhow::bail!("Dataset directory does not exist: {}", root.display());
    }
    let (train, test, channels, height, width) = match kind {
        DatasetKind::Mnist | DatasetKind::FashionMnist => {
            let train = load_idx_split(root, "train")?;
            let test = load_idx_split(root, "t10k")?;
            (train.0, test.0, 1, train.1, train.2)
        }
        DatasetKind::Cifar10 => {
            let dir = resolve_cifar_dir(root);
            let mut train = Vec::new();
            for index in 1..=5 {
                train.extend(load_cifar_batch(&dir.join(format!("data_batch_{index}.bin")))?);
            }
            let test = load_cifar_batch(&dir.join("test_batch.bin"))?;
            (train, test, 3, CIFAR_SIDE, CIFAR_SIDE)
        }
    };

    let info = DatasetInfo {
        kind,
        num_classes: 10,
        height,
        width,
        channels,
        num_train_examples: train.len(),
        num_test_examples: test.len(),
    };
    Ok(ImageDataset { info, train, test })
}

fn load_idx_split(root: &Path, prefix: &str) -> anyhow::Result<(Vec<RawRecord>, usize, usize)> {
    let images_path = resolve_idx_path(root, prefix, "images-idx3-ubyte")?;
    let labels_path = resolve_idx_path(root, prefix, "labels-idx1-ubyte")?;

    let image_bytes = fs::read(&images_path)
        .with_context(|| format!("Failed to read IDX images: {}", images_path.display()))?;
    let label_bytes = fs::read(&labels_path)
        .with_context(|| format!("Failed to read IDX labels: {}", labels_path.display()))?;

    let (rows, cols, pixels) = parse_idx_images(&image_bytes)
        .with_context(|| format!("Invalid IDX image file: {}", images_path.display()))?;
    let labels = parse_idx_labels(&label_bytes)
        .with_context(|| format!("Invalid IDX label file: {}", labels_path.display()))?;

    let image_len = rows * cols;
    let count = pixels.len() / image_len;
    if count != labels.len() {
        anyhow::bail!(
            "IDX split {prefix} has {count} images but {} labels",
            labels.len()
        );
    }

    let records = pixels
        .chunks_exact(image_len)
        .zip(labels)
        .map(|(image, label)| RawRecord {
            image: image.to_vec(),
            label: usize::from(label),
        })
        .collect();
    Ok((records, rows, cols))
}

fn resolve_idx_path(root: &Path, prefix: &str, suffix: &str) -> anyhow::Result<PathBuf> {
    let dotted = suffix.replacen('-', ".", 1);
    [format!("{prefix}-{suffix}"), format!("{prefix}-{dotted}")]
        .iter()
        .map(|name| root.join(name))
        .find(|candidate| candidate.exists())
        .with_context(|| format!("Missing {prefix}-{suffix} in {}", root.display()))
}

fn read_be_u32(bytes: &[u8], offset: usize) -> anyhow::Result<u32> {
    let chunk = bytes
        .get(offset..offset + 4)
        .context("Unexpected end of IDX header")?;
    Ok(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// Parse an IDX3 image file into `(rows, cols, pixels)`.
pub fn parse_idx_images(bytes: &[u8]) -> anyhow::Result<(usize, usize, Vec<u8>)> {
    let magic = read_be_u32(bytes, 0)?;
    if magic != IDX_IMAGES_MAGIC {
        anyhow::bail!("Bad IDX image magic number {magic}");
    }
    let count = read_be_u32(bytes, 4)? as usize;
    let rows = read_be_u32(bytes, 8)? as usize;
    let cols = read_be_u32(bytes, 12)? as usize;
    let expected = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .context("IDX header dimensions overflow")?;
    let body = &bytes[16..];
    if body.len() != expected || rows == 0 || cols == 0 {
        anyhow::bail!(
            "IDX image payload has {} bytes, expected {count}x{rows}x{cols}",
            body.len()
        );
    }
    Ok((rows, cols, body.to_vec()))
}

pub fn parse_idx_labels(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let magic = read_be_u32(bytes, 0)?;
    if magic != IDX_LABELS_MAGIC {
        anyhow::bail!("Bad IDX label magic number {magic}");
    }
    let count = read_be_u32(bytes, 4)? as usize;
    let body = &bytes[8..];
    if body.len() != count {
        anyhow::bail!("IDX label payload has {} bytes, expected {count}", body.len());
    }
    Ok(body.to_vec())
}

fn resolve_cifar_dir(root: &Path) -> PathBuf {
    let nested = root.join("cifar-10-batches-bin");
    if nested.is_dir() {
        nested
    } else {
        root.to_path_buf()
    }
}

fn load_cifar_batch(path: &Path) -> anyhow::Result<Vec<RawRecord>> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read CIFAR-10 batch: {}", path.display()))?;
    parse_cifar_records(&bytes)
        .with_context(|| format!("Invalid CIFAR-10 batch: {}", path.display()))
}

/// Each CIFAR-10 record is one label byte followed by 3x32x32 CHW pixels.
pub fn parse_cifar_records(bytes: &[u8]) -> anyhow::Result<Vec<RawRecord>> {
    if bytes.len() % CIFAR_RECORD_BYTES != 0 {
        anyhow::bail!(
            "Batch size {} is not a multiple of {CIFAR_RECORD_BYTES}",
            bytes.len()
        );
    }
    Ok(bytes
        .chunks_exact(CIFAR_RECORD_BYTES)
        .map(|record| RawRecord {
            label: usize::from(record[0]),
            image: record[1..].to_vec(),
        })
        .collect())
}

// --- Preparation ---

/// Map a pixel intensity in `[0, 255]` to `[-1, 1]`.
pub fn normalize_pixel(value: f32) -> f32 {
    value / 127.5 - 1.0
}

pub fn one_hot(label: usize, num_classes: usize) -> anyhow::Result<Vec<f32>> {
    if label >= num_classes {
        anyhow::bail!("Label {label} out of range for {num_classes} classes");
    }
    let mut encoded = vec![0f32; num_classes];
    encoded[label] = 1.0;
    Ok(encoded)
}

#[derive(Debug, Clone)]
pub enum ModelInput {
    Image(Arc<[f32]>),
    ImageWithContext { image: Arc<[f32]>, context: Vec<f32> },
}

impl ModelInput {
    pub fn image(&self) -> &Arc<[f32]> {
        match self {
            Self::Image(image) | Self::ImageWithContext { image, .. } => image,
        }
    }

    pub fn context(&self) -> Option<&[f32]> {
        match self {
            Self::Image(_) => None,
            Self::ImageWithContext { context, .. } => Some(context),
        }
    }
}

/// A training pair. The target is the input image itself.
#[derive(Debug, Clone)]
pub struct Example {
    pub input: ModelInput,
    pub target: Arc<[f32]>,
}

pub fn prepare(record: &RawRecord, info: &DatasetInfo, context: bool) -> anyhow::Result<Example> {
    if record.image.len() != info.image_len() {
        anyhow::bail!(
            "Record has {} pixels, expected {}",
            record.image.len(),
            info.image_len()
        );
    }
    let image: Arc<[f32]> = record
        .image
        .iter()
        .map(|&pixel| normalize_pixel(f32::from(pixel)))
        .collect();

    let input = if context {
        ModelInput::ImageWithContext {
            image: Arc::clone(&image),
            context: one_hot(record.label, info.num_classes)?,
        }
    } else {
        ModelInput::Image(Arc::clone(&image))
    };
    Ok(Example {
        input,
        target: image,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn mnist_info(num_train: usize) -> DatasetInfo {
        DatasetInfo {
            kind: DatasetKind::Mnist,
            num_classes: 10,
            height: 28,
            width: 28,
            channels: 1,
            num_train_examples: num_train,
            num_test_examples: 0,
        }
    }

    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pixelcnn-pp-rs-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub(crate) fn idx_images(count: u32, rows: u32, cols: u32, fill: impl Fn(usize) -> u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        for value in [IDX_IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes.extend((0..(count * rows * cols) as usize).map(fill));
        bytes
    }

    pub(crate) fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn normalizes_pixel_range_to_unit_interval() {
        assert_eq!(normalize_pixel(0.0), -1.0);
        assert_eq!(normalize_pixel(255.0), 1.0);
        assert!(normalize_pixel(127.5).abs() < 1e-6);
        for value in 0..=255u8 {
            let normalized = normalize_pixel(f32::from(value));
            assert!((-1.0..=1.0).contains(&normalized), "{value} -> {normalized}");
        }
    }

    #[test]
    fn prepare_without_context_returns_input_as_target() {
        let info = mnist_info(1);
        let record = RawRecord {
            image: (0..784).map(|i| (i % 256) as u8).collect(),
            label: 3,
        };
        let example = prepare(&record, &info, false).unwrap();
        let ModelInput::Image(image) = &example.input else {
            panic!("expected plain image input");
        };
        assert!(Arc::ptr_eq(image, &example.target));
        assert_eq!(image.len(), 28 * 28);
        assert_eq!(image[0], -1.0);
        assert_eq!(image[255], 1.0);
        assert!(example.input.context().is_none());
    }

    #[test]
    fn prepare_with_context_one_hot_encodes_label() {
        let info = mnist_info(1);
        let record = RawRecord {
            image: vec![255; 784],
            label: 7,
        };
        let example = prepare(&record, &info, true).unwrap();
        let context = example.input.context().expect("context attached");
        assert_eq!(context.len(), 10);
        assert_eq!(context.iter().filter(|&&v| v == 1.0).count(), 1);
        assert_eq!(context.iter().filter(|&&v| v == 0.0).count(), 9);
        assert_eq!(context[7], 1.0);
        assert!(Arc::ptr_eq(example.input.image(), &example.target));
    }

    #[test]
    fn prepare_rejects_out_of_range_label_and_bad_shape() {
        let info = mnist_info(1);
        let bad_label = RawRecord {
            image: vec![0; 784],
            label: 10,
        };
        assert!(prepare(&bad_label, &info, true).is_err());
        assert!(prepare(&bad_label, &info, false).is_ok());
        let bad_shape = RawRecord {
            image: vec![0; 10],
            label: 0,
        };
        assert!(prepare(&bad_shape, &info, false).is_err());
    }

    #[test]
    fn parses_dataset_names() {
        assert_eq!("mnist".parse::<DatasetKind>().unwrap(), DatasetKind::Mnist);
        assert_eq!("CIFAR10".parse::<DatasetKind>().unwrap(), DatasetKind::Cifar10);
        assert_eq!(
            "fashion_mnist".parse::<DatasetKind>().unwrap(),
            DatasetKind::FashionMnist
        );
        assert!("svhn".parse::<DatasetKind>().is_err());
    }

    #[test]
    fn loads_idx_files_from_directory() {
        let dir = scratch_dir("idx");
        fs::write(
            dir.join("train-images-idx3-ubyte"),
            idx_images(3, 4, 4, |i| i as u8),
        )
        .unwrap();
        fs::write(dir.join("train-labels-idx1-ubyte"), idx_labels(&[0, 1, 2])).unwrap();
        fs::write(dir.join("t10k-images.idx3-ubyte"), idx_images(1, 4, 4, |_| 9)).unwrap();
        fs::write(dir.join("t10k-labels.idx1-ubyte"), idx_labels(&[5])).unwrap();

        let dataset = load_dataset(DatasetKind::Mnist, &dir).unwrap();
        assert_eq!(dataset.info.height, 4);
        assert_eq!(dataset.info.width, 4);
        assert_eq!(dataset.info.channels, 1);
        assert_eq!(dataset.info.num_train_examples, 3);
        assert_eq!(dataset.info.num_test_examples, 1);
        assert_eq!(dataset.train[1].image[0], 16);
        assert_eq!(dataset.train[2].label, 2);
        assert_eq!(dataset.test[0].image, vec![9; 16]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_corrupt_idx_payloads() {
        let mut images = idx_images(2, 2, 2, |_| 0);
        images.pop();
        assert!(parse_idx_images(&images).is_err());
        assert!(parse_idx_labels(&idx_images(1, 1, 1, |_| 0)).is_err());
    }

    #[test]
    fn rejects_idx_header_that_overflows() {
        let mut header = Vec::new();
        for value in [IDX_IMAGES_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            header.extend_from_slice(&value.to_be_bytes());
        }
        let err = parse_idx_images(&header).unwrap_err();
        assert!(err.to_string().contains("overflow"), "{err}");
    }

    #[test]
    fn parses_cifar_records() {
        let mut bytes = vec![4u8];
        bytes.extend(std::iter::repeat(200u8).take(CIFAR_RECORD_BYTES - 1));
        bytes.push(9);
        bytes.extend(std::iter::repeat(1u8).take(CIFAR_RECORD_BYTES - 1));
        let records = parse_cifar_records(&bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].label, 4);
        assert_eq!(records[1].label, 9);
        assert_eq!(records[1].image.len(), 3 * 32 * 32);
        assert!(parse_cifar_records(&bytes[1..]).is_err());
    }

    #[test]
    fn truncation_updates_split_sizes() {
        let record = RawRecord {
            image: vec![0; 784],
            label: 0,
        };
        let mut dataset = ImageDataset {
            info: mnist_info(5),
            train: vec![record.clone(); 5],
            test: vec![record; 4],
        };
        dataset.truncate(2, 0);
        assert_eq!(dataset.info.num_train_examples, 2);
        assert_eq!(dataset.info.num_test_examples, 4);
    }
}
