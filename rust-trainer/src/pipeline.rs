use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::dataset::{prepare, DatasetInfo, Example, RawRecord};

/// Iterator adapter with the semantics of a bounded shuffle buffer: keep up to
/// `capacity` pending items and emit one of them uniformly at random.
pub struct ShuffleBuffer<I: Iterator> {
    source: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: StdRng,
}

impl<I: Iterator> ShuffleBuffer<I> {
    pub fn new(source: I, capacity: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            buffer: Vec::with_capacity(capacity),
            capacity,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<I: Iterator> Iterator for ShuffleBuffer<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.len() < self.capacity {
            match self.source.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(index))
    }
}

/// A collated batch. Targets share the input image buffer.
#[derive(Debug, Clone)]
pub struct Batch {
    pub len: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    images: Arc<[f32]>,
    contexts: Option<Vec<f32>>,
    num_classes: usize,
}

pub struct BatchTensors {
    pub inputs: Tensor,
    pub context: Option<Tensor>,
    pub targets: Tensor,
}

impl Batch {
    pub fn from_examples(examples: &[Example], info: &DatasetInfo) -> anyhow::Result<Self> {
        if examples.is_empty() {
            anyhow::bail!("Cannot collate an empty batch");
        }
        let mut images = Vec::with_capacity(examples.len() * info.image_len());
        let with_context = examples[0].input.context().is_some();
        let mut contexts = with_context.then(|| Vec::with_capacity(examples.len() * info.num_classes));

        for example in examples {
            images.extend_from_slice(&example.input.image()[..]);
            match (contexts.as_mut(), example.input.context()) {
                (Some(all), Some(context)) => all.extend_from_slice(context),
                (None, None) => {}
                _ => anyhow::bail!("Batch mixes examples with and without context"),
            }
        }

        Ok(Self {
            len: examples.len(),
            channels: info.channels,
            height: info.height,
            width: info.width,
            images: images.into(),
            contexts,
            num_classes: info.num_classes,
        })
    }

    pub fn inputs(&self) -> &Arc<[f32]> {
        &self.images
    }

    #[cfg(test)]
    pub fn targets(&self) -> &Arc<[f32]> {
        &self.images
    }

    pub fn contexts(&self) -> Option<&[f32]> {
        self.contexts.as_deref()
    }

    pub fn to_tensors(&self, device: &Device) -> anyhow::Result<BatchTensors> {
        let inputs = Tensor::from_slice(
            &self.inputs()[..],
            (self.len, self.channels, self.height, self.width),
            device,
        )
        .context("Failed to build input batch tensor")?;
        let context = match self.contexts() {
            Some(contexts) => Some(
                Tensor::from_slice(contexts, (self.len, self.num_classes), device)
                    .context("Failed to build context batch tensor")?,
            ),
            None => None,
        };
        Ok(BatchTensors {
            targets: inputs.clone(),
            inputs,
            context,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub batch_size: usize,
    /// `None` keeps dataset order.
    pub shuffle_buffer: Option<usize>,
    pub seed: u64,
    pub context: bool,
    pub prefetch: usize,
}

impl StreamConfig {
    pub fn train(batch_size: usize, buffer: usize, seed: u64, context: bool) -> Self {
        Self {
            batch_size,
            shuffle_buffer: Some(buffer),
            seed,
            context,
            prefetch: default_prefetch(),
        }
    }

    pub fn test(batch_size: usize, context: bool) -> Self {
        Self {
            batch_size,
            shuffle_buffer: None,
            seed: 0,
            context,
            prefetch: default_prefetch(),
        }
    }
}

fn default_prefetch() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Batches produced on a background thread and handed over through a bounded
/// channel.
pub struct BatchStream {
    receiver: Option<Receiver<anyhow::Result<Batch>>>,
    handle: Option<JoinHandle<()>>,
    num_batches: usize,
}

impl BatchStream {
    pub fn spawn(
        records: Arc<Vec<RawRecord>>,
        info: Arc<DatasetInfo>,
        cfg: StreamConfig,
    ) -> anyhow::Result<Self> {
        if cfg.batch_size == 0 {
            anyhow::bail!("Batch size must be > 0");
        }
        let num_batches = records.len().div_ceil(cfg.batch_size);
        let (sender, receiver) = mpsc::sync_channel(cfg.prefetch.max(1));
        let handle = thread::Builder::new()
            .name("batch-prefetch".to_string())
            .spawn(move || produce_batches(&records, &info, &cfg, &sender))
            .context("Failed to spawn prefetch thread")?;
        Ok(Self {
            receiver: Some(receiver),
            handle: Some(handle),
            num_batches,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for BatchStream {
    type Item = anyhow::Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        // Unblocks a producer waiting on a full channel.
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn produce_batches(
    records: &[RawRecord],
    info: &DatasetInfo,
    cfg: &StreamConfig,
    sender: &SyncSender<anyhow::Result<Batch>>,
) {
    let order: Box<dyn Iterator<Item = usize>> = match cfg.shuffle_buffer {
        Some(buffer) => Box::new(ShuffleBuffer::new(0..records.len(), buffer, cfg.seed)),
        None => Box::new(0..records.len()),
    };

    let mut pending = Vec::with_capacity(cfg.batch_size);
    for index in order {
        pending.push(index);
        if pending.len() == cfg.batch_size {
            let batch = prepare_batch(records, info, &pending, cfg.context);
            pending.clear();
            if sender.send(batch).is_err() {
                return;
            }
        }
    }
    if !pending.is_empty() {
        let _ = sender.send(prepare_batch(records, info, &pending, cfg.context));
    }
}

fn prepare_batch(
    records: &[RawRecord],
    info: &DatasetInfo,
    indices: &[usize],
    context: bool,
) -> anyhow::Result<Batch> {
    let examples = indices
        .par_iter()
        .map(|&index| prepare(&records[index], info, context))
        .collect::<anyhow::Result<Vec<Example>>>()?;
    Batch::from_examples(&examples, info)
}
