use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::callbacks::{
    Callback, CallbackList, LrScheduler, SamplePlotConfig, SamplePlotter, SummaryLogger,
};
use crate::config::{DeviceArg, TrainConfig};
use crate::dataset::{load_dataset, DatasetInfo, RawRecord};
use crate::model::{discretized_mix_logistic_loss, PixelCnnConfig, PixelCnnPlus};
use crate::pipeline::{BatchStream, StreamConfig};
use crate::schedule::{steps_per_epoch, LrSchedule};
use crate::summary::SummaryWriter;

/// Mutable view of the run handed to callbacks.
pub struct TrainerState<'a> {
    pub model: &'a PixelCnnPlus,
    pub optimizer: &'a mut AdamW,
    pub device: &'a Device,
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchLogs {
    pub step: usize,
    pub loss: f64,
    pub bpd: f64,
    pub lr: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EpochLogs {
    /// One-based epoch number.
    pub epoch: usize,
    pub loss: f64,
    pub bpd: f64,
    pub val_loss: f64,
    pub val_bpd: f64,
    pub lr: f64,
    pub epoch_seconds: f64,
}

#[derive(Debug, Clone, Copy)]
struct PassMetrics {
    loss: f64,
    bpd: f64,
}

/// Nats per sub-pixel to bits per dimension.
pub fn bits_per_dim(nll: f64) -> f64 {
    nll / std::f64::consts::LN_2
}

/// Record streams for one run.
pub struct FitData {
    pub info: Arc<DatasetInfo>,
    pub train: Arc<Vec<RawRecord>>,
    pub test: Arc<Vec<RawRecord>>,
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub buffer: usize,
    pub seed: u64,
    pub context: bool,
}

impl From<&TrainConfig> for FitOptions {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            epochs: cfg.epochs,
            batch_size: cfg.batch,
            buffer: cfg.buffer,
            seed: cfg.seed,
            context: cfg.context,
        }
    }
}

pub fn run_training(cfg: &TrainConfig) -> anyhow::Result<()> {
    cfg.validate()?;

    let kind = cfg.dataset_kind()?;
    let data_dir = cfg.data_dir();
    let mut dataset = load_dataset(kind, &data_dir)
        .with_context(|| format!("Failed to load {kind} from {}", data_dir.display()))?;
    dataset.truncate(cfg.max_train_examples, cfg.max_test_examples);
    let info = dataset.info.clone();
    tracing::info!(
        "Loaded {kind}: train={}, test={}, image={}x{}x{}, classes={}",
        info.num_train_examples,
        info.num_test_examples,
        info.channels,
        info.height,
        info.width,
        info.num_classes
    );
    check_resolution(&info, cfg.downsampling)?;

    let device = resolve_device(cfg.device)?;
    tracing::info!("Using device: {device:?}");

    let run_id = cfg
        .run_name
        .clone()
        .unwrap_or_else(|| Local::now().format("%Y%m%d-%H%M%S").to_string());
    let run_dir = PathBuf::from(&cfg.log_root).join(&run_id);
    let checkpoints_dir = run_dir.join("checkpoints");
    fs::create_dir_all(&checkpoints_dir).with_context(|| {
        format!(
            "Failed creating checkpoint directory: {}",
            checkpoints_dir.display()
        )
    })?;
    write_json(&run_dir.join("config.json"), cfg)?;

    let model_cfg = PixelCnnConfig {
        hidden_dim: cfg.hidden_dim,
        n_res: cfg.n_res,
        n_downsampling: cfg.downsampling,
        dropout_rate: cfg.dropout,
        n_mix: cfg.n_mix,
        channels: info.channels,
        num_classes: cfg.context.then_some(info.num_classes),
    };
    write_json(&run_dir.join("model_config.json"), &model_cfg)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = PixelCnnPlus::new(&model_cfg, vb)?;
    let param_count: usize = varmap.all_vars().iter().map(|var| var.elem_count()).sum();
    tracing::info!("PixelCNN++ ready: {param_count} parameters");

    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let steps = steps_per_epoch(info.num_train_examples, cfg.batch);
    let schedule = LrSchedule::new(cfg.learning_rate, cfg.lr_decay, steps, cfg.decay_mode);
    tracing::info!(
        "Learning rate {} decaying by {:.6} per epoch ({} steps/epoch, {:?} mode)",
        cfg.learning_rate,
        schedule.epoch_decay_rate(),
        steps,
        cfg.decay_mode
    );

    let mut callbacks = CallbackList::new();
    callbacks.push(SummaryLogger::new(
        SummaryWriter::new(&run_dir)?,
        cfg.log_every_batches,
    ));
    callbacks.push(SamplePlotter::new(SamplePlotConfig {
        dir: run_dir.join("samples"),
        every: cfg.sample_every,
        nex: cfg.nex,
        num_classes: model_cfg.num_classes,
        channels: info.channels,
        height: info.height,
        width: info.width,
    }));
    callbacks.push(LrScheduler::new(schedule));
    tracing::debug!("Registered {} callbacks", callbacks.len());

    let data = FitData {
        info: Arc::new(info),
        train: Arc::new(dataset.train),
        test: Arc::new(dataset.test),
    };
    let history = fit(
        &model,
        &mut optimizer,
        &device,
        &data,
        &FitOptions::from(cfg),
        &mut callbacks,
    )?;

    let last_ckpt = checkpoints_dir.join("last.safetensors");
    varmap
        .save(&last_ckpt)
        .with_context(|| format!("Failed writing checkpoint: {}", last_ckpt.display()))?;
    write_json(&run_dir.join("metrics_history.json"), &history)?;

    if let Some(last) = history.last() {
        tracing::info!(
            "Final epoch {}: val_loss={:.4} val_bpd={:.4}",
            last.epoch,
            last.val_loss,
            last.val_bpd
        );
    }
    tracing::info!("Artifacts written to: {}", run_dir.display());
    Ok(())
}

/// The fit loop: train on shuffled batches, validate in order, and notify
/// callbacks around every epoch and step.
pub fn fit(
    model: &PixelCnnPlus,
    optimizer: &mut AdamW,
    device: &Device,
    data: &FitData,
    opts: &FitOptions,
    callbacks: &mut CallbackList,
) -> anyhow::Result<Vec<EpochLogs>> {
    let mut state = TrainerState {
        model,
        optimizer,
        device,
        epoch: 0,
        global_step: 0,
    };
    let mut history = Vec::with_capacity(opts.epochs);

    callbacks.on_train_begin(&mut state)?;
    for epoch in 0..opts.epochs {
        let epoch_started = Instant::now();
        state.epoch = epoch;
        callbacks.on_epoch_begin(&mut state)?;

        let train_stream = BatchStream::spawn(
            Arc::clone(&data.train),
            Arc::clone(&data.info),
            StreamConfig::train(
                opts.batch_size,
                opts.buffer,
                opts.seed.wrapping_add(epoch as u64),
                opts.context,
            ),
        )?;
        let (train, lr) = train_pass(&mut state, train_stream, callbacks)?;

        let test_stream = BatchStream::spawn(
            Arc::clone(&data.test),
            Arc::clone(&data.info),
            StreamConfig::test(opts.batch_size, opts.context),
        )?;
        let val = evaluate(state.model, test_stream, state.device)?;

        let logs = EpochLogs {
            epoch: epoch + 1,
            loss: train.loss,
            bpd: train.bpd,
            val_loss: val.loss,
            val_bpd: val.bpd,
            lr,
            epoch_seconds: epoch_started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            "Epoch {}/{}: loss={:.4} bpd={:.4} val_loss={:.4} val_bpd={:.4} lr={:.3e} ({:.1}s)",
            logs.epoch,
            opts.epochs,
            logs.loss,
            logs.bpd,
            logs.val_loss,
            logs.val_bpd,
            lr,
            logs.epoch_seconds
        );
        callbacks.on_epoch_end(&mut state, &logs)?;
        history.push(logs);
    }
    callbacks.on_train_end(&mut state)?;

    Ok(history)
}

fn train_pass(
    state: &mut TrainerState<'_>,
    stream: BatchStream,
    callbacks: &mut CallbackList,
) -> anyhow::Result<(PassMetrics, f64)> {
    let progress = ProgressBar::new(stream.num_batches() as u64);
    progress.set_style(progress_style());

    let n_mix = state.model.config().n_mix;
    let mut total_loss = 0f64;
    let mut total_elems = 0usize;
    // Rate the epoch's first step trained with.
    let mut epoch_lr = None;

    for batch in stream {
        let batch = batch?;
        callbacks.on_batch_begin(state)?;
        epoch_lr.get_or_insert(state.optimizer.learning_rate());

        let tensors = batch.to_tensors(state.device)?;
        let params = state
            .model
            .forward_t(&tensors.inputs, tensors.context.as_ref(), true)?;
        let loss = discretized_mix_logistic_loss(&tensors.targets, &params, n_mix)?;
        state.optimizer.backward_step(&loss)?;
        state.global_step += 1;

        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        if !loss_value.is_finite() {
            anyhow::bail!("Loss diverged at step {}: {loss_value}", state.global_step);
        }
        total_loss += loss_value * batch.len as f64;
        total_elems += batch.len;

        let logs = BatchLogs {
            step: state.global_step,
            loss: loss_value,
            bpd: bits_per_dim(loss_value),
            lr: state.optimizer.learning_rate(),
        };
        progress.set_message(format!("loss={:.4} bpd={:.4}", logs.loss, logs.bpd));
        progress.inc(1);
        callbacks.on_batch_end(state, &logs)?;
    }
    progress.finish_and_clear();

    if total_elems == 0 {
        anyhow::bail!("Training split produced no batches");
    }
    let loss = total_loss / total_elems as f64;
    let lr = epoch_lr.unwrap_or_else(|| state.optimizer.learning_rate());
    Ok((
        PassMetrics {
            loss,
            bpd: bits_per_dim(loss),
        },
        lr,
    ))
}

fn evaluate(
    model: &PixelCnnPlus,
    stream: BatchStream,
    device: &Device,
) -> anyhow::Result<PassMetrics> {
    let progress = ProgressBar::new(stream.num_batches() as u64);
    progress.set_style(progress_style());

    let n_mix = model.config().n_mix;
    let mut total_loss = 0f64;
    let mut total_elems = 0usize;
    for batch in stream {
        let batch = batch?;
        let tensors = batch.to_tensors(device)?;
        let params = model.forward_t(&tensors.inputs, tensors.context.as_ref(), false)?;
        let loss = discretized_mix_logistic_loss(&tensors.targets, &params, n_mix)?;
        total_loss += f64::from(loss.to_scalar::<f32>()?) * batch.len as f64;
        total_elems += batch.len;
        progress.inc(1);
    }
    progress.finish_and_clear();

    if total_elems == 0 {
        return Ok(PassMetrics {
            loss: f64::NAN,
            bpd: f64::NAN,
        });
    }
    let loss = total_loss / total_elems as f64;
    Ok(PassMetrics {
        loss,
        bpd: bits_per_dim(loss),
    })
}

/// Every downsampling stage halves the image, and upsampling must restore it.
fn check_resolution(info: &DatasetInfo, downsampling: usize) -> anyhow::Result<()> {
    let factor = 1usize
        .checked_shl(downsampling as u32)
        .context("--downsampling is too large")?;
    if info.height % factor != 0 || info.width % factor != 0 {
        anyhow::bail!(
            "{}x{} images cannot be downsampled {downsampling} times",
            info.height,
            info.width
        );
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed writing {}", path.display()))
}

fn resolve_device(device_arg: DeviceArg) -> anyhow::Result<Device> {
    match device_arg {
        DeviceArg::Auto => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(_) => Ok(Device::Cpu),
        },
        DeviceArg::Cpu => Ok(Device::Cpu),
        DeviceArg::Cuda => {
            let device = Device::cuda_if_available(0)
                .context("CUDA requested with --device cuda, but CUDA is not available")?;
            if !device.is_cuda() {
                anyhow::bail!("CUDA requested with --device cuda, but this build has no CUDA support");
            }
            Ok(device)
        }
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}
