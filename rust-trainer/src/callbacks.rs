use std::path::PathBuf;

use candle_core::{DType, Tensor};
use candle_nn::Optimizer;

use crate::config::DecayMode;
use crate::preview::{save_sample_grid, GridShape};
use crate::schedule::LrSchedule;
use crate::summary::SummaryWriter;
use crate::train::{BatchLogs, EpochLogs, TrainerState};

/// Observer hooks invoked by the fit loop. Epoch indices in `TrainerState` are
/// zero-based.
pub trait Callback {
    fn on_train_begin(&mut self, _state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_batch_begin(&mut self, _state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_batch_end(
        &mut self,
        _state: &mut TrainerState<'_>,
        _logs: &BatchLogs,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _state: &mut TrainerState<'_>,
        _logs: &EpochLogs,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs callbacks in registration order.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn Callback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: impl Callback + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }
}

impl Callback for CallbackList {
    fn on_train_begin(&mut self, state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        self.callbacks
            .iter_mut()
            .try_for_each(|cb| cb.on_train_begin(state))
    }

    fn on_epoch_begin(&mut self, state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        self.callbacks
            .iter_mut()
            .try_for_each(|cb| cb.on_epoch_begin(state))
    }

    fn on_batch_begin(&mut self, state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        self.callbacks
            .iter_mut()
            .try_for_each(|cb| cb.on_batch_begin(state))
    }

    fn on_batch_end(&mut self, state: &mut TrainerState<'_>, logs: &BatchLogs) -> anyhow::Result<()> {
        self.callbacks
            .iter_mut()
            .try_for_each(|cb| cb.on_batch_end(state, logs))
    }

    fn on_epoch_end(&mut self, state: &mut TrainerState<'_>, logs: &EpochLogs) -> anyhow::Result<()> {
        self.callbacks
            .iter_mut()
            .try_for_each(|cb| cb.on_epoch_end(state, logs))
    }

    fn on_train_end(&mut self, state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        self.callbacks
            .iter_mut()
            .try_for_each(|cb| cb.on_train_end(state))
    }
}

/// Sets the optimizer learning rate from an [`LrSchedule`].
pub struct LrScheduler {
    schedule: LrSchedule,
}

impl LrScheduler {
    pub fn new(schedule: LrSchedule) -> Self {
        Self { schedule }
    }
}

impl LrScheduler {
    fn apply(&self, state: &mut TrainerState<'_>) -> f64 {
        let lr = self.schedule.rate(state.epoch, state.global_step);
        state.optimizer.set_learning_rate(lr);
        lr
    }
}

impl Callback for LrScheduler {
    fn on_epoch_begin(&mut self, state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        if self.schedule.mode == DecayMode::Epoch {
            let lr = self.apply(state);
            tracing::info!(epoch = state.epoch + 1, lr, "learning rate scheduled");
        }
        Ok(())
    }

    fn on_batch_begin(&mut self, state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        if self.schedule.mode == DecayMode::Step {
            self.apply(state);
        }
        Ok(())
    }
}

/// Writes scalar summaries every `log_every` steps and at every epoch end.
pub struct SummaryLogger {
    writer: SummaryWriter,
    log_every: usize,
}

impl SummaryLogger {
    pub fn new(writer: SummaryWriter, log_every: usize) -> Self {
        Self { writer, log_every }
    }
}

impl Callback for SummaryLogger {
    fn on_batch_end(&mut self, _state: &mut TrainerState<'_>, logs: &BatchLogs) -> anyhow::Result<()> {
        if self.log_every > 0 && logs.step % self.log_every == 0 {
            self.writer.scalar("train/loss", logs.loss, logs.step)?;
            self.writer.scalar("train/bpd", logs.bpd, logs.step)?;
            self.writer.scalar("train/learning_rate", logs.lr, logs.step)?;
            tracing::debug!(
                step = logs.step,
                loss = logs.loss,
                bpd = logs.bpd,
                "train step"
            );
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, _state: &mut TrainerState<'_>, logs: &EpochLogs) -> anyhow::Result<()> {
        self.writer.epoch(logs)
    }

    fn on_train_end(&mut self, _state: &mut TrainerState<'_>) -> anyhow::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone)]
pub struct SamplePlotConfig {
    pub dir: PathBuf,
    pub every: usize,
    pub nex: usize,
    /// Conditional models get one grid row per class.
    pub num_classes: Option<usize>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

/// Periodically draws samples from the model and saves them as a PNG grid.
pub struct SamplePlotter {
    cfg: SamplePlotConfig,
}

impl SamplePlotter {
    pub fn new(cfg: SamplePlotConfig) -> Self {
        Self { cfg }
    }

    /// One-hot contexts for `nex` samples of each class, grouped by class.
    pub fn synthetic_contexts(num_classes: usize, nex: usize) -> Vec<f32> {
        let mut contexts = vec![0f32; num_classes * nex * num_classes];
        for row in 0..num_classes * nex {
            contexts[row * num_classes + row / nex] = 1.0;
        }
        contexts
    }

    fn grid_shape(&self) -> GridShape {
        let rows = self.cfg.num_classes.unwrap_or(self.cfg.nex);
        GridShape {
            rows,
            cols: self.cfg.nex,
            channels: self.cfg.channels,
            height: self.cfg.height,
            width: self.cfg.width,
        }
    }
}

impl Callback for SamplePlotter {
    fn on_epoch_end(&mut self, state: &mut TrainerState<'_>, _logs: &EpochLogs) -> anyhow::Result<()> {
        let epoch = state.epoch + 1;
        if self.cfg.every == 0 || epoch % self.cfg.every != 0 || self.cfg.nex == 0 {
            return Ok(());
        }

        let shape = self.grid_shape();
        let count = shape.rows * shape.cols;
        let context = match self.cfg.num_classes {
            Some(classes) => Some(Tensor::from_vec(
                Self::synthetic_contexts(classes, self.cfg.nex),
                (count, classes),
                state.device,
            )?),
            None => None,
        };

        tracing::info!(epoch, count, "sampling from model");
        let samples = state
            .model
            .sample(
                count,
                self.cfg.height,
                self.cfg.width,
                context.as_ref(),
                state.device,
            )?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let path = self.cfg.dir.join(format!("epoch_{epoch:04}.png"));
        save_sample_grid(&path, &samples, shape)?;
        tracing::info!("Saved samples to {}", path.display());
        Ok(())
    }
}
