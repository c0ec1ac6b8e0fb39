use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;

use crate::train::EpochLogs;

#[derive(Debug, Serialize)]
struct ScalarEvent<'a> {
    wall_time: f64,
    step: usize,
    tag: &'a str,
    value: f64,
}

/// Scalar summaries for a run: one JSON object per line in `scalars.jsonl`,
/// plus an `epochs.csv` table.
pub struct SummaryWriter {
    scalars: BufWriter<File>,
    csv_path: PathBuf,
}

impl SummaryWriter {
    pub fn new(log_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed creating log directory: {}", log_dir.display()))?;

        let scalars_path = log_dir.join("scalars.jsonl");
        let scalars = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&scalars_path)
            .with_context(|| format!("Failed opening {}", scalars_path.display()))?;

        let csv_path = log_dir.join("epochs.csv");
        if !csv_path.exists() {
            let mut f = File::create(&csv_path)
                .with_context(|| format!("Failed creating {}", csv_path.display()))?;
            writeln!(f, "epoch,loss,bpd,val_loss,val_bpd,lr,epoch_seconds")?;
            tracing::debug!("Created epoch CSV: {}", csv_path.display());
        }

        Ok(Self {
            scalars: BufWriter::new(scalars),
            csv_path,
        })
    }

    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        let event = ScalarEvent {
            wall_time: Utc::now().timestamp_millis() as f64 / 1000.0,
            step,
            tag,
            value,
        };
        serde_json::to_writer(&mut self.scalars, &event)?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }

    pub fn epoch(&mut self, logs: &EpochLogs) -> anyhow::Result<()> {
        let step = logs.epoch;
        self.scalar("epoch/loss", logs.loss, step)?;
        self.scalar("epoch/bpd", logs.bpd, step)?;
        self.scalar("epoch/val_loss", logs.val_loss, step)?;
        self.scalar("epoch/val_bpd", logs.val_bpd, step)?;
        self.scalar("epoch/learning_rate", logs.lr, step)?;
        self.flush()?;

        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Failed opening {}", self.csv_path.display()))?;
        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{:.6},{:.8},{:.1}",
            logs.epoch,
            logs.loss,
            logs.bpd,
            logs.val_loss,
            logs.val_bpd,
            logs.lr,
            logs.epoch_seconds
        )?;
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.scalars.flush().context("Failed flushing scalar summaries")
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.scalars.flush();
    }
}
