//! Metrics sinks.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metrics for a single optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Global step after the update
    pub step: u64,
    /// Mean diffusion loss
    pub loss: f64,
    /// Global norm of all gradients before clipping
    pub grad_norm: f64,
    /// Learning rate used for the update
    pub lr: f64,
    /// Whether the gradients were clipped
    pub clipped: bool,
}

/// Receiver for scalar training metrics.
pub trait MetricsSink {
    fn record(&self, step: u64, name: &str, value: f64) -> Result<()>;

    /// Push buffered records out. No-op by default.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    records: Mutex<Vec<(u64, String, f64)>>,
}

impl MemoryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<(u64, String, f64)> {
        self.records.lock().clone()
    }

    /// Values recorded under `name`, with their steps.
    #[must_use]
    pub fn series(&self, name: &str) -> Vec<(u64, f64)> {
        self.records
            .lock()
            .iter()
            .filter(|(_, n, _)| n == name)
            .map(|(s, _, v)| (*s, *v))
            .collect()
    }
}

impl MetricsSink for MemoryMetrics {
    fn record(&self, step: u64, name: &str, value: f64) -> Result<()> {
        self.records.lock().push((step, name.to_string(), value));
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    step: u64,
    name: &'a str,
    value: f64,
}

/// Appends one JSON object per record to a file.
#[derive(Debug)]
pub struct JsonlMetrics {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlMetrics {
    /// Open `path` for appending, creating it if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricsSink for JsonlMetrics {
    fn record(&self, step: u64, name: &str, value: f64) -> Result<()> {
        let line = serde_json::to_string(&JsonRecord { step, name, value })?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Forwards records to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, step: u64, name: &str, value: f64) -> Result<()> {
        tracing::debug!(step, metric = name, value, "metric");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_series() {
        let sink = MemoryMetrics::new();
        sink.record(1, "train_loss", 0.5).unwrap();
        sink.record(1, "learning_rate", 1e-4).unwrap();
        sink.record(2, "train_loss", 0.25).unwrap();

        assert_eq!(sink.records().len(), 3);
        assert_eq!(sink.series("train_loss"), vec![(1, 0.5), (2, 0.25)]);
    }

    #[test]
    fn test_jsonl_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/metrics.jsonl");
        let sink = JsonlMetrics::create(&path).unwrap();
        sink.record(3, "gradient_norm", 1.5).unwrap();
        sink.record(4, "gradient_norm", 0.75).unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 3);
        assert_eq!(lines[1]["name"], "gradient_norm");
        assert_eq!(lines[1]["value"], 0.75);
    }

    #[test]
    fn test_tracing_sink_accepts_records() {
        TracingMetrics.record(1, "train_loss", 0.1).unwrap();
    }
}
