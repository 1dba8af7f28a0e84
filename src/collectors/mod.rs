pub mod system;

use crate::state::Sample;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

pub trait ResourceSource: Send {
    fn cpu_utilization(&mut self) -> Result<f64, CollectionError>;
    fn memory_utilization(&mut self) -> Result<f64, CollectionError>;
    fn disk_utilization(&mut self, path: &Path) -> Result<f64, CollectionError>;
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("источник {resource} недоступен: {reason}")]
    Unavailable {
        resource: &'static str,
        reason: String,
    },
    #[error("некорректное значение {resource}: {value}")]
    Malformed { resource: &'static str, value: f64 },
}

pub struct Sampler {
    source: Box<dyn ResourceSource>,
    disk_path: PathBuf,
    epoch: Instant,
}

impl Sampler {
    pub fn new(source: Box<dyn ResourceSource>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            disk_path: disk_path.into(),
            epoch: Instant::now(),
        }
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }

    pub fn sample(&mut self) -> Result<Sample, CollectionError> {
        let cpu_percent = checked_percent("cpu", self.source.cpu_utilization()?)?;
        let mem_percent = checked_percent("memory", self.source.memory_utilization()?)?;
        let disk_percent = checked_percent(
            "disk",
            self.source.disk_utilization(&self.disk_path)?,
        )?;

        Ok(Sample {
            monotonic: self.epoch.elapsed(),
            wall_clock: Utc::now(),
            cpu_percent,
            mem_percent,
            disk_percent,
        })
    }
}

fn checked_percent(resource: &'static str, value: f64) -> Result<f64, CollectionError> {
    if !value.is_finite() || value < 0.0 {
        return Err(CollectionError::Malformed { resource, value });
    }
    Ok(value.clamp(0.0, 100.0))
}
