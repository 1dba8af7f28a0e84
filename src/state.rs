use crate::alerts::RuleStatus;
use crate::scheduler::{Phase, TickReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::vec_deque;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

pub type SharedRing = Arc<Mutex<SampleRing>>;
pub type SharedStatus = Arc<RwLock<Status>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Mem,
    Disk,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Cpu => "cpu",
            Metric::Mem => "mem",
            Metric::Disk => "disk",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    #[serde(skip)]
    pub monotonic: Duration,
    pub wall_clock: DateTime<Utc>,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
}

impl Sample {
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Cpu => self.cpu_percent,
            Metric::Mem => self.mem_percent,
            Metric::Disk => self.disk_percent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        debug_assert!(self
            .samples
            .back()
            .map_or(true, |last| last.monotonic <= sample.monotonic));
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn iter(&self) -> Window<'_> {
        Window {
            inner: self.samples.range(..),
        }
    }

    /// Samples no older than `window` before the newest sample.
    pub fn snapshot(&self, window: Duration) -> Window<'_> {
        let Some(latest) = self.samples.back() else {
            return self.iter();
        };
        let cutoff = latest.monotonic.saturating_sub(window);
        let start = self.samples.partition_point(|s| s.monotonic < cutoff);
        Window {
            inner: self.samples.range(start..),
        }
    }

    pub fn after(&self, seen: Option<Duration>) -> Window<'_> {
        let start = match seen {
            Some(seen) => self.samples.partition_point(|s| s.monotonic <= seen),
            None => 0,
        };
        Window {
            inner: self.samples.range(start..),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Window<'a> {
    inner: vec_deque::Iter<'a, Sample>,
}

impl<'a> Iterator for Window<'a> {
    type Item = &'a Sample;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for Window<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for Window<'_> {}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub started_at_unix: i64,
    pub phase: Phase,
    pub ticks_total: u64,
    pub ticks_skipped: u64,
    pub last_tick: Option<TickReport>,
    pub rules: Vec<RuleStatus>,
}

impl Status {
    pub fn new(now_unix: i64, rules: Vec<RuleStatus>) -> Self {
        Self {
            started_at_unix: now_unix,
            phase: Phase::Idle,
            ticks_total: 0,
            ticks_skipped: 0,
            last_tick: None,
            rules,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_at(secs: u64, cpu: f64, mem: f64, disk: f64) -> Sample {
    Sample {
        monotonic: Duration::from_secs(secs),
        wall_clock: DateTime::<Utc>::from_timestamp(1_700_000_000 + secs as i64, 0)
            .unwrap_or_default(),
        cpu_percent: cpu,
        mem_percent: mem,
        disk_percent: disk,
    }
}
