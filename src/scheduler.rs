use crate::alerts::{AlertEngine, AlertEvent};
use crate::collectors::{CollectionError, Sampler};
use crate::metrics::Metrics;
use crate::segment::{LogStats, SampleLog, WriteError};
use crate::sinks::AlertSink;
use crate::state::{Sample, SharedRing, SharedStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type SharedLog = Arc<Mutex<Box<dyn SampleLog>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Sampling,
    Persisting,
    Evaluating,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TickOutcome {
    Completed { alerts: usize },
    PersistFailed { error: String, alerts: usize },
    CollectionFailed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub seq: u64,
    pub started_at: DateTime<Utc>,
    pub lateness_ms: u64,
    pub skipped_before: u64,
    pub duration_ms: u64,
    pub outcome: TickOutcome,
}

pub struct Collector {
    sampler: Arc<std::sync::Mutex<Sampler>>,
    log: SharedLog,
    ring: SharedRing,
    engine: AlertEngine,
    sinks: Vec<Arc<dyn AlertSink>>,
    metrics: Arc<Metrics>,
    status: SharedStatus,
    write_timeout: Duration,
    rotations_seen: u64,
}

impl Collector {
    pub fn new(
        sampler: Sampler,
        log: SharedLog,
        ring: SharedRing,
        engine: AlertEngine,
        metrics: Arc<Metrics>,
        status: SharedStatus,
    ) -> Self {
        Self {
            sampler: Arc::new(std::sync::Mutex::new(sampler)),
            log,
            ring,
            engine,
            sinks: Vec::new(),
            metrics,
            status,
            write_timeout: Duration::from_secs(2),
            rotations_seen: 0,
        }
    }

    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let grace = self.write_timeout;
        let mut seq = 0_u64;
        let mut last_run: Option<Instant> = None;
        let mut busy_until: Option<Instant> = None;

        info!(interval_ms = interval.as_millis() as u64, "планировщик запущен");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let scheduled = tokio::select! {
                _ = shutdown.changed() => break,
                scheduled = ticker.tick() => scheduled,
            };

            if busy_until.is_some_and(|end| end > scheduled) {
                debug!("такт пропущен: предыдущий такт превысил интервал");
                continue;
            }
            let skipped = missed_ticks(last_run, scheduled, interval);
            last_run = Some(scheduled);
            if skipped > 0 {
                warn!(skipped, "пропущены такты из-за перегрузки");
            }
            let lateness = Instant::now().saturating_duration_since(scheduled);
            seq += 1;

            let (report, stopping) = {
                let work = self.tick(seq);
                tokio::pin!(work);
                tokio::select! {
                    report = &mut work => (Some(report), false),
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки, завершаем текущий такт");
                        (tokio::time::timeout(grace, &mut work).await.ok(), true)
                    }
                }
            };
            busy_until = Some(Instant::now());

            match report {
                Some(mut report) => {
                    report.lateness_ms = lateness.as_millis() as u64;
                    report.skipped_before = skipped;
                    self.record(report).await;
                }
                None => warn!(seq, "такт прерван: не завершился за отведённое время"),
            }
            if stopping {
                break;
            }
        }

        self.shutdown().await;
    }

    pub async fn tick(&mut self, seq: u64) -> TickReport {
        let started = std::time::Instant::now();
        let started_at = Utc::now();
        let outcome = self.run_tick().await;
        self.set_phase(Phase::Idle).await;

        TickReport {
            seq,
            started_at,
            lateness_ms: 0,
            skipped_before: 0,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
        }
    }

    async fn run_tick(&mut self) -> TickOutcome {
        self.set_phase(Phase::Sampling).await;
        let sample = match self.collect().await {
            Ok(sample) => sample,
            Err(err) => {
                warn!(error = %err, "сбор показателей не удался, такт пропущен");
                self.metrics.inc_collect_error();
                return TickOutcome::CollectionFailed {
                    error: err.to_string(),
                };
            }
        };
        self.metrics.observe_sample(&sample);
        {
            let mut ring = self.ring.lock().await;
            ring.push(sample.clone());
            self.metrics.set_buffer(ring.len(), ring.capacity());
        }

        self.set_phase(Phase::Persisting).await;
        let write_error = match self.persist(sample.clone()).await {
            Ok(stats) => {
                self.metrics.set_segment_bytes(stats.segment_bytes);
                self.metrics
                    .add_rotations(stats.rotations.saturating_sub(self.rotations_seen));
                self.rotations_seen = stats.rotations;
                None
            }
            Err(err) => {
                warn!(error = %err, "сэмпл не записан на диск, сохранён только в памяти");
                self.metrics.inc_write_error(err.kind());
                Some(err.to_string())
            }
        };

        self.set_phase(Phase::Evaluating).await;
        let events = {
            let ring = self.ring.lock().await;
            self.engine.evaluate(&ring)
        };
        self.publish_rules().await;
        for event in &events {
            self.metrics.inc_alert_fired(&event.rule_name);
            self.dispatch(event).await;
        }

        debug!(
            cpu = sample.cpu_percent,
            mem = sample.mem_percent,
            disk = sample.disk_percent,
            alerts = events.len(),
            "такт завершён"
        );

        match write_error {
            None => TickOutcome::Completed {
                alerts: events.len(),
            },
            Some(error) => TickOutcome::PersistFailed {
                error,
                alerts: events.len(),
            },
        }
    }

    async fn collect(&self) -> Result<Sample, CollectionError> {
        let sampler = Arc::clone(&self.sampler);
        tokio::task::spawn_blocking(move || match sampler.lock() {
            Ok(mut sampler) => sampler.sample(),
            Err(_) => Err(CollectionError::Unavailable {
                resource: "sampler",
                reason: "состояние сборщика повреждено".to_string(),
            }),
        })
        .await
        .unwrap_or_else(|err| {
            Err(CollectionError::Unavailable {
                resource: "sampler",
                reason: err.to_string(),
            })
        })
    }

    async fn persist(&self, sample: Sample) -> Result<LogStats, WriteError> {
        let mut log = Arc::clone(&self.log)
            .try_lock_owned()
            .map_err(|_| WriteError::Busy)?;
        let task = tokio::task::spawn_blocking(move || {
            log.append(&sample)?;
            Ok(log.stats())
        });

        match tokio::time::timeout(self.write_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(WriteError::Aborted(err.to_string())),
            Err(_) => Err(WriteError::Timeout(self.write_timeout)),
        }
    }

    async fn dispatch(&self, event: &AlertEvent) {
        for sink in &self.sinks {
            if let Err(err) = sink.notify(event).await {
                warn!(sink = sink.name(), rule = %event.rule_name, error = %err, "не удалось доставить оповещение");
                self.metrics.inc_sink_error(sink.name());
            }
        }
    }

    async fn publish_rules(&self) {
        let statuses = self.engine.statuses();
        for rule in &statuses {
            self.metrics.set_rule_firing(&rule.name, rule.state == "firing");
        }
        self.status.write().await.rules = statuses;
    }

    async fn set_phase(&self, phase: Phase) {
        self.status.write().await.phase = phase;
    }

    async fn record(&self, report: TickReport) {
        self.metrics
            .observe_tick(report.duration_ms as f64 / 1000.0, report.skipped_before);
        let mut status = self.status.write().await;
        self.metrics.update_uptime(status.started_at_unix);
        status.ticks_total += 1;
        status.ticks_skipped += report.skipped_before;
        status.last_tick = Some(report);
    }

    async fn shutdown(&self) {
        self.set_phase(Phase::Stopped).await;
        let log = Arc::clone(&self.log);
        let close = async move {
            let mut log = log.lock_owned().await;
            tokio::task::spawn_blocking(move || log.close()).await
        };

        match tokio::time::timeout(self.write_timeout, close).await {
            Ok(Ok(Ok(()))) => info!("журнал закрыт, планировщик остановлен"),
            Ok(Ok(Err(err))) => error!(error = %err, "ошибка при закрытии журнала"),
            Ok(Err(err)) => error!(error = %err, "задача закрытия журнала завершилась аварийно"),
            Err(_) => warn!("журнал не закрыт за отведённое время"),
        }
    }
}

fn missed_ticks(previous: Option<Instant>, scheduled: Instant, interval: Duration) -> u64 {
    let Some(previous) = previous else {
        return 0;
    };
    let gap = scheduled.saturating_duration_since(previous);
    let periods = gap.as_nanos() / interval.as_nanos().max(1);
    (periods as u64).saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRule, Comparison};
    use crate::collectors::fake::FakeSource;
    use crate::sinks::SinkError;
    use crate::state::{Metric, SampleRing, Status};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::RwLock;

    #[derive(Clone, Default)]
    struct MemoryLog {
        written: Arc<std::sync::Mutex<Vec<f64>>>,
        fail_calls: Vec<usize>,
        calls: usize,
        delay: Duration,
        closed: Arc<AtomicBool>,
    }

    impl SampleLog for MemoryLog {
        fn append(&mut self, sample: &Sample) -> Result<(), WriteError> {
            self.calls += 1;
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail_calls.contains(&self.calls) {
                return Err(WriteError::Io {
                    path: "/full/disk.log".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"),
                });
            }
            self.written
                .lock()
                .expect("журнал теста")
                .push(sample.cpu_percent);
            Ok(())
        }

        fn close(&mut self) -> Result<(), WriteError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stats(&self) -> LogStats {
            LogStats::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        rules: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn notify(&self, event: &AlertEvent) -> Result<(), SinkError> {
            self.rules
                .lock()
                .expect("приёмник теста")
                .push(event.rule_name.clone());
            Ok(())
        }
    }

    struct Harness {
        collector: Collector,
        ring: SharedRing,
        log: SharedLog,
        status: SharedStatus,
    }

    fn harness(source: FakeSource, memory_log: MemoryLog, capacity: usize, rules: Vec<AlertRule>) -> Harness {
        let ring: SharedRing = Arc::new(Mutex::new(SampleRing::new(capacity)));
        let boxed: Box<dyn SampleLog> = Box::new(memory_log);
        let log: SharedLog = Arc::new(Mutex::new(boxed));
        let engine = AlertEngine::new(rules);
        let status: SharedStatus = Arc::new(RwLock::new(Status::new(0, engine.statuses())));
        let metrics = Metrics::new().expect("инициализация метрик");
        let collector = Collector::new(
            Sampler::new(Box::new(source), "/"),
            log.clone(),
            ring.clone(),
            engine,
            metrics,
            status.clone(),
        )
        .with_write_timeout(Duration::from_millis(100));
        Harness {
            collector,
            ring,
            log,
            status,
        }
    }

    async fn ring_cpus(ring: &SharedRing) -> Vec<f64> {
        ring.lock().await.iter().map(|s| s.cpu_percent).collect()
    }

    #[tokio::test]
    async fn ring_keeps_latest_samples_and_log_gets_all() {
        let source = FakeSource::new(vec![Ok(1.0), Ok(2.0), Ok(3.0), Ok(4.0)], 10.0, 10.0);
        let memory_log = MemoryLog::default();
        let written = memory_log.written.clone();
        let mut h = harness(source, memory_log, 3, vec![]);

        for seq in 1..=3 {
            let report = h.collector.tick(seq).await;
            assert_eq!(report.outcome, TickOutcome::Completed { alerts: 0 });
        }
        assert_eq!(ring_cpus(&h.ring).await, vec![1.0, 2.0, 3.0]);

        h.collector.tick(4).await;
        assert_eq!(ring_cpus(&h.ring).await, vec![2.0, 3.0, 4.0]);
        assert_eq!(*written.lock().expect("журнал"), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(h.status.read().await.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn write_failure_keeps_sample_in_memory() {
        let source = FakeSource::new(vec![Ok(1.0), Ok(2.0), Ok(3.0)], 10.0, 10.0);
        let memory_log = MemoryLog {
            fail_calls: vec![2],
            ..MemoryLog::default()
        };
        let written = memory_log.written.clone();
        let mut h = harness(source, memory_log, 8, vec![]);

        h.collector.tick(1).await;
        let failed = h.collector.tick(2).await;
        assert!(matches!(failed.outcome, TickOutcome::PersistFailed { .. }));
        assert_eq!(ring_cpus(&h.ring).await, vec![1.0, 2.0]);

        let next = h.collector.tick(3).await;
        assert_eq!(next.outcome, TickOutcome::Completed { alerts: 0 });
        assert_eq!(ring_cpus(&h.ring).await, vec![1.0, 2.0, 3.0]);
        assert_eq!(*written.lock().expect("журнал"), vec![1.0, 3.0]);
    }

    #[tokio::test]
    async fn collection_failure_skips_persist_and_alerting() {
        let source = FakeSource::new(vec![Err("нет данных"), Ok(5.0)], 10.0, 10.0);
        let memory_log = MemoryLog::default();
        let written = memory_log.written.clone();
        let mut h = harness(source, memory_log, 4, vec![]);

        let report = h.collector.tick(1).await;
        assert!(matches!(report.outcome, TickOutcome::CollectionFailed { .. }));
        assert!(h.ring.lock().await.is_empty());
        assert!(written.lock().expect("журнал").is_empty());

        let report = h.collector.tick(2).await;
        assert_eq!(report.outcome, TickOutcome::Completed { alerts: 0 });
        assert_eq!(ring_cpus(&h.ring).await, vec![5.0]);
    }

    #[tokio::test]
    async fn in_flight_write_makes_next_tick_busy() {
        let mut h = harness(FakeSource::steady(1.0, 1.0, 1.0), MemoryLog::default(), 4, vec![]);

        let guard = h.log.clone().lock_owned().await;
        let report = h.collector.tick(1).await;
        match report.outcome {
            TickOutcome::PersistFailed { error, .. } => {
                assert_eq!(error, WriteError::Busy.to_string())
            }
            other => panic!("ожидалась ошибка записи, получено {other:?}"),
        }
        drop(guard);

        assert_eq!(h.ring.lock().await.len(), 1);
        let report = h.collector.tick(2).await;
        assert_eq!(report.outcome, TickOutcome::Completed { alerts: 0 });
    }

    #[tokio::test]
    async fn slow_write_times_out() {
        let memory_log = MemoryLog {
            delay: Duration::from_millis(400),
            ..MemoryLog::default()
        };
        let mut h = harness(FakeSource::steady(1.0, 1.0, 1.0), memory_log, 4, vec![]);

        let report = h.collector.tick(1).await;
        match report.outcome {
            TickOutcome::PersistFailed { error, .. } => {
                assert_eq!(error, WriteError::Timeout(Duration::from_millis(100)).to_string())
            }
            other => panic!("ожидался тайм-аут записи, получено {other:?}"),
        }
        assert_eq!(h.ring.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn sustained_breach_notifies_sinks_once() {
        let rule = AlertRule {
            name: Some("cpu-hot".to_string()),
            metric: Metric::Cpu,
            threshold: 90.0,
            comparison: Comparison::Gt,
            sustained_for: Duration::ZERO,
        };
        let sink = Arc::new(RecordingSink::default());
        let mut h = harness(FakeSource::steady(95.0, 10.0, 10.0), MemoryLog::default(), 4, vec![rule]);
        h.collector = h.collector.with_sinks(vec![sink.clone()]);

        let first = h.collector.tick(1).await;
        assert_eq!(first.outcome, TickOutcome::Completed { alerts: 1 });
        let second = h.collector.tick(2).await;
        assert_eq!(second.outcome, TickOutcome::Completed { alerts: 0 });

        assert_eq!(*sink.rules.lock().expect("приёмник"), vec!["cpu-hot".to_string()]);
        let status = h.status.read().await;
        assert_eq!(status.rules.len(), 1);
        assert_eq!(status.rules[0].state, "firing");
    }

    #[tokio::test]
    async fn run_ticks_until_shutdown_and_closes_log() {
        let memory_log = MemoryLog::default();
        let closed = memory_log.closed.clone();
        let h = harness(FakeSource::steady(3.0, 3.0, 3.0), memory_log, 2, vec![]);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(h.collector.run(Duration::from_millis(20), rx));
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).expect("сигнал остановки");
        task.await.expect("планировщик завершился");

        let status = h.status.read().await;
        assert!(status.ticks_total >= 2, "выполнено тактов: {}", status.ticks_total);
        assert_eq!(status.phase, Phase::Stopped);
        assert!(h.ring.lock().await.len() <= 2);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn overrunning_ticks_are_skipped_not_queued() {
        let mut source = FakeSource::steady(3.0, 3.0, 3.0);
        source.delay = Duration::from_millis(50);
        let h = harness(source, MemoryLog::default(), 16, vec![]);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(h.collector.run(Duration::from_millis(20), rx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).expect("сигнал остановки");
        task.await.expect("планировщик завершился");

        let status = h.status.read().await;
        assert!(status.ticks_total >= 2);
        assert!(status.ticks_skipped >= 1, "ожидались пропущенные такты");
        assert!(status.ticks_total <= 7, "выполнено тактов: {}", status.ticks_total);
    }

    #[test]
    fn missed_ticks_counts_whole_periods() {
        let start = Instant::now();
        let period = Duration::from_secs(1);
        assert_eq!(missed_ticks(None, start, period), 0);
        assert_eq!(missed_ticks(Some(start), start + period, period), 0);
        assert_eq!(missed_ticks(Some(start), start + period * 3, period), 2);
    }
}
