use crate::state::Sample;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub sysmond_cpu_usage_percent: Gauge,
    pub sysmond_memory_usage_percent: Gauge,
    pub sysmond_disk_usage_percent: Gauge,
    pub sysmond_buffer_samples: Gauge,
    pub sysmond_buffer_capacity: Gauge,
    pub sysmond_segment_bytes: Gauge,
    pub sysmond_segment_rotations_total: Counter,
    pub sysmond_ticks_total: Counter,
    pub sysmond_ticks_skipped_total: Counter,
    pub sysmond_tick_duration_seconds: Gauge,
    pub sysmond_last_tick_timestamp_seconds: Gauge,
    pub sysmond_collect_errors_total: Counter,
    pub sysmond_write_errors_total: CounterVec,
    pub sysmond_alerts_fired_total: CounterVec,
    pub sysmond_rule_firing: GaugeVec,
    pub sysmond_sink_errors_total: CounterVec,
    pub sysmond_uptime_seconds: Gauge,
    pub sysmond_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let sysmond_cpu_usage_percent = Gauge::with_opts(opts!(
            "sysmond_cpu_usage_percent",
            "CPU usage of the last sample in percent (0..100)"
        ))?;
        let sysmond_memory_usage_percent = Gauge::with_opts(opts!(
            "sysmond_memory_usage_percent",
            "Memory usage of the last sample in percent (0..100)"
        ))?;
        let sysmond_disk_usage_percent = Gauge::with_opts(opts!(
            "sysmond_disk_usage_percent",
            "Disk usage of the last sample in percent (0..100)"
        ))?;
        let sysmond_buffer_samples = Gauge::with_opts(opts!(
            "sysmond_buffer_samples",
            "Samples currently retained in memory"
        ))?;
        let sysmond_buffer_capacity = Gauge::with_opts(opts!(
            "sysmond_buffer_capacity",
            "Maximum number of samples retained in memory"
        ))?;
        let sysmond_segment_bytes = Gauge::with_opts(opts!(
            "sysmond_segment_bytes",
            "Size of the active log segment in bytes"
        ))?;
        let sysmond_segment_rotations_total = Counter::with_opts(opts!(
            "sysmond_segment_rotations_total",
            "Log segment rotations since start"
        ))?;
        let sysmond_ticks_total =
            Counter::with_opts(opts!("sysmond_ticks_total", "Scheduler ticks executed"))?;
        let sysmond_ticks_skipped_total = Counter::with_opts(opts!(
            "sysmond_ticks_skipped_total",
            "Scheduler ticks skipped because the previous tick overran"
        ))?;
        let sysmond_tick_duration_seconds = Gauge::with_opts(opts!(
            "sysmond_tick_duration_seconds",
            "Wall time spent in the last tick"
        ))?;
        let sysmond_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "sysmond_last_tick_timestamp_seconds",
            "Unix timestamp of the last tick"
        ))?;
        let sysmond_collect_errors_total = Counter::with_opts(opts!(
            "sysmond_collect_errors_total",
            "Ticks where sampling failed"
        ))?;
        let sysmond_write_errors_total = CounterVec::new(
            opts!(
                "sysmond_write_errors_total",
                "Failed sample writes by error kind"
            ),
            &["kind"],
        )?;
        let sysmond_alerts_fired_total = CounterVec::new(
            opts!("sysmond_alerts_fired_total", "Alert events fired by rule"),
            &["rule"],
        )?;
        let sysmond_rule_firing = GaugeVec::new(
            opts!(
                "sysmond_rule_firing",
                "1 while the rule is firing, 0 otherwise"
            ),
            &["rule"],
        )?;
        let sysmond_sink_errors_total = CounterVec::new(
            opts!(
                "sysmond_sink_errors_total",
                "Alert deliveries that failed by sink"
            ),
            &["sink"],
        )?;
        let sysmond_uptime_seconds =
            Gauge::with_opts(opts!("sysmond_uptime_seconds", "Collector uptime in seconds"))?;
        let sysmond_scrape_count_total = Counter::with_opts(opts!(
            "sysmond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &sysmond_cpu_usage_percent)?;
        register(&registry, &sysmond_memory_usage_percent)?;
        register(&registry, &sysmond_disk_usage_percent)?;
        register(&registry, &sysmond_buffer_samples)?;
        register(&registry, &sysmond_buffer_capacity)?;
        register(&registry, &sysmond_segment_bytes)?;
        register(&registry, &sysmond_segment_rotations_total)?;
        register(&registry, &sysmond_ticks_total)?;
        register(&registry, &sysmond_ticks_skipped_total)?;
        register(&registry, &sysmond_tick_duration_seconds)?;
        register(&registry, &sysmond_last_tick_timestamp_seconds)?;
        register(&registry, &sysmond_collect_errors_total)?;
        register(&registry, &sysmond_write_errors_total)?;
        register(&registry, &sysmond_alerts_fired_total)?;
        register(&registry, &sysmond_rule_firing)?;
        register(&registry, &sysmond_sink_errors_total)?;
        register(&registry, &sysmond_uptime_seconds)?;
        register(&registry, &sysmond_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            sysmond_cpu_usage_percent,
            sysmond_memory_usage_percent,
            sysmond_disk_usage_percent,
            sysmond_buffer_samples,
            sysmond_buffer_capacity,
            sysmond_segment_bytes,
            sysmond_segment_rotations_total,
            sysmond_ticks_total,
            sysmond_ticks_skipped_total,
            sysmond_tick_duration_seconds,
            sysmond_last_tick_timestamp_seconds,
            sysmond_collect_errors_total,
            sysmond_write_errors_total,
            sysmond_alerts_fired_total,
            sysmond_rule_firing,
            sysmond_sink_errors_total,
            sysmond_uptime_seconds,
            sysmond_scrape_count_total,
        }))
    }

    pub fn observe_sample(&self, sample: &Sample) {
        self.sysmond_cpu_usage_percent.set(sample.cpu_percent);
        self.sysmond_memory_usage_percent.set(sample.mem_percent);
        self.sysmond_disk_usage_percent.set(sample.disk_percent);
    }

    pub fn set_buffer(&self, len: usize, capacity: usize) {
        self.sysmond_buffer_samples.set(len as f64);
        self.sysmond_buffer_capacity.set(capacity as f64);
    }

    pub fn set_segment_bytes(&self, bytes: u64) {
        self.sysmond_segment_bytes.set(bytes as f64);
    }

    pub fn add_rotations(&self, count: u64) {
        if count > 0 {
            self.sysmond_segment_rotations_total.inc_by(count as f64);
        }
    }

    pub fn observe_tick(&self, duration_secs: f64, skipped: u64) {
        self.sysmond_ticks_total.inc();
        if skipped > 0 {
            self.sysmond_ticks_skipped_total.inc_by(skipped as f64);
        }
        self.sysmond_tick_duration_seconds.set(duration_secs);
        self.sysmond_last_tick_timestamp_seconds
            .set(now_unix() as f64);
    }

    pub fn inc_collect_error(&self) {
        self.sysmond_collect_errors_total.inc();
    }

    pub fn inc_write_error(&self, kind: &str) {
        self.sysmond_write_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_alert_fired(&self, rule: &str) {
        self.sysmond_alerts_fired_total
            .with_label_values(&[rule])
            .inc();
    }

    pub fn set_rule_firing(&self, rule: &str, firing: bool) {
        self.sysmond_rule_firing
            .with_label_values(&[rule])
            .set(if firing { 1.0 } else { 0.0 });
    }

    pub fn inc_sink_error(&self, sink: &str) {
        self.sysmond_sink_errors_total
            .with_label_values(&[sink])
            .inc();
    }

    pub fn update_uptime(&self, started_at_unix: i64) {
        let uptime = now_unix().saturating_sub(started_at_unix) as f64;
        self.sysmond_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.sysmond_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
