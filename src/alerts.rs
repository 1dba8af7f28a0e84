use crate::config::duration_str;
use crate::state::{Metric, Sample, SampleRing};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Gt,
    Lt,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Lt => "<",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Gt => "gt",
            Comparison::Lt => "lt",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlertRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub metric: Metric,
    pub threshold: f64,
    pub comparison: Comparison,
    #[serde(default, with = "duration_str")]
    pub sustained_for: Duration,
}

impl AlertRule {
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("{}_{}_{}", self.metric, self.comparison, self.threshold),
        }
    }

    pub fn breached_by(&self, sample: &Sample) -> bool {
        self.comparison
            .holds(sample.value(self.metric), self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleState {
    Normal,
    Breaching {
        since: Duration,
        first_breach_at: DateTime<Utc>,
    },
    Firing {
        since: Duration,
        first_breach_at: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    },
}

impl RuleState {
    pub fn name(&self) -> &'static str {
        match self {
            RuleState::Normal => "normal",
            RuleState::Breaching { .. } => "breaching",
            RuleState::Firing { .. } => "firing",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub rule_name: String,
    pub rule: AlertRule,
    pub triggering_sample: Sample,
    pub first_breach_time: DateTime<Utc>,
}

impl AlertEvent {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} {} {:.1}% держится с {} (текущее значение {:.1}%)",
            self.rule_name,
            self.rule.metric,
            self.rule.comparison.symbol(),
            self.rule.threshold,
            self.first_breach_time.to_rfc3339(),
            self.triggering_sample.value(self.rule.metric),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub name: String,
    pub state: &'static str,
    pub first_breach_at: Option<DateTime<Utc>>,
    pub fired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct TrackedRule {
    name: String,
    rule: AlertRule,
    state: RuleState,
}

#[derive(Debug, Clone)]
pub struct AlertEngine {
    rules: Vec<TrackedRule>,
    last_seen: Option<Duration>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| TrackedRule {
                name: rule.label(),
                rule,
                state: RuleState::Normal,
            })
            .collect();
        Self {
            rules,
            last_seen: None,
        }
    }

    /// An event is returned only on the Breaching -> Firing transition, so a
    /// rule emits at most once per breach episode.
    pub fn evaluate(&mut self, ring: &SampleRing) -> Vec<AlertEvent> {
        if ring.is_empty() || self.rules.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();
        for sample in ring.after(self.last_seen) {
            for tracked in &mut self.rules {
                if let Some(event) = advance(tracked, sample) {
                    events.push(event);
                }
            }
            self.last_seen = Some(sample.monotonic);
        }
        events
    }

    #[cfg(test)]
    pub fn state(&self, name: &str) -> Option<&RuleState> {
        self.rules
            .iter()
            .find(|t| t.name == name)
            .map(|t| &t.state)
    }

    pub fn statuses(&self) -> Vec<RuleStatus> {
        self.rules
            .iter()
            .map(|t| {
                let (first_breach_at, fired_at) = match &t.state {
                    RuleState::Normal => (None, None),
                    RuleState::Breaching {
                        first_breach_at, ..
                    } => (Some(*first_breach_at), None),
                    RuleState::Firing {
                        first_breach_at,
                        fired_at,
                        ..
                    } => (Some(*first_breach_at), Some(*fired_at)),
                };
                RuleStatus {
                    name: t.name.clone(),
                    state: t.state.name(),
                    first_breach_at,
                    fired_at,
                }
            })
            .collect()
    }
}

fn advance(tracked: &mut TrackedRule, sample: &Sample) -> Option<AlertEvent> {
    if !tracked.rule.breached_by(sample) {
        match tracked.state {
            RuleState::Firing { .. } => {
                info!(rule = %tracked.name, value = sample.value(tracked.rule.metric), "условие правила больше не выполняется");
            }
            RuleState::Breaching { .. } => {
                debug!(rule = %tracked.name, "нарушение прервано до срабатывания");
            }
            RuleState::Normal => {}
        }
        tracked.state = RuleState::Normal;
        return None;
    }

    let (since, first_breach_at) = match tracked.state {
        RuleState::Firing { .. } => return None,
        RuleState::Breaching {
            since,
            first_breach_at,
        } => (since, first_breach_at),
        RuleState::Normal => (sample.monotonic, sample.wall_clock),
    };

    if sample.monotonic.saturating_sub(since) < tracked.rule.sustained_for {
        if matches!(tracked.state, RuleState::Normal) {
            debug!(rule = %tracked.name, "начало нарушения порога");
        }
        tracked.state = RuleState::Breaching {
            since,
            first_breach_at,
        };
        return None;
    }

    tracked.state = RuleState::Firing {
        since,
        first_breach_at,
        fired_at: sample.wall_clock,
    };
    Some(AlertEvent {
        rule_name: tracked.name.clone(),
        rule: tracked.rule.clone(),
        triggering_sample: sample.clone(),
        first_breach_time: first_breach_at,
    })
}
