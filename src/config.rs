use crate::alerts::AlertRule;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    #[serde(default, with = "duration_str::option")]
    pub segment_max_age: Option<Duration>,
    #[serde(default)]
    pub max_segments: Option<usize>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
    #[serde(default = "default_cpu_window", with = "duration_str")]
    pub cpu_window: Duration,
    #[serde(default = "default_write_timeout", with = "duration_str")]
    pub write_timeout: Duration,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Log,
    File {
        path: PathBuf,
    },
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout", with = "duration_str")]
        timeout: Duration,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            buffer_capacity: default_buffer_capacity(),
            segment_max_bytes: default_segment_max_bytes(),
            segment_max_age: None,
            max_segments: None,
            log_dir: default_log_dir(),
            segment_prefix: default_segment_prefix(),
            disk_path: default_disk_path(),
            cpu_window: default_cpu_window(),
            write_timeout: default_write_timeout(),
            listen: None,
            rules: Vec::new(),
            sinks: default_sinks(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_seconds < 1 {
            return Err(ConfigError::Validation(
                "interval_seconds должно быть >= 1".to_string(),
            ));
        }
        if self.buffer_capacity < 1 {
            return Err(ConfigError::Validation(
                "buffer_capacity должно быть >= 1".to_string(),
            ));
        }
        if self.segment_max_bytes < 256 {
            return Err(ConfigError::Validation(
                "segment_max_bytes должно быть >= 256".to_string(),
            ));
        }
        if matches!(self.segment_max_age, Some(age) if age < Duration::from_secs(1)) {
            return Err(ConfigError::Validation(
                "segment_max_age должно быть >= 1s".to_string(),
            ));
        }
        if self.max_segments == Some(0) {
            return Err(ConfigError::Validation(
                "max_segments должно быть >= 1".to_string(),
            ));
        }
        if self.log_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "поле log_dir обязательно".to_string(),
            ));
        }
        if self.segment_prefix.trim().is_empty() || self.segment_prefix.contains(['/', '\\']) {
            return Err(ConfigError::Validation(
                "segment_prefix должен быть непустым именем файла без разделителей пути"
                    .to_string(),
            ));
        }
        if self.cpu_window >= self.interval() {
            return Err(ConfigError::Validation(
                "cpu_window должно быть меньше interval_seconds".to_string(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "write_timeout должно быть > 0".to_string(),
            ));
        }
        if let Some(listen) = &self.listen {
            if SocketAddr::from_str(listen).is_err() {
                return Err(ConfigError::Validation(
                    "поле listen должно быть корректным адресом host:port".to_string(),
                ));
            }
        }

        validate_rules(&self.rules)?;
        validate_sinks(&self.sinks)?;

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_rules(rules: &[AlertRule]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for rule in rules {
        let name = rule.label();
        if !names.insert(name.clone()) {
            return Err(ConfigError::Validation(format!(
                "имя правила '{name}' должно быть уникальным"
            )));
        }
        if !rule.threshold.is_finite() || !(0.0..=100.0).contains(&rule.threshold) {
            return Err(ConfigError::Validation(format!(
                "rules '{name}' threshold должно быть в диапазоне 0..100"
            )));
        }
    }
    Ok(())
}

fn validate_sinks(sinks: &[SinkConfig]) -> Result<(), ConfigError> {
    for sink in sinks {
        match sink {
            SinkConfig::Log => {}
            SinkConfig::File { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Validation(
                        "sinks[file].path не должен быть пустым".to_string(),
                    ));
                }
            }
            SinkConfig::Webhook { url, timeout } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::Validation(format!(
                        "sinks[webhook] url '{url}' должен начинаться с http:// или https://"
                    )));
                }
                if timeout.is_zero() {
                    return Err(ConfigError::Validation(format!(
                        "sinks[webhook] '{url}' timeout должен быть > 0"
                    )));
                }
            }
        }
    }
    Ok(())
}

const fn default_interval_seconds() -> u64 {
    5
}

const fn default_buffer_capacity() -> usize {
    720
}

const fn default_segment_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/sysmond")
}

fn default_segment_prefix() -> String {
    "system_monitor".to_string()
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

const fn default_cpu_window() -> Duration {
    Duration::from_secs(1)
}

const fn default_write_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_webhook_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_sinks() -> Vec<SinkConfig> {
    vec![SinkConfig::Log]
}

pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let text = Option::<String>::deserialize(deserializer)?;
            text.map(|t| humantime::parse_duration(t.trim()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
