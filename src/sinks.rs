use crate::alerts::AlertEvent;
use crate::config::SinkConfig;
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("не удалось записать событие в {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("не удалось сериализовать событие: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("ошибка отправки webhook: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, event: &AlertEvent) -> Result<(), SinkError>;
}

pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<(), SinkError> {
        warn!(
            rule = %event.rule_name,
            metric = %event.rule.metric,
            value = event.triggering_sample.value(event.rule.metric),
            first_breach = %event.first_breach_time.to_rfc3339(),
            "сработало правило: {}",
            event.summary()
        );
        Ok(())
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AlertSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let io_err = |source| SinkError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

pub struct WebhookSink {
    client: Client,
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<(), SinkError> {
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub fn build_sinks(configs: &[SinkConfig]) -> Vec<Arc<dyn AlertSink>> {
    let client = Client::builder()
        .user_agent(concat!("sysmond/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new());

    configs
        .iter()
        .map(|cfg| -> Arc<dyn AlertSink> {
            match cfg {
                SinkConfig::Log => Arc::new(LogSink),
                SinkConfig::File { path } => Arc::new(FileSink::new(path.clone())),
                SinkConfig::Webhook { url, timeout } => {
                    Arc::new(WebhookSink::new(client.clone(), url.clone(), *timeout))
                }
            }
        })
        .collect()
}
