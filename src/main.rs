mod alerts;
mod collectors;
mod config;
mod http;
mod metrics;
mod scheduler;
mod segment;
mod sinks;
mod state;

use alerts::AlertEngine;
use axum::serve;
use clap::Parser;
use collectors::system::SysinfoSource;
use collectors::Sampler;
use config::Config;
use metrics::{now_unix, Metrics};
use scheduler::{Collector, SharedLog};
use segment::{LogRecord, SampleLog, SegmentPolicy, SegmentWriter};
use state::{SampleRing, SharedRing, SharedStatus, Status};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Parser, Debug)]
#[command(name = "sysmond")]
#[command(version)]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Take a single sample, append it, print it and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if let Some(dir) = cli.log_dir {
        cfg.log_dir = dir;
    }

    let (writer, recovery) =
        match SegmentWriter::open(&cfg.log_dir, SegmentPolicy::from_config(&cfg)) {
            Ok(opened) => opened,
            Err(err) => {
                error!(error = %err, "не удалось открыть журнал сэмплов");
                std::process::exit(1);
            }
        };
    if let Some(report) = recovery {
        match &report.corruption {
            Some(corrupt) => warn!(
                segment = %report.path.display(),
                records = report.records,
                error = %corrupt,
                "хвост сегмента повреждён и отброшен"
            ),
            None => info!(
                segment = %report.path.display(),
                records = report.records,
                "продолжаем запись в существующий сегмент"
            ),
        }
    }
    info!(
        segment = %writer.path().display(),
        seq = writer.seq(),
        bytes = writer.len_bytes(),
        "журнал сэмплов открыт"
    );

    let sampler = Sampler::new(
        Box::new(SysinfoSource::new(cfg.cpu_window)),
        cfg.disk_path.clone(),
    );

    if cli.once {
        let code = tokio::task::spawn_blocking(move || run_once(sampler, writer))
            .await
            .unwrap_or_else(|err| {
                error!(error = %err, "задача однократного сбора завершилась аварийно");
                1
            });
        std::process::exit(code);
    }

    info!(
        interval_secs = cfg.interval_seconds,
        buffer_capacity = cfg.buffer_capacity,
        log_dir = %cfg.log_dir.display(),
        disk_path = %sampler.disk_path().display(),
        rules = cfg.rules.len(),
        "запуск sysmond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let engine = AlertEngine::new(cfg.rules.clone());
    let ring: SharedRing = Arc::new(Mutex::new(SampleRing::new(cfg.buffer_capacity)));
    let status: SharedStatus = Arc::new(RwLock::new(Status::new(now_unix(), engine.statuses())));
    let boxed: Box<dyn SampleLog> = Box::new(writer);
    let log: SharedLog = Arc::new(Mutex::new(boxed));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = cfg.listen.clone().map(|listen| {
        let app = http::build_router(metrics.clone(), ring.clone(), status.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };
            info!(listen = %addr, "HTTP-сервер запущен");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    });

    let collector = Collector::new(sampler, log, ring, engine, metrics, status)
        .with_sinks(sinks::build_sinks(&cfg.sinks))
        .with_write_timeout(cfg.write_timeout);
    let collector_task = tokio::spawn(collector.run(cfg.interval(), shutdown_rx));

    wait_for_shutdown().await;
    let _ = shutdown_tx.send(true);

    if let Err(err) = collector_task.await {
        error!(error = %err, "задача сбора завершилась аварийно");
    }
    if let Some(task) = http_task {
        let _ = task.await;
    }
    info!("sysmond остановлен");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<Config, config::ConfigError> {
    match path {
        Some(path) => Config::load_from_file(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load_from_file(DEFAULT_CONFIG_PATH)
        }
        None => {
            info!("файл конфигурации не найден, используются значения по умолчанию");
            Ok(Config::default())
        }
    }
}

fn run_once(mut sampler: Sampler, mut writer: SegmentWriter) -> i32 {
    let sample = match sampler.sample() {
        Ok(sample) => sample,
        Err(err) => {
            error!(error = %err, "сбор показателей не удался");
            return 1;
        }
    };
    if let Err(err) = writer.append(&sample) {
        error!(error = %err, "не удалось записать сэмпл");
        return 1;
    }
    println!("{}", LogRecord::from(&sample));
    if let Err(err) = writer.close() {
        error!(error = %err, "ошибка при закрытии журнала");
        return 1;
    }
    0
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            error!(error = %err, "не удалось дождаться Ctrl+C");
                        }
                        info!("получен Ctrl+C, выполняется остановка");
                    }
                    _ = term.recv() => info!("получен SIGTERM, выполняется остановка"),
                }
                return;
            }
            Err(err) => warn!(error = %err, "не удалось подписаться на SIGTERM"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");
}
