use crate::metrics::Metrics;
use crate::state::{Sample, SharedRing, SharedStatus, Status};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub ring: SharedRing,
    pub status: SharedStatus,
}

#[derive(Debug, Deserialize)]
pub struct SamplesQuery {
    pub window: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SamplesResponse {
    pub capacity: usize,
    pub count: usize,
    pub samples: Vec<Sample>,
}

pub fn build_router(metrics: Arc<Metrics>, ring: SharedRing, status: SharedStatus) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/samples", get(samples_handler))
        .route("/api/status", get(status_handler))
        .with_state(HttpAppState {
            metrics,
            ring,
            status,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    let started_at = state.status.read().await.started_at_unix;
    state.metrics.update_uptime(started_at);
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn samples_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<SamplesQuery>,
) -> Response {
    let window = match query.window.as_deref().map(humantime::parse_duration) {
        None => None,
        Some(Ok(window)) => Some(window),
        Some(Err(err)) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("некорректный параметр window: {err}"),
            )
                .into_response()
        }
    };

    let ring = state.ring.lock().await;
    let samples: Vec<Sample> = match window {
        Some(window) => ring.snapshot(window).cloned().collect(),
        None => ring.iter().cloned().collect(),
    };
    let capacity = ring.capacity();
    drop(ring);

    Json(SamplesResponse {
        capacity,
        count: samples.len(),
        samples,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: Status,
    pub latest_sample: Option<Sample>,
}

async fn status_handler(State(state): State<HttpAppState>) -> Json<StatusResponse> {
    let latest_sample = state.ring.lock().await.latest().cloned();
    let status = state.status.read().await.clone();
    Json(StatusResponse {
        status,
        latest_sample,
    })
}
