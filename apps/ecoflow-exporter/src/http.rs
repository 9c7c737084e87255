use crate::metrics::ExporterCollector;
use crate::state::SharedState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;

#[derive(Clone)]
pub struct HttpState {
    pub state: SharedState,
    pub collector: ExporterCollector,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_metrics(State(http): State<HttpState>) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut guard = http.state.lock().await;
    let rendered = http.collector.render(&mut guard, Utc::now());
    drop(guard);
    let body = rendered.map_err(|err| {
        tracing::error!(error = %err, "failed to render metrics");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    })?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}
