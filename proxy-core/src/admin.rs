//! Admin/scrape HTTP surface: `/healthz` and `/metrics`
//!
//! A small axum app exposing liveness and the Prometheus text exposition,
//! built on the usual middleware stack (trace, timeout, body limit, panic
//! recovery, request-id tracking) but without CORS or compression, which
//! only matter for a browser-facing API — this surface has no such caller.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::error::Result;
use crate::middleware::{request_id_layer, request_id_propagation_layer, sensitive_headers_layer};
use crate::state::AppState;

const MAX_ADMIN_BODY_BYTES: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(5)))
        .layer(RequestBodyLimitLayer::new(MAX_ADMIN_BODY_BYTES))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()).on_response(DefaultOnResponse::new()))
        .layer(sensitive_headers_layer())
        .layer(request_id_propagation_layer())
        .layer(request_id_layer())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Runs the admin server until `shutdown` resolves.
pub async fn run(state: AppState, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = state.config().service.admin_addr.parse().map_err(|e| {
        crate::error::Error::Internal(format!("invalid admin_addr: {e}"))
    })?;
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "admin surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            tracing::info!("admin surface shutting down");
        })
        .await?;

    Ok(())
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.counters().render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_healthz_returns_503_before_any_generation_published() {
        let state = AppState::new(Config::default());
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_renders_prometheus_text() {
        let state = AppState::new(Config::default());
        state.counters().inc(crate::counters::names::DENIED_TOTAL, &[("reason", "test")]);
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
