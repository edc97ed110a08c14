use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    api,
    auth::{jwt::JwtAccessTokenService, upgrade::UpgradeAuthenticator},
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, HubError,
    },
    hub::{router::EventRouter, Hub},
    metrics::HubMetrics,
    ws,
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Everything the HTTP surface needs, assembled at the composition root.
#[derive(Clone)]
pub struct AppContext {
    pub hub: Hub,
    pub events: EventRouter,
    pub jwt_service: Arc<JwtAccessTokenService>,
    pub authenticator: UpgradeAuthenticator,
    pub metrics: Arc<HubMetrics>,
}

pub fn build_router(context: AppContext) -> Router {
    let metrics = Arc::clone(&context.metrics);

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics).with_state(Arc::clone(&metrics)))
            .merge(ws::router(context.hub, context.authenticator))
            .merge(api::router(context.jwt_service, context.events)),
        metrics,
    )
}

pub fn apply_middleware(router: Router, metrics: Arc<HubMetrics>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(metrics): State<Arc<HubMetrics>>) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render_prometheus(),
    )
        .into_response()
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            HubError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(
    State(metrics): State<Arc<HubMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics.record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
