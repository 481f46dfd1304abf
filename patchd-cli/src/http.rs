//! HTTP surface for the distribution service.
//!
//! Request path: CORS -> compression -> `log_request` -> `authenticate` ->
//! `admit` (rate limit) -> handler. `/health` sits outside the gate and the
//! limiter. CORS answers preflight requests before they reach the gate.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::header::{
    AUTHORIZATION, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
    IF_NONE_MATCH, RETRY_AFTER, WWW_AUTHENTICATE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::compression::predicate::{DefaultPredicate, NotForContentType, Predicate};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};

use patchd_core::ratelimit::{RateLimited, RateLimiter};
use patchd_core::reconcile::ClientFileSet;
use patchd_core::service::{Conditional, DistributionService};
use patchd_core::ServiceError;

use crate::auth::{AuthError, Authorizer, Identity};
use crate::config::ANY_ORIGIN;

pub const BUNDLE_ENTRIES: HeaderName = HeaderName::from_static("x-bundle-entries");
pub const BUNDLE_SKIPPED: HeaderName = HeaderName::from_static("x-bundle-skipped");

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DistributionService>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<dyn Authorizer>,
    /// Browser origins allowed by CORS; `*` allows any.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        service: Arc<DistributionService>,
        limiter: Arc<RateLimiter>,
        auth: Arc<dyn Authorizer>,
    ) -> Self {
        Self { service, limiter, auth, allowed_origins: vec![ANY_ORIGIN.to_string()] }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}

/// Everything a request can fail with, mapped onto a status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("admin role required")]
    Forbidden,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Service(ServiceError::Validation(_) | ServiceError::PathViolation(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Service(ServiceError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Service(ServiceError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // bodies stay generic; details go to the log only
        let message = match &self {
            Self::Service(ServiceError::Validation(m)) => m.clone(),
            Self::Service(ServiceError::PathViolation(detail)) => {
                tracing::warn!(detail = %detail, "rejected path traversal attempt");
                "invalid file path".to_string()
            }
            Self::Service(ServiceError::NotFound(_)) => "file not found".to_string(),
            Self::Service(ServiceError::Io(e)) => {
                tracing::error!("request failed: {e:#}");
                "internal server error".to_string()
            }
            Self::RateLimited(_) => "rate limit exceeded".to_string(),
            Self::Unauthorized(_) => "unauthorized".to_string(),
            Self::Forbidden => "forbidden".to_string(),
        };
        let mut resp = (status, Json(json!({ "error": message }))).into_response();
        if let Self::RateLimited(rl) = &self {
            let secs = rl.retry_after.as_secs_f64().ceil().max(1.0) as u64;
            resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Self::Unauthorized(_) = &self {
            resp.headers_mut().insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        resp
    }
}

pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/manifest", get(get_manifest))
        .route("/version", get(get_version))
        .route("/files/batch", post(download_batch))
        .route("/files/*path", get(download_file))
        .route("/verify", post(verify_files))
        .route("/patches/:version", post(create_patch))
        .layer(middleware::from_fn_with_state(state.clone(), admit))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    // JSON is compressed on request; zip bundles and raw downloads go out as is
    let compress = CompressionLayer::new().compress_when(
        DefaultPredicate::new()
            .and(NotForContentType::const_new("application/zip"))
            .and(NotForContentType::const_new("application/octet-stream")),
    );
    let cors = cors_layer(&state.allowed_origins);
    Router::new()
        .route("/health", get(health))
        .merge(gated)
        .layer(middleware::from_fn(log_request))
        .layer(compress)
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow = if origins.is_empty() || origins.iter().any(|o| o == ANY_ORIGIN) {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring unusable CORS origin");
                None
            }
        }))
    };
    CorsLayer::new()
        .allow_origin(allow)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, IF_NONE_MATCH])
        .expose_headers([ETAG, RETRY_AFTER, BUNDLE_ENTRIES, BUNDLE_SKIPPED])
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let resp = next.run(req).await;
    tracing::info!(
        %method,
        %path,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = state.auth.authorize(req.headers())?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

async fn admit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    state.limiter.check(client_ip(&req))?;
    Ok(next.run(req).await)
}

async fn health() -> &'static str {
    "ok"
}

/// Entity tags listed in `If-None-Match`, unquoted, weak prefix dropped.
fn if_none_match(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| {
            let t = t.trim();
            let t = t.strip_prefix("W/").unwrap_or(t);
            t.trim_matches('"').to_string()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// The `ETag` is the manifest version as a quoted entity tag (`"1.0.0"`), the
/// form HTTP caches expect. `If-None-Match` matches on the version whether the
/// client sends it quoted, bare or weak.
async fn get_manifest(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let seen = if_none_match(&headers);
    let seen: Vec<&str> = seen.iter().map(String::as_str).collect();
    let (status, manifest) = match state.service.manifest_if_changed(&seen) {
        Conditional::Unchanged(m) => (StatusCode::NOT_MODIFIED, m),
        Conditional::Modified(m) => (StatusCode::OK, m),
    };

    let mut resp = if status == StatusCode::NOT_MODIFIED {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        Json(manifest.as_ref()).into_response()
    };
    let h = resp.headers_mut();
    h.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    match HeaderValue::from_str(&format!("\"{}\"", manifest.version)) {
        Ok(v) => {
            h.insert(ETAG, v);
        }
        Err(_) => tracing::debug!(version = %manifest.version, "version not usable as an etag"),
    }
    resp
}

async fn get_version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "version": state.service.version() }))
}

async fn download_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let served = state.service.open_file(&path).await?;
    let body = Body::from_stream(ReaderStream::new(served.file));
    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (CONTENT_LENGTH, HeaderValue::from(served.len)),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub files: Vec<String>,
}

async fn download_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Response, ApiError> {
    // a dropped handler (client gone) stops the archive builder between entries
    let cancel = CancellationToken::new();
    let _stop_on_drop = cancel.clone().drop_guard();

    let bundle = state.service.bundle(req.files, cancel).await?;
    if bundle.is_partial() {
        tracing::warn!(
            included = bundle.included.len(),
            skipped = bundle.skipped.len(),
            "serving partial bundle"
        );
    }
    let headers = [
        (CONTENT_TYPE, HeaderValue::from_static("application/zip")),
        (CONTENT_DISPOSITION, HeaderValue::from_static("attachment; filename=\"patch.zip\"")),
        (CONTENT_LENGTH, HeaderValue::from(bundle.len)),
        (BUNDLE_ENTRIES, HeaderValue::from(bundle.included.len())),
        (BUNDLE_SKIPPED, HeaderValue::from(bundle.skipped.len())),
    ];
    let file = tokio::fs::File::from_std(bundle.file);
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

async fn verify_files(
    State(state): State<AppState>,
    Json(client): Json<ClientFileSet>,
) -> Json<patchd_core::reconcile::ReconciliationResult> {
    Json(state.service.verify(&client))
}

async fn create_patch(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(version): Path<String>,
) -> Result<Response, ApiError> {
    if !identity.admin {
        tracing::warn!(subject = %identity.subject, "non-admin attempted patch creation");
        return Err(ApiError::Forbidden);
    }
    tracing::info!(%version, subject = %identity.subject, "creating patch");
    let m = state.service.create_patch(&version).await?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "created", "version": m.version }))).into_response())
}
