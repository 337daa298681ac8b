//! HTTP/JSON transport
//!
//! # API Endpoints
//!
//! ## POST /admit
//!
//! Decide whether a request may reach the query service.
//!
//! ### Request Body
//!
//! ```json
//! {
//!   "address": "203.0.113.7",
//!   "params": { "key": "11111111-2222-4333-8444-555555555555", "q": "meter_readings" },
//!   "authorization": "Bearer eyJ..."
//! }
//! ```
//!
//! - `params` holds the query-string parameters of the original call
//! - `authorization` is optional and only consulted when `params.key` is absent
//!
//! ### Response
//!
//! The [`AdmissionVerdict`] as JSON. The status code follows the reason code:
//!
//! | code | status |
//! |------|--------|
//! | `admitted` | 200 |
//! | `invalid_shape` | 400 |
//! | `authentication_failed` | 401 |
//! | `tenant_mismatch`, `account_*`, `operation_forbidden` | 403 |
//! | `address_blocked`, `quota_exceeded` | 429 |
//! | `policy_not_found` | 500 |
//! | `service_unavailable` | 503 |
//!
//! ## Administration
//!
//! - `POST /admin/unblock/{address}`: clear an address block (404 if never seen)
//! - `POST /admin/invalidate/{credential}`: drop a cached policy
//! - `GET /admin/addresses/{address}`: ledger snapshot (404 if never seen)
//! - `GET /admin/usage/{credential}`: live sliding-window counts
//! - `GET /admin/blocked`: every blocked address with its block record
//!
//! ## Observability
//!
//! - `GET /stats`: pipeline statistics as JSON
//! - `GET /metrics`: Prometheus text format
//! - `GET /health`: returns "OK" with 200 status

use super::{ServerState, Transport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use turnstile::events::mask_credential;
use turnstile::{AddressSnapshot, BlockRecord, PipelineStats, RawRequest, ReasonCode, Usage};

/// HTTP request format for admission
#[derive(Debug, Serialize, Deserialize)]
pub struct HttpAdmitRequest {
    /// Network address of the original caller
    pub address: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub authorization: Option<String>,
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct HttpErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnblockResponse {
    pub address: String,
    pub unblocked: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    /// Masked credential
    pub credential: String,
    /// Whether a cached policy was dropped
    pub invalidated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockedAddress {
    pub address: String,
    #[serde(flatten)]
    pub record: BlockRecord,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockedListResponse {
    /// Requests per window that trigger a block
    pub threshold: u32,
    pub blocked: Vec<BlockedAddress>,
}

type HttpError = (StatusCode, Json<HttpErrorResponse>);

/// HTTP transport implementation
pub struct HttpTransport {
    addr: SocketAddr,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("Invalid HTTP address {host}:{port}"))?;
        Ok(Self { addr })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(self, state: ServerState) -> Result<()> {
        let mut shutdown = state.pipeline.cache().shutdown_signal();
        let app = router(state);

        tracing::info!("HTTP server listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the router with every endpoint
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/admit", post(handle_admit))
        .route("/admin/unblock/{address}", post(handle_unblock))
        .route("/admin/invalidate/{credential}", post(handle_invalidate))
        .route("/admin/addresses/{address}", get(handle_address))
        .route("/admin/usage/{credential}", get(handle_usage))
        .route("/admin/blocked", get(handle_blocked))
        .route("/stats", get(handle_stats))
        .route("/metrics", get(handle_metrics))
        .route("/health", get(|| async { "OK" }))
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

/// HTTP status for a verdict
pub fn status_for(code: ReasonCode) -> StatusCode {
    match code {
        ReasonCode::Admitted => StatusCode::OK,
        ReasonCode::InvalidShape => StatusCode::BAD_REQUEST,
        ReasonCode::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        ReasonCode::TenantMismatch
        | ReasonCode::AccountInactive
        | ReasonCode::AccountAutoBlocked
        | ReasonCode::AccountSuspended
        | ReasonCode::OperationForbidden => StatusCode::FORBIDDEN,
        ReasonCode::AddressBlocked | ReasonCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ReasonCode::PolicyNotFound => StatusCode::INTERNAL_SERVER_ERROR,
        ReasonCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> HttpError {
    (
        status,
        Json(HttpErrorResponse {
            error: message.into(),
        }),
    )
}

async fn count_requests(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    state.metrics.record_http_request();
    next.run(request).await
}

async fn handle_admit(
    State(state): State<ServerState>,
    payload: Result<Json<HttpAdmitRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            state.metrics.record_malformed();
            tracing::debug!("Rejected admission body: {}", rejection.body_text());
            return error(rejection.status(), rejection.body_text()).into_response();
        }
    };

    let raw = RawRequest {
        params: req.params,
        authorization: req.authorization,
    };

    let started = Instant::now();
    let verdict = state.pipeline.admit(&req.address, &raw).await;
    state
        .metrics
        .record_admission(started.elapsed().as_micros() as u64);

    (status_for(verdict.code), Json(verdict)).into_response()
}

async fn handle_unblock(
    State(state): State<ServerState>,
    Path(address): Path<String>,
) -> Result<Json<UnblockResponse>, HttpError> {
    if !state.pipeline.unblock_address(&address) {
        return Err(error(
            StatusCode::NOT_FOUND,
            format!("Address {address} is not tracked"),
        ));
    }

    state.metrics.record_admin_action();
    tracing::info!(address = %address, "Unblocked via admin API");
    Ok(Json(UnblockResponse {
        address,
        unblocked: true,
    }))
}

async fn handle_invalidate(
    State(state): State<ServerState>,
    Path(credential): Path<String>,
) -> Json<InvalidateResponse> {
    let invalidated = state.pipeline.invalidate_policy(&credential.to_ascii_lowercase());
    state.metrics.record_admin_action();

    Json(InvalidateResponse {
        credential: mask_credential(&credential),
        invalidated,
    })
}

async fn handle_address(
    State(state): State<ServerState>,
    Path(address): Path<String>,
) -> Result<Json<AddressSnapshot>, HttpError> {
    state
        .pipeline
        .address_snapshot(&address)
        .map(Json)
        .ok_or_else(|| {
            error(
                StatusCode::NOT_FOUND,
                format!("Address {address} is not tracked"),
            )
        })
}

async fn handle_usage(
    State(state): State<ServerState>,
    Path(credential): Path<String>,
) -> Json<Usage> {
    Json(state.pipeline.usage(&credential.to_ascii_lowercase()))
}

async fn handle_blocked(State(state): State<ServerState>) -> Json<BlockedListResponse> {
    let abuse = state.pipeline.abuse();
    let mut blocked: Vec<BlockedAddress> = abuse
        .blocked()
        .into_iter()
        .map(|(address, record)| BlockedAddress { address, record })
        .collect();
    blocked.sort_by(|a, b| a.address.cmp(&b.address));

    Json(BlockedListResponse {
        threshold: abuse.threshold(),
        blocked,
    })
}

async fn handle_stats(State(state): State<ServerState>) -> Json<PipelineStats> {
    Json(state.pipeline.stats())
}

async fn handle_metrics(State(state): State<ServerState>) -> impl IntoResponse {
    let body = state.metrics.export_prometheus(&state.pipeline.stats());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
