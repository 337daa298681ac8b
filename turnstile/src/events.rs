//! Security event emission
//!
//! Admission decisions are recorded twice: synchronously as a `tracing` event
//! and asynchronously in a durable [`EventSink`]. The durable path goes through
//! a bounded channel drained by a dedicated worker task, so a slow or failing
//! sink can never delay or change an admission decision.
//!
//! Delivery is at-most-once and best-effort. When the channel is full the
//! event is dropped and counted.

use crate::error::ReasonCode;
use crate::policy::unix_millis;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Number of credential characters kept when masking
const CREDENTIAL_PREFIX_LEN: usize = 8;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// An address crossed the volumetric threshold and was blocked
    AddressBlocked,
    /// A request arrived from an already blocked address
    BlockedAddressRequest,
    InvalidShape,
    AuthenticationFailed,
    PolicyNotFound,
    TenantMismatch,
    AccountInvalid,
    OperationForbidden,
    QuotaExceeded,
    ServiceUnavailable,
    RequestAdmitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Medium,
    High,
}

/// Structured record handed to the durable sink
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub kind: EventKind,
    pub severity: Severity,
    /// Unix milliseconds
    pub timestamp: u64,
    pub source_address: String,
    /// Masked credential, never the full secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ReasonCode>,
    pub description: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(
        kind: EventKind,
        severity: Severity,
        source_address: impl Into<String>,
        description: impl Into<String>,
        now: SystemTime,
    ) -> Self {
        SecurityEvent {
            kind,
            severity,
            timestamp: unix_millis(now),
            source_address: source_address.into(),
            credential: None,
            tenant_id: None,
            operation: None,
            code: None,
            description: description.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Attach a credential; only its prefix is kept
    pub fn with_credential(mut self, credential: &str) -> Self {
        self.credential = Some(mask_credential(credential));
        self
    }

    pub fn with_tenant(mut self, tenant_id: u64) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_code(mut self, code: ReasonCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Keep the first eight characters of a credential
pub fn mask_credential(credential: &str) -> String {
    match credential.char_indices().nth(CREDENTIAL_PREFIX_LEN) {
        Some((cut, _)) => format!("{}...", &credential[..cut]),
        None => credential.to_string(),
    }
}

/// Error reported by an [`EventSink`]
#[derive(Debug, thiserror::Error)]
#[error("event sink failed: {0}")]
pub struct SinkError(pub String);

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError(err.to_string())
    }
}

/// Durable destination for security events
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn record(&self, event: &SecurityEvent) -> Result<(), SinkError>;
}

/// Cheap, cloneable handle for emitting events
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<SecurityEvent>,
    dropped: Arc<AtomicU64>,
}

/// Background task draining the event channel
pub struct EventWorker {
    handle: JoinHandle<()>,
}

impl EventEmitter {
    /// Spawn the event worker and return a handle to feed it
    pub fn spawn(sink: Arc<dyn EventSink>, buffer_size: usize) -> (EventEmitter, EventWorker) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));

        let handle = tokio::spawn(run_worker(rx, sink));

        (
            EventEmitter {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventWorker { handle },
        )
    }

    /// Log the event and queue it for the sink without waiting
    pub fn emit(&self, event: SecurityEvent) {
        log_event(&event);

        if let Err(err) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match err {
                mpsc::error::TrySendError::Full(event) => {
                    tracing::debug!(kind = ?event.kind, "Event channel full, dropping event");
                }
                mpsc::error::TrySendError::Closed(event) => {
                    tracing::debug!(kind = ?event.kind, "Event worker stopped, dropping event");
                }
            }
        }
    }

    /// Events dropped because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventWorker {
    /// Wait until every emitter is gone and the queue is drained
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            tracing::error!("Event worker panicked: {}", e);
        }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<SecurityEvent>, sink: Arc<dyn EventSink>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = sink.record(&event).await {
            tracing::warn!(kind = ?event.kind, "Failed to persist security event: {}", e);
        }
    }

    tracing::info!("Event worker shutting down");
}

fn log_event(event: &SecurityEvent) {
    let credential = event.credential.as_deref().unwrap_or("-");
    match event.severity {
        Severity::High => tracing::warn!(
            target: "turnstile::events",
            kind = ?event.kind,
            address = %event.source_address,
            credential,
            "{}",
            event.description
        ),
        Severity::Medium => tracing::info!(
            target: "turnstile::events",
            kind = ?event.kind,
            address = %event.source_address,
            credential,
            "{}",
            event.description
        ),
        Severity::Info => tracing::debug!(
            target: "turnstile::events",
            kind = ?event.kind,
            address = %event.source_address,
            credential,
            "{}",
            event.description
        ),
    }
}
