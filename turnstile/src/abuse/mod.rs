//! Volumetric abuse tracking per source address
//!
//! Every inbound request is registered here first, before its shape or
//! credential are looked at. An address that sends more than `threshold`
//! requests inside the trailing window is blocked, and stays blocked until an
//! operator clears it, no matter how its traffic evolves afterwards.
//!
//! Block state is written through a [`BlockStore`] so it survives restarts;
//! request ledgers live in memory only. Writes happen on a background thread
//! and never on the caller's.

mod persist;

pub use persist::{BlockRecord, BlockStore, JsonFileBlockStore, MemoryBlockStore, PersistError};

use persist::{BlockCommand, BlockWriter};

use crate::ConcurrentMap;
use crate::events::{EventEmitter, EventKind, SecurityEvent, Severity};
use crate::policy::unix_secs;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Configuration constants
const DEFAULT_THRESHOLD: u32 = 50;
const DEFAULT_WINDOW_SECS: u64 = 60;
const DEFAULT_IDLE_TTL_SECS: u64 = 3600;

/// Request history of one source address
#[derive(Debug)]
pub struct SourceAddressLedger {
    recent: VecDeque<SystemTime>,
    total_requests: u64,
    first_seen: SystemTime,
    last_seen: SystemTime,
    block: Option<BlockRecord>,
}

impl SourceAddressLedger {
    fn new(now: SystemTime) -> Self {
        SourceAddressLedger {
            recent: VecDeque::new(),
            total_requests: 0,
            first_seen: now,
            last_seen: now,
            block: None,
        }
    }

    fn restored(record: BlockRecord) -> Self {
        let first_seen = UNIX_EPOCH + Duration::from_secs(record.first_seen);
        let last_seen = UNIX_EPOCH + Duration::from_secs(record.blocked_at);
        SourceAddressLedger {
            recent: VecDeque::new(),
            total_requests: record.total_requests,
            first_seen,
            last_seen,
            block: Some(record),
        }
    }

    fn prune(&mut self, now: SystemTime, window: Duration) {
        while let Some(oldest) = self.recent.front() {
            if elapsed(*oldest, now) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_in_window(&self, now: SystemTime, window: Duration) -> u32 {
        self.recent
            .iter()
            .filter(|ts| elapsed(**ts, now) < window)
            .count() as u32
    }
}

fn elapsed(earlier: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(earlier).unwrap_or(Duration::ZERO)
}

/// Outcome of registering a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressStatus {
    Clear {
        requests_in_window: u32,
    },
    Blocked {
        reason: String,
        /// True only for the request that triggered the block
        newly_blocked: bool,
    },
}

impl AddressStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, AddressStatus::Blocked { .. })
    }
}

/// Read-only view of a ledger for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct AddressSnapshot {
    pub address: String,
    pub requests_in_window: u32,
    pub total_requests: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<u64>,
}

/// Per-address request ledger and block state
///
/// # Example
///
/// ```
/// use turnstile::AbuseTracker;
/// use std::time::SystemTime;
///
/// let tracker = AbuseTracker::builder().threshold(2).build()?;
/// let now = SystemTime::now();
///
/// assert!(!tracker.register("10.0.0.1", now).is_blocked());
/// assert!(!tracker.register("10.0.0.1", now).is_blocked());
/// assert!(tracker.register("10.0.0.1", now).is_blocked());
/// assert!(tracker.unblock("10.0.0.1"));
/// # Ok::<(), turnstile::abuse::PersistError>(())
/// ```
pub struct AbuseTracker {
    ledgers: ConcurrentMap<String, SourceAddressLedger>,
    threshold: u32,
    window: Duration,
    idle_ttl: Duration,
    writer: BlockWriter,
    events: Option<EventEmitter>,
}

/// Builder for configuring an [`AbuseTracker`]
pub struct AbuseTrackerBuilder {
    threshold: u32,
    window: Duration,
    idle_ttl: Duration,
    store: Option<Arc<dyn BlockStore>>,
    events: Option<EventEmitter>,
}

impl AbuseTracker {
    /// Create a builder with the default threshold of 50 requests per minute
    pub fn builder() -> AbuseTrackerBuilder {
        AbuseTrackerBuilder::default()
    }

    /// Record a request from `address` and report whether it is blocked
    ///
    /// The request that finds `threshold` earlier requests inside the window
    /// triggers the block. Later requests from a blocked address only bump its
    /// counters; the threshold is not evaluated again.
    pub fn register(&self, address: &str, now: SystemTime) -> AddressStatus {
        let (status, new_block) = {
            let mut ledger = self
                .ledgers
                .entry(address.to_string())
                .or_insert_with(|| SourceAddressLedger::new(now));

            ledger.total_requests += 1;
            if now > ledger.last_seen {
                ledger.last_seen = now;
            }

            if let Some(block) = &ledger.block {
                return AddressStatus::Blocked {
                    reason: block.reason.clone(),
                    newly_blocked: false,
                };
            }

            ledger.prune(now, self.window);
            let prior = ledger.recent.len() as u32;
            ledger.recent.push_back(now);

            if prior >= self.threshold {
                let count = prior + 1;
                let record = BlockRecord {
                    reason: format!(
                        "Volumetric abuse: {count} requests in {}",
                        describe_window(self.window)
                    ),
                    blocked_at: unix_secs(now),
                    requests_in_window: count,
                    total_requests: ledger.total_requests,
                    first_seen: unix_secs(ledger.first_seen),
                };
                ledger.block = Some(record.clone());
                // Queued under the entry guard so it cannot overtake an unblock
                self.writer.send(BlockCommand::Insert(address.to_string(), record.clone()));
                (
                    AddressStatus::Blocked {
                        reason: record.reason.clone(),
                        newly_blocked: true,
                    },
                    Some(record),
                )
            } else {
                (
                    AddressStatus::Clear {
                        requests_in_window: prior + 1,
                    },
                    None,
                )
            }
        };

        if let Some(record) = new_block {
            self.on_block(address, &record, now);
        }

        status
    }

    fn on_block(&self, address: &str, record: &BlockRecord, now: SystemTime) {
        tracing::warn!(
            address,
            requests = record.requests_in_window,
            "Address blocked: {}",
            record.reason
        );

        if let Some(events) = &self.events {
            events.emit(
                SecurityEvent::new(
                    EventKind::AddressBlocked,
                    Severity::High,
                    address,
                    record.reason.clone(),
                    now,
                )
                .with_data(serde_json::json!({
                    "block_type": "AUTO_VOLUMETRIC",
                    "requests_in_period": record.requests_in_window,
                    "period_seconds": self.window.as_secs(),
                    "total_requests_lifetime": record.total_requests,
                    "first_seen": record.first_seen,
                })),
            );
        }
    }

    /// Block reason if the address is currently blocked
    pub fn block_reason(&self, address: &str) -> Option<String> {
        self.ledgers
            .get(address)
            .and_then(|ledger| ledger.block.as_ref().map(|b| b.reason.clone()))
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.block_reason(address).is_some()
    }

    /// Clear the block on an address, keeping its ledger
    ///
    /// Returns `false` if the address has never been seen.
    pub fn unblock(&self, address: &str) -> bool {
        let Some(mut ledger) = self.ledgers.get_mut(address) else {
            return false;
        };

        if ledger.block.take().is_some() {
            self.writer.send(BlockCommand::Remove(address.to_string()));
            tracing::info!(address, "Address manually unblocked");
        }
        true
    }

    /// Forget an address entirely, including any block
    pub fn reset(&self, address: &str) -> bool {
        match self.ledgers.remove(address) {
            Some((_, ledger)) => {
                if ledger.block.is_some() {
                    self.writer.send(BlockCommand::Remove(address.to_string()));
                }
                true
            }
            None => false,
        }
    }

    /// Drop unblocked ledgers that have been idle longer than the idle TTL
    pub fn sweep_idle(&self, now: SystemTime) -> usize {
        let before = self.ledgers.len();
        self.ledgers.retain(|_, ledger| {
            ledger.block.is_some() || elapsed(ledger.last_seen, now) < self.idle_ttl
        });
        before.saturating_sub(self.ledgers.len())
    }

    pub fn address_snapshot(&self, address: &str, now: SystemTime) -> Option<AddressSnapshot> {
        self.ledgers.get(address).map(|ledger| AddressSnapshot {
            address: address.to_string(),
            requests_in_window: ledger.count_in_window(now, self.window),
            total_requests: ledger.total_requests,
            first_seen: unix_secs(ledger.first_seen),
            last_seen: unix_secs(ledger.last_seen),
            blocked: ledger.block.is_some(),
            block_reason: ledger.block.as_ref().map(|b| b.reason.clone()),
            blocked_at: ledger.block.as_ref().map(|b| b.blocked_at),
        })
    }

    /// Addresses currently blocked, with their block records
    pub fn blocked(&self) -> Vec<(String, BlockRecord)> {
        self.ledgers
            .iter()
            .filter_map(|entry| {
                entry
                    .block
                    .as_ref()
                    .map(|block| (entry.key().clone(), block.clone()))
            })
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.ledgers
            .iter()
            .filter(|entry| entry.block.is_some())
            .count()
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Wait until every block change so far has reached the block store
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Report blocks through `events` unless an emitter is already set
    pub(crate) fn attach_events(&mut self, events: &EventEmitter) {
        if self.events.is_none() {
            self.events = Some(events.clone());
        }
    }
}

fn describe_window(window: Duration) -> String {
    match window.as_secs() {
        60 => "1 minute".to_string(),
        secs if secs % 60 == 0 => format!("{} minutes", secs / 60),
        secs => format!("{secs} seconds"),
    }
}

impl Default for AbuseTrackerBuilder {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            store: None,
            events: None,
        }
    }
}

impl AbuseTrackerBuilder {
    /// Requests per window an address may send before it is blocked
    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// Length of the trailing window
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// How long an unblocked address may stay silent before its ledger is swept
    pub fn idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Where block state is persisted (in-memory by default)
    pub fn block_store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Emit an event whenever an address gets blocked
    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the tracker, restoring persisted blocks
    pub fn build(self) -> Result<AbuseTracker, PersistError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryBlockStore::new()));

        let ledgers = ConcurrentMap::default();
        let restored = store.load()?;
        if !restored.is_empty() {
            tracing::info!("Restored {} blocked addresses", restored.len());
        }
        for (address, record) in restored {
            ledgers.insert(address, SourceAddressLedger::restored(record));
        }

        Ok(AbuseTracker {
            ledgers,
            threshold: self.threshold,
            window: self.window,
            idle_ttl: self.idle_ttl,
            writer: BlockWriter::spawn(store)?,
            events: self.events,
        })
    }
}
