//! Sliding-window usage counters
//!
//! Every credential owns a [`UsageWindowSet`]: one ordered timestamp sequence
//! per [`Granularity`]. Sequences are pruned lazily on access, keeping entries
//! for `retention_factor` buckets, and the live count of a granularity is the
//! number of entries inside its trailing bucket.
//!
//! Checking and recording are separate calls so that a request rejected by a
//! later stage never consumes quota.

use crate::ConcurrentMap;
use crate::policy::{AccessPolicy, Granularity};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};


const DEFAULT_RETENTION_FACTOR: u32 = 2;

/// Quota ceiling that a request would cross
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Rate limit exceeded: {ceiling} requests per {granularity} ({tier} tier)")]
pub struct QuotaExceeded {
    pub granularity: Granularity,
    pub ceiling: u32,
    pub observed: u32,
    pub tier: String,
}

/// Live request counts per granularity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
}

impl Usage {
    pub fn get(&self, granularity: Granularity) -> u32 {
        match granularity {
            Granularity::Minute => self.minute,
            Granularity::Hour => self.hour,
            Granularity::Day => self.day,
        }
    }
}

/// Remaining quota per granularity; `None` everywhere for unlimited policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub minute: Option<u32>,
    pub hour: Option<u32>,
    pub day: Option<u32>,
}

/// Timestamps of recorded requests for one credential
#[derive(Debug, Default)]
pub struct UsageWindowSet {
    minute: VecDeque<SystemTime>,
    hour: VecDeque<SystemTime>,
    day: VecDeque<SystemTime>,
}

impl UsageWindowSet {
    fn sequence(&self, granularity: Granularity) -> &VecDeque<SystemTime> {
        match granularity {
            Granularity::Minute => &self.minute,
            Granularity::Hour => &self.hour,
            Granularity::Day => &self.day,
        }
    }

    fn sequence_mut(&mut self, granularity: Granularity) -> &mut VecDeque<SystemTime> {
        match granularity {
            Granularity::Minute => &mut self.minute,
            Granularity::Hour => &mut self.hour,
            Granularity::Day => &mut self.day,
        }
    }

    fn prune(&mut self, now: SystemTime, retention_factor: u32) {
        for granularity in Granularity::ALL {
            let horizon = granularity.bucket() * retention_factor;
            let sequence = self.sequence_mut(granularity);
            while let Some(oldest) = sequence.front() {
                if elapsed(*oldest, now) >= horizon {
                    sequence.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Entries within the trailing bucket; sequences are time ordered
    fn live_count(&self, granularity: Granularity, now: SystemTime) -> u32 {
        let bucket = granularity.bucket();
        self.sequence(granularity)
            .iter()
            .rev()
            .take_while(|ts| elapsed(**ts, now) < bucket)
            .count() as u32
    }

    fn usage(&self, now: SystemTime) -> Usage {
        Usage {
            minute: self.live_count(Granularity::Minute, now),
            hour: self.live_count(Granularity::Hour, now),
            day: self.live_count(Granularity::Day, now),
        }
    }

    fn push(&mut self, now: SystemTime) {
        for granularity in Granularity::ALL {
            let sequence = self.sequence_mut(granularity);
            // Keep ordering even if the caller's clock steps backwards
            let stamp = match sequence.back() {
                Some(last) if *last > now => *last,
                _ => now,
            };
            sequence.push_back(stamp);
        }
    }

    fn is_empty(&self) -> bool {
        self.minute.is_empty() && self.hour.is_empty() && self.day.is_empty()
    }
}

fn elapsed(earlier: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(earlier).unwrap_or(Duration::ZERO)
}

/// Per-credential minute/hour/day counters
///
/// Backed by a sharded concurrent map, so operations on one credential never
/// wait on another credential beyond shard contention.
///
/// # Example
///
/// ```
/// use turnstile::{AccessPolicy, CounterStore, RateLimits};
/// use std::time::SystemTime;
///
/// let store = CounterStore::new();
/// let policy = AccessPolicy::new(1, "free", RateLimits::new(1, 10, 100));
/// let now = SystemTime::now();
///
/// assert!(store.check_and_reserve("key", &policy, now).is_ok());
/// store.record("key", &policy, now);
/// assert!(store.check_and_reserve("key", &policy, now).is_err());
/// ```
pub struct CounterStore {
    windows: ConcurrentMap<String, UsageWindowSet>,
    retention_factor: u32,
}

impl CounterStore {
    /// Create a store retaining two buckets of history per granularity
    pub fn new() -> Self {
        Self::with_retention_factor(DEFAULT_RETENTION_FACTOR)
    }

    /// Create a store retaining `factor` buckets of history (at least one)
    pub fn with_retention_factor(factor: u32) -> Self {
        CounterStore {
            windows: ConcurrentMap::default(),
            retention_factor: factor.max(1),
        }
    }

    /// Check every ceiling, finest granularity first, without consuming quota
    pub fn check_and_reserve(
        &self,
        credential: &str,
        policy: &AccessPolicy,
        now: SystemTime,
    ) -> Result<(), QuotaExceeded> {
        if policy.unlimited {
            return Ok(());
        }

        let Some(mut windows) = self.windows.get_mut(credential) else {
            return Self::compare(Usage::default(), policy);
        };
        windows.prune(now, self.retention_factor);
        Self::compare(windows.usage(now), policy)
    }

    fn compare(usage: Usage, policy: &AccessPolicy) -> Result<(), QuotaExceeded> {
        for granularity in Granularity::ALL {
            let ceiling = policy.limits.ceiling(granularity);
            let observed = usage.get(granularity);
            if observed >= ceiling {
                return Err(QuotaExceeded {
                    granularity,
                    ceiling,
                    observed,
                    tier: policy.tier.clone(),
                });
            }
        }
        Ok(())
    }

    /// Record an admitted request
    pub fn record(&self, credential: &str, policy: &AccessPolicy, now: SystemTime) {
        if policy.unlimited {
            return;
        }

        let mut windows = self.windows.entry(credential.to_string()).or_default();
        windows.prune(now, self.retention_factor);
        windows.push(now);
    }

    /// Check every ceiling and record the request under one entry lock
    ///
    /// Concurrent callers for the same credential are serialized, so usage
    /// never ends up above a ceiling.
    pub fn check_and_record(
        &self,
        credential: &str,
        policy: &AccessPolicy,
        now: SystemTime,
    ) -> Result<(), QuotaExceeded> {
        if policy.unlimited {
            return Ok(());
        }

        let mut windows = self.windows.entry(credential.to_string()).or_default();
        windows.prune(now, self.retention_factor);
        Self::compare(windows.usage(now), policy)?;
        windows.push(now);
        Ok(())
    }

    /// Live counts for a credential, without pruning
    pub fn usage(&self, credential: &str, now: SystemTime) -> Usage {
        self.windows
            .get(credential)
            .map(|windows| windows.usage(now))
            .unwrap_or_default()
    }

    /// Quota left under each ceiling
    pub fn remaining(&self, credential: &str, policy: &AccessPolicy, now: SystemTime) -> Remaining {
        if policy.unlimited {
            return Remaining::default();
        }

        let usage = self.usage(credential, now);
        let left = |g: Granularity| Some(policy.limits.ceiling(g).saturating_sub(usage.get(g)));
        Remaining {
            minute: left(Granularity::Minute),
            hour: left(Granularity::Hour),
            day: left(Granularity::Day),
        }
    }

    /// Drop window sets with no retained history, returning how many were removed
    pub fn sweep_idle(&self, now: SystemTime) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, windows| {
            windows.prune(now, self.retention_factor);
            !windows.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of credentials with tracked usage
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}
