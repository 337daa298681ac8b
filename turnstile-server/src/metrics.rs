//! Metrics collection for observability
//!
//! The pipeline already counts outcomes per reason code and exposes store
//! sizes through [`AdmissionPipeline::stats`](turnstile::AdmissionPipeline::stats).
//! This module adds what only the server sees (HTTP traffic and admission
//! latency) and renders both in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use turnstile::{PipelineStats, ReasonCode};

/// Server-side counters
pub struct Metrics {
    /// Server start time
    start_time: Instant,

    /// Every HTTP request, admin endpoints included
    pub http_requests: AtomicU64,
    /// Admission requests whose body could not be parsed
    pub malformed_requests: AtomicU64,
    /// Administrative actions (unblock, invalidate)
    pub admin_actions: AtomicU64,

    /// Admission latency buckets
    pub latency_under_1ms: AtomicU64,
    pub latency_under_10ms: AtomicU64,
    pub latency_under_100ms: AtomicU64,
    pub latency_under_1s: AtomicU64,
    pub latency_over_1s: AtomicU64,

    pub latency_sum_micros: AtomicU64,
    pub latency_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            http_requests: AtomicU64::new(0),
            malformed_requests: AtomicU64::new(0),
            admin_actions: AtomicU64::new(0),
            latency_under_1ms: AtomicU64::new(0),
            latency_under_10ms: AtomicU64::new(0),
            latency_under_100ms: AtomicU64::new(0),
            latency_under_1s: AtomicU64::new(0),
            latency_over_1s: AtomicU64::new(0),
            latency_sum_micros: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admin_action(&self) {
        self.admin_actions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one admission decision took
    pub fn record_admission(&self, latency_us: u64) {
        match latency_us {
            0..=999 => self.latency_under_1ms.fetch_add(1, Ordering::Relaxed),
            1000..=9999 => self.latency_under_10ms.fetch_add(1, Ordering::Relaxed),
            10000..=99999 => self.latency_under_100ms.fetch_add(1, Ordering::Relaxed),
            100000..=999999 => self.latency_under_1s.fetch_add(1, Ordering::Relaxed),
            _ => self.latency_over_1s.fetch_add(1, Ordering::Relaxed),
        };

        self.latency_sum_micros
            .fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export server counters and pipeline statistics in Prometheus text format
    pub fn export_prometheus(&self, stats: &PipelineStats) -> String {
        let mut output = String::with_capacity(4096);

        output.push_str("# HELP turnstile_uptime_seconds Time since server start in seconds\n");
        output.push_str("# TYPE turnstile_uptime_seconds gauge\n");
        output.push_str(&format!(
            "turnstile_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        output.push_str("# HELP turnstile_http_requests_total Total HTTP requests received\n");
        output.push_str("# TYPE turnstile_http_requests_total counter\n");
        output.push_str(&format!(
            "turnstile_http_requests_total {}\n\n",
            self.http_requests.load(Ordering::Relaxed)
        ));

        output.push_str(
            "# HELP turnstile_malformed_requests_total Admission requests with an unreadable body\n",
        );
        output.push_str("# TYPE turnstile_malformed_requests_total counter\n");
        output.push_str(&format!(
            "turnstile_malformed_requests_total {}\n\n",
            self.malformed_requests.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP turnstile_admin_actions_total Administrative actions performed\n");
        output.push_str("# TYPE turnstile_admin_actions_total counter\n");
        output.push_str(&format!(
            "turnstile_admin_actions_total {}\n\n",
            self.admin_actions.load(Ordering::Relaxed)
        ));

        // Admission outcomes
        output.push_str("# HELP turnstile_admissions_total Admission decisions made\n");
        output.push_str("# TYPE turnstile_admissions_total counter\n");
        output.push_str(&format!("turnstile_admissions_total {}\n\n", stats.total));

        output.push_str("# HELP turnstile_admitted_total Requests admitted\n");
        output.push_str("# TYPE turnstile_admitted_total counter\n");
        output.push_str(&format!("turnstile_admitted_total {}\n\n", stats.admitted));

        output.push_str("# HELP turnstile_denied_total Requests denied\n");
        output.push_str("# TYPE turnstile_denied_total counter\n");
        output.push_str(&format!("turnstile_denied_total {}\n\n", stats.denied));

        output.push_str("# HELP turnstile_decisions_by_code Admission decisions by reason code\n");
        output.push_str("# TYPE turnstile_decisions_by_code counter\n");
        for code in ReasonCode::ALL {
            output.push_str(&format!(
                "turnstile_decisions_by_code{{code=\"{}\"}} {}\n",
                code.as_str(),
                stats.count(code)
            ));
        }
        output.push('\n');

        // Latency distribution
        let under_1ms = self.latency_under_1ms.load(Ordering::Relaxed);
        let under_10ms = under_1ms + self.latency_under_10ms.load(Ordering::Relaxed);
        let under_100ms = under_10ms + self.latency_under_100ms.load(Ordering::Relaxed);
        let under_1s = under_100ms + self.latency_under_1s.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);

        output.push_str(
            "# HELP turnstile_admission_duration_seconds Admission decision latency distribution\n",
        );
        output.push_str("# TYPE turnstile_admission_duration_seconds histogram\n");
        output.push_str(&format!(
            "turnstile_admission_duration_seconds_bucket{{le=\"0.001\"}} {under_1ms}\n"
        ));
        output.push_str(&format!(
            "turnstile_admission_duration_seconds_bucket{{le=\"0.01\"}} {under_10ms}\n"
        ));
        output.push_str(&format!(
            "turnstile_admission_duration_seconds_bucket{{le=\"0.1\"}} {under_100ms}\n"
        ));
        output.push_str(&format!(
            "turnstile_admission_duration_seconds_bucket{{le=\"1\"}} {under_1s}\n"
        ));
        output.push_str(&format!(
            "turnstile_admission_duration_seconds_bucket{{le=\"+Inf\"}} {count}\n"
        ));
        let latency_sum_seconds =
            self.latency_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!(
            "turnstile_admission_duration_seconds_sum {latency_sum_seconds:.6}\n"
        ));
        output.push_str(&format!(
            "turnstile_admission_duration_seconds_count {count}\n\n"
        ));

        // Store sizes
        output.push_str("# HELP turnstile_tracked_addresses Source addresses with a ledger\n");
        output.push_str("# TYPE turnstile_tracked_addresses gauge\n");
        output.push_str(&format!(
            "turnstile_tracked_addresses {}\n\n",
            stats.tracked_addresses
        ));

        output.push_str("# HELP turnstile_blocked_addresses Source addresses currently blocked\n");
        output.push_str("# TYPE turnstile_blocked_addresses gauge\n");
        output.push_str(&format!(
            "turnstile_blocked_addresses {}\n\n",
            stats.blocked_addresses
        ));

        output.push_str(
            "# HELP turnstile_tracked_credentials Credentials with sliding-window counters\n",
        );
        output.push_str("# TYPE turnstile_tracked_credentials gauge\n");
        output.push_str(&format!(
            "turnstile_tracked_credentials {}\n\n",
            stats.tracked_credentials
        ));

        output.push_str("# HELP turnstile_events_dropped_total Security events dropped\n");
        output.push_str("# TYPE turnstile_events_dropped_total counter\n");
        output.push_str(&format!(
            "turnstile_events_dropped_total {}\n\n",
            stats.events_dropped
        ));

        // Policy cache
        let cache = &stats.cache;
        let counters = [
            ("hits", "Lookups served fresh from cache", cache.hits),
            ("stale_hits", "Lookups served stale while refreshing", cache.stale_hits),
            ("misses", "Lookups with no cached policy", cache.misses),
            ("fetches", "Policy store fetches", cache.fetches),
            ("fetch_failures", "Failed policy store fetches", cache.fetch_failures),
            ("stale_served", "Stale policies served during an outage", cache.stale_served),
            ("evictions", "Cached policies evicted", cache.evictions),
            (
                "background_refreshes",
                "Background refreshes started",
                cache.background_refreshes,
            ),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP turnstile_cache_{name}_total {help}\n"));
            output.push_str(&format!("# TYPE turnstile_cache_{name}_total counter\n"));
            output.push_str(&format!("turnstile_cache_{name}_total {value}\n\n"));
        }

        output.push_str("# HELP turnstile_cache_entries Cached policies\n");
        output.push_str("# TYPE turnstile_cache_entries gauge\n");
        output.push_str(&format!("turnstile_cache_entries {}\n\n", cache.entries));

        output.push_str(
            "# HELP turnstile_cache_refreshes_in_flight Background refreshes running\n",
        );
        output.push_str("# TYPE turnstile_cache_refreshes_in_flight gauge\n");
        output.push_str(&format!(
            "turnstile_cache_refreshes_in_flight {}\n\n",
            cache.refreshes_in_flight
        ));

        output.push_str("# HELP turnstile_cache_hit_rate Share of lookups served from cache\n");
        output.push_str("# TYPE turnstile_cache_hit_rate gauge\n");
        output.push_str(&format!(
            "turnstile_cache_hit_rate {:.4}\n",
            cache.hit_rate
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
