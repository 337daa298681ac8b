//! # Turnstile Server
//!
//! A standalone admission-control service for metered APIs.
//!
//! ## Purpose
//!
//! API gateways forward every inbound call to `POST /admit` before it reaches
//! the query service. Turnstile answers with a verdict: admitted, or denied
//! with a stable reason code and an HTTP status the gateway can pass through.
//!
//! - **Volumetric abuse blocking** per source address, independent of credential
//! - **Per-tenant quotas** over sliding minute/hour/day windows
//! - **Account policy** (suspension, deactivation, bans) read from a policy file
//!   that can be edited while the server runs
//!
//! ## Quick Start
//!
//! ```bash
//! # Show all available options
//! turnstile --help
//!
//! # Serve a policy file on port 8080
//! turnstile --policy-file policies.json
//!
//! # Persist blocked addresses and keep an event log
//! turnstile --policy-file policies.json \
//!     --blocked-file /var/lib/turnstile/blocked.json \
//!     --event-log /var/log/turnstile/events.jsonl
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! # Via CLI
//! turnstile --abuse-threshold 20 --soft-ttl 60
//!
//! # Via environment variables
//! export TURNSTILE_ABUSE_THRESHOLD=20
//! export TURNSTILE_SOFT_TTL=60
//! turnstile
//!
//! # List all available environment variables
//! turnstile --list-env-vars
//! ```
//!
//! ## Usage
//!
//! ```bash
//! curl -X POST http://localhost:8080/admit \
//!   -H "Content-Type: application/json" \
//!   -d '{"address": "203.0.113.7", "params": {"key": "11111111-2222-4333-8444-555555555555", "q": "meter_readings"}}'
//! ```
//!
//! See [`transport::http`] for every endpoint and [`backend`] for the policy
//! file format.

pub mod backend;
pub mod config;
pub mod metrics;
pub mod server;
pub mod sink;
pub mod transport;
