//! Server configuration and CLI argument parsing
//!
//! Every setting can be given as a command-line argument or as an environment
//! variable with the `TURNSTILE_` prefix.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! # Example Usage
//!
//! ```bash
//! # Using CLI arguments
//! turnstile --policy-file policies.json --http-port 9090
//!
//! # Using environment variables
//! export TURNSTILE_POLICY_FILE=/etc/turnstile/policies.json
//! export TURNSTILE_BLOCKED_FILE=/var/lib/turnstile/blocked.json
//! turnstile
//! ```

use anyhow::{Result, anyhow};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use turnstile::CacheConfig;

/// Main configuration structure for the server
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub http: HttpConfig,
    pub backend: BackendConfig,
    pub abuse: AbuseConfig,
    pub cache: CacheSettings,
    pub events: EventsConfig,
    /// Seconds between maintenance sweeps
    pub sweep_interval: u64,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

/// Where policies and bearer tokens come from
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub policy_file: PathBuf,
    /// Identity resolution timeout in milliseconds
    pub resolve_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbuseConfig {
    /// Requests per window an address may send before it is blocked
    pub threshold: u32,
    /// Window length in seconds
    pub window: u64,
    /// Seconds after which an idle, unblocked ledger is forgotten
    pub idle_ttl: u64,
    /// Block list file; blocks live in memory only when absent
    pub blocked_file: Option<PathBuf>,
}

/// Policy cache tiers, all in seconds except the fetch timeout
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub soft_ttl: u64,
    pub hard_ttl: u64,
    pub retention: u64,
    pub fetch_timeout_ms: u64,
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            soft_ttl: Duration::from_secs(self.soft_ttl),
            hard_ttl: Duration::from_secs(self.hard_ttl),
            retention: Duration::from_secs(self.retention),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// JSON-lines event log; events are only traced when absent
    pub event_log: Option<PathBuf>,
    /// Capacity of the event channel
    pub buffer_size: usize,
}

/// Command-line arguments
///
/// # Examples
///
/// Serve a policy file on the default port:
/// ```bash
/// turnstile --policy-file policies.json
/// ```
///
/// Stricter abuse threshold with persisted blocks:
/// ```bash
/// turnstile --policy-file policies.json --abuse-threshold 20 --blocked-file blocked.json
/// ```
#[derive(Parser, Debug)]
#[command(
    name = "turnstile",
    about = "Admission control and abuse prevention for metered APIs",
    long_about = "Admission control and abuse prevention for metered APIs.\n\nEnvironment variables with TURNSTILE_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    // HTTP
    #[arg(
        long,
        value_name = "HOST",
        help = "HTTP host",
        default_value = "127.0.0.1",
        env = "TURNSTILE_HTTP_HOST"
    )]
    pub http_host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "HTTP port",
        default_value_t = 8080,
        env = "TURNSTILE_HTTP_PORT"
    )]
    pub http_port: u16,

    // Backend
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON file with policies and bearer tokens",
        default_value = "policies.json",
        env = "TURNSTILE_POLICY_FILE"
    )]
    pub policy_file: PathBuf,
    #[arg(
        long,
        value_name = "MS",
        help = "Identity resolution timeout in milliseconds",
        default_value_t = 2000,
        env = "TURNSTILE_RESOLVE_TIMEOUT_MS"
    )]
    pub resolve_timeout_ms: u64,

    // Abuse tracking
    #[arg(
        long,
        value_name = "COUNT",
        help = "Requests per window before an address is blocked",
        default_value_t = 50,
        env = "TURNSTILE_ABUSE_THRESHOLD"
    )]
    pub abuse_threshold: u32,
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Abuse detection window",
        default_value_t = 60,
        env = "TURNSTILE_ABUSE_WINDOW"
    )]
    pub abuse_window: u64,
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Forget idle unblocked addresses after this long",
        default_value_t = 3600,
        env = "TURNSTILE_IDLE_TTL"
    )]
    pub idle_ttl: u64,
    #[arg(
        long,
        value_name = "PATH",
        help = "Persist blocked addresses to this JSON file",
        env = "TURNSTILE_BLOCKED_FILE"
    )]
    pub blocked_file: Option<PathBuf>,

    // Policy cache
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Serve cached policy without refresh below this age",
        default_value_t = 300,
        env = "TURNSTILE_SOFT_TTL"
    )]
    pub soft_ttl: u64,
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Refetch synchronously at or above this age",
        default_value_t = 900,
        env = "TURNSTILE_HARD_TTL"
    )]
    pub hard_ttl: u64,
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Sweep cached policies idle for twice this long",
        default_value_t = 3600,
        env = "TURNSTILE_RETENTION"
    )]
    pub retention: u64,
    #[arg(
        long,
        value_name = "MS",
        help = "Policy store fetch timeout in milliseconds",
        default_value_t = 2000,
        env = "TURNSTILE_FETCH_TIMEOUT_MS"
    )]
    pub fetch_timeout_ms: u64,

    // Events
    #[arg(
        long,
        value_name = "PATH",
        help = "Append security events to this JSON-lines file",
        env = "TURNSTILE_EVENT_LOG"
    )]
    pub event_log: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SIZE",
        help = "Event channel capacity",
        default_value_t = 10_000,
        env = "TURNSTILE_EVENT_BUFFER"
    )]
    pub event_buffer: usize,

    // General
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Interval between maintenance sweeps",
        default_value_t = 3600,
        env = "TURNSTILE_SWEEP_INTERVAL"
    )]
    pub sweep_interval: u64,
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "TURNSTILE_LOG_LEVEL"
    )]
    pub log_level: String,

    #[arg(long, help = "List all environment variables and exit")]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from CLI arguments and environment variables
    ///
    /// Handles `--list-env-vars` by printing the reference and exiting.
    ///
    /// # Errors
    ///
    /// Returns an error if any value fails [`Config::validate`].
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        Self::from_args(args)
    }

    /// Build and validate configuration from already parsed arguments
    pub fn from_args(args: Args) -> Result<Self> {
        let config = Config {
            http: HttpConfig {
                host: args.http_host,
                port: args.http_port,
            },
            backend: BackendConfig {
                policy_file: args.policy_file,
                resolve_timeout_ms: args.resolve_timeout_ms,
            },
            abuse: AbuseConfig {
                threshold: args.abuse_threshold,
                window: args.abuse_window,
                idle_ttl: args.idle_ttl,
                blocked_file: args.blocked_file,
            },
            cache: CacheSettings {
                soft_ttl: args.soft_ttl,
                hard_ttl: args.hard_ttl,
                retention: args.retention,
                fetch_timeout_ms: args.fetch_timeout_ms,
            },
            events: EventsConfig {
                event_log: args.event_log,
                buffer_size: args.event_buffer,
            },
            sweep_interval: args.sweep_interval,
            log_level: args.log_level,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.abuse.threshold == 0 {
            return Err(anyhow!("--abuse-threshold must be at least 1"));
        }
        if self.abuse.window == 0 {
            return Err(anyhow!("--abuse-window must be at least 1 second"));
        }
        if self.cache.soft_ttl == 0 {
            return Err(anyhow!("--soft-ttl must be at least 1 second"));
        }
        if self.cache.hard_ttl < self.cache.soft_ttl {
            return Err(anyhow!(
                "--hard-ttl ({}s) must not be shorter than --soft-ttl ({}s)",
                self.cache.hard_ttl,
                self.cache.soft_ttl
            ));
        }
        if self.cache.fetch_timeout_ms == 0 || self.backend.resolve_timeout_ms == 0 {
            return Err(anyhow!("timeouts must be at least 1 millisecond"));
        }
        if self.events.buffer_size == 0 {
            return Err(anyhow!("--event-buffer must be at least 1"));
        }
        if self.sweep_interval == 0 {
            return Err(anyhow!("--sweep-interval must be at least 1 second"));
        }
        if !matches!(
            self.log_level.as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(anyhow!(
                "Invalid log level: {}. Valid options: error, warn, info, debug, trace",
                self.log_level
            ));
        }

        Ok(())
    }

    /// Print all available environment variables and their descriptions
    fn print_env_vars() {
        println!("Turnstile Environment Variables");
        println!("===============================");
        println!();
        println!("All environment variables use the TURNSTILE_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("HTTP:");
        println!("  TURNSTILE_HTTP_HOST=<host>            HTTP host [default: 127.0.0.1]");
        println!("  TURNSTILE_HTTP_PORT=<port>            HTTP port [default: 8080]");
        println!();

        println!("Backend:");
        println!(
            "  TURNSTILE_POLICY_FILE=<path>          Policies and bearer tokens [default: policies.json]"
        );
        println!("  TURNSTILE_RESOLVE_TIMEOUT_MS=<ms>     Identity resolution timeout [default: 2000]");
        println!();

        println!("Abuse Tracking:");
        println!("  TURNSTILE_ABUSE_THRESHOLD=<n>         Requests per window before blocking [default: 50]");
        println!("  TURNSTILE_ABUSE_WINDOW=<secs>         Detection window [default: 60]");
        println!("  TURNSTILE_IDLE_TTL=<secs>             Forget idle addresses after [default: 3600]");
        println!("  TURNSTILE_BLOCKED_FILE=<path>         Persist blocked addresses [default: memory only]");
        println!();

        println!("Policy Cache:");
        println!("  TURNSTILE_SOFT_TTL=<secs>             Background refresh age [default: 300]");
        println!("  TURNSTILE_HARD_TTL=<secs>             Synchronous refetch age [default: 900]");
        println!("  TURNSTILE_RETENTION=<secs>            Idle retention [default: 3600]");
        println!("  TURNSTILE_FETCH_TIMEOUT_MS=<ms>       Policy fetch timeout [default: 2000]");
        println!();

        println!("Events:");
        println!("  TURNSTILE_EVENT_LOG=<path>            JSON-lines event log [default: none]");
        println!("  TURNSTILE_EVENT_BUFFER=<size>         Event channel capacity [default: 10000]");
        println!();

        println!("General:");
        println!(
            "  TURNSTILE_SWEEP_INTERVAL=<secs>       Maintenance sweep interval [default: 3600]"
        );
        println!(
            "  TURNSTILE_LOG_LEVEL=<level>           Log level: error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Examples:");
        println!("  export TURNSTILE_POLICY_FILE=/etc/turnstile/policies.json");
        println!("  export TURNSTILE_ABUSE_THRESHOLD=20");
        println!("  turnstile --http-port 9090");
    }
}
