//! Wiring configuration into a running service

use crate::backend::PolicyFile;
use crate::config::Config;
use crate::sink::{DiscardSink, JsonLinesSink};
use crate::transport::{ServerState, Transport, http::HttpTransport};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use turnstile::{
    AbuseTracker, AdmissionPipeline, BlockStore, EventEmitter, EventSink, EventWorker,
    JsonFileBlockStore, MemoryBlockStore,
};

/// Assembled service, ready to serve
pub struct Service {
    pub state: ServerState,
    pub worker: EventWorker,
}

/// Build the pipeline and its collaborators from configuration
///
/// Must be called inside a tokio runtime; the event worker is spawned here.
pub async fn build(config: &Config) -> Result<Service> {
    let sink: Arc<dyn EventSink> = match &config.events.event_log {
        Some(path) => Arc::new(
            JsonLinesSink::open(path)
                .await
                .with_context(|| format!("Failed to open event log {}", path.display()))?,
        ),
        None => Arc::new(DiscardSink),
    };
    let (events, worker) = EventEmitter::spawn(sink, config.events.buffer_size);

    let block_store: Arc<dyn BlockStore> = match &config.abuse.blocked_file {
        Some(path) => Arc::new(
            JsonFileBlockStore::open(path)
                .with_context(|| format!("Failed to open block list {}", path.display()))?,
        ),
        None => Arc::new(MemoryBlockStore::new()),
    };

    let tracker = AbuseTracker::builder()
        .threshold(config.abuse.threshold)
        .window(Duration::from_secs(config.abuse.window))
        .idle_ttl(Duration::from_secs(config.abuse.idle_ttl))
        .block_store(block_store)
        .events(events.clone())
        .build()
        .context("Failed to restore blocked addresses")?;

    if tracker.blocked_count() > 0 {
        tracing::info!("Restored {} blocked addresses", tracker.blocked_count());
    }

    let backend = Arc::new(PolicyFile::new(&config.backend.policy_file));
    if let Err(e) = backend.load().await {
        // Requests are answered with service_unavailable until the file is readable
        tracing::warn!("Policy file not readable yet: {}", e);
    }

    let pipeline = AdmissionPipeline::builder(backend.clone(), backend)
        .abuse_tracker(tracker)
        .cache_config(config.cache.to_cache_config())
        .events(events)
        .resolve_timeout(Duration::from_millis(config.backend.resolve_timeout_ms))
        .sweep_interval(Duration::from_secs(config.sweep_interval))
        .build()
        .context("Failed to build admission pipeline")?;

    Ok(Service {
        state: ServerState::new(Arc::new(pipeline)),
        worker,
    })
}

/// Serve until ctrl-c, then drain background work
pub async fn run(config: Config) -> Result<()> {
    let Service { state, worker } = build(&config).await?;
    let pipeline = Arc::clone(&state.pipeline);
    let maintenance = pipeline.spawn_maintenance();

    let transport = HttpTransport::new(&config.http.host, config.http.port)?;
    let mut server = tokio::spawn(transport.start(state));

    tracing::info!(
        "Turnstile started: abuse threshold {}/{}s, policy cache soft {}s hard {}s",
        config.abuse.threshold,
        config.abuse.window,
        config.cache.soft_ttl,
        config.cache.hard_ttl
    );

    let stopped_early = tokio::select! {
        joined = &mut server => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            None
        }
    };

    // Also stops the HTTP transport gracefully
    pipeline.shutdown();
    let joined = match stopped_early {
        Some(joined) => joined,
        None => server.await,
    };
    let result = match joined {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("HTTP transport panicked: {e}")),
    };

    if let Err(e) = maintenance.await {
        tracing::error!("Maintenance task panicked: {}", e);
    }

    // Last emitter goes with the pipeline; the worker then drains and exits
    drop(pipeline);
    worker.finish().await;

    result
}
