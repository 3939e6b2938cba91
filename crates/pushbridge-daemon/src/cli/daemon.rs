use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use pushbridge_core::relay::{NostrBackfill, RelayBackfill};
use pushbridge_core::{
    AmqpConsumer, ControlGate, EnvelopeStream, ExpoTransport, FilterRegistry, IngestionPipeline,
    PushDispatcher, PushRegistry, PushTransport, QueueError, RunEnd,
};

use super::config::{BridgeConfig, Settings};

/// Run the bridge until SIGINT/SIGTERM
#[tokio::main]
pub async fn run_daemon(config: BridgeConfig) -> Result<()> {
    info!("Starting pushbridge daemon");

    let settings = config
        .with_env()
        .context("Invalid environment override")?
        .resolve()
        .context("Invalid configuration")?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let dispatcher = PushDispatcher::new(ExpoTransport::new(settings.expo_access_token.clone()))
        .with_timeout(settings.dispatch_timeout)
        .with_concurrency(settings.dispatch_concurrency);
    let mut pipeline = IngestionPipeline::new(
        ControlGate::new(settings.keys.clone()),
        Arc::new(FilterRegistry::new()),
        Arc::new(PushRegistry::new()),
        dispatcher,
    )
    .with_dead_letter_redelivered(settings.dead_letter_redelivered);
    info!(identity = %pipeline.gate().identity(), "Accepting control events for this key");

    // Stored control events first, so filters exist before live traffic
    let backfill = NostrBackfill::new(settings.keys.clone(), settings.relay_url.as_str())
        .with_timeout(settings.backfill_timeout);
    let stored = match backfill.fetch_control_events().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "Failed to read stored events, continuing with empty state");
            Vec::new()
        }
    };
    pipeline.backfill(stored);
    for (identity, token) in pipeline.pushes().get_all() {
        debug!(identity = %identity, %token, "push token loaded");
    }
    info!(
        filters = pipeline.filters().item_count(),
        tokens = pipeline.pushes().item_count(),
        "State restored"
    );

    let result = consume(&mut pipeline, &settings, &mut shutdown_rx).await;

    pipeline.stats().log_summary();
    info!("Daemon stopped");
    result
}

/// Connect to the queue and feed the pipeline, reconnecting after failures.
///
/// Only the very first connection attempt is allowed to fail the daemon.
async fn consume<T: PushTransport>(
    pipeline: &mut IngestionPipeline<T>,
    settings: &Settings,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut connected_once = false;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let consumer =
            match AmqpConsumer::connect(&settings.amqp_url, &settings.queue_name).await {
                Ok(consumer) => consumer,
                Err(e) if !connected_once => {
                    return Err(e).context("Failed to connect to the message queue");
                }
                Err(e) => {
                    error!(error = %e, "queue connection failed");
                    if wait_before_reconnect(settings.reconnect_delay, shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };
        connected_once = true;

        match run_then_close(pipeline, consumer, shutdown).await {
            Ok(RunEnd::Shutdown) => {
                info!("Shutdown requested");
                return Ok(());
            }
            Ok(RunEnd::StreamEnded) => warn!("queue connection closed"),
            Err(e) => error!(error = %e, "queue consumption failed"),
        }

        if wait_before_reconnect(settings.reconnect_delay, shutdown).await {
            return Ok(());
        }
    }
}

/// Feed one connection to the pipeline, then close it however the run ended.
async fn run_then_close<T: PushTransport, S: EnvelopeStream>(
    pipeline: &mut IngestionPipeline<T>,
    mut stream: S,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<RunEnd, QueueError> {
    let end = pipeline.run(&mut stream, shutdown).await;
    debug!("closing queue connection");
    if let Err(e) = stream.close().await {
        warn!(error = %e, "failed to close queue connection cleanly");
    }
    end
}

/// Sleep `delay` unless shutdown comes first; returns true on shutdown.
async fn wait_before_reconnect(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    info!(delay = ?delay, "reconnecting to queue");
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
