//! Long-running node
//!
//! Starts the cluster heartbeat, the pub/sub bus and optionally a stream tail,
//! then waits for SIGTERM or Ctrl+C and stops them in reverse order.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use ctibus_cluster::{EventBus, NodeInfo, NodeRegistry};
use ctibus_core::models::SseEvent;
use ctibus_core::StoreContext;
use ctibus_stream::{StreamHandler, StreamOptions, StreamProcessor};

/// Logs every delivered event
struct LoggingHandler;

#[async_trait]
impl StreamHandler for LoggingHandler {
    async fn on_batch(&self, events: Vec<SseEvent>, last_event_id: String) -> ctibus_core::Result<()> {
        for event in &events {
            info!(
                id = %event.id,
                event_type = %event.event,
                message = event.data.get("message").and_then(|m| m.as_str()).unwrap_or_default(),
                "Stream event"
            );
        }
        debug!(count = events.len(), last_event_id = %last_event_id, "Batch processed");
        Ok(())
    }
}

pub async fn serve(ctx: &StoreContext, node_id: String, tail: bool) -> Result<()> {
    let config = ctx.config();
    info!(node_id = %node_id, local_only = config.is_local_only(), "ctibus node starting");

    let bus = EventBus::new(ctx, node_id.clone())?;
    let mut bus_messages = bus.subscribe("*")?;

    let cancel = CancellationToken::new();
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    let heartbeat = NodeRegistry::new(ctx).spawn_heartbeat(
        NodeInfo::new(node_id.clone(), hostname),
        Duration::from_secs(config.cluster.heartbeat_interval_seconds.max(1)),
        cancel.clone(),
    );

    let processor = if tail {
        let processor = StreamProcessor::new(
            ctx,
            "serve-tail",
            Arc::new(LoggingHandler),
            StreamOptions::from_config(&config.stream),
        );
        processor.start(None).await?;
        Some(processor)
    } else {
        None
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            message = bus_messages.recv() => match message {
                Some(message) => debug!(topic = %message.topic, "Bus message"),
                None => break,
            },
        }
    }
    info!("Shutdown signal received, stopping");

    if let Some(processor) = processor {
        processor.shutdown().await;
    }
    bus_messages.unsubscribe();
    bus.shutdown();
    cancel.cancel();
    if let Err(e) = heartbeat.await {
        error!(error = %e, "Heartbeat task failed");
    }
    info!(node_id = %node_id, "ctibus node stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
