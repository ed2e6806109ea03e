mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use ctibus_core::bootstrap::config::load_config_from;
use ctibus_core::{logging, StoreContext};
use ctibus_stream::{StreamBatch, StreamOptions, StreamProcessor, StreamProducer};

#[derive(Parser, Debug)]
#[command(name = "ctibus")]
#[command(about = "Event stream and coordination node", long_about = None)]
struct Args {
    /// Config file, overrides CTIBUS_CONFIG_PATH
    #[arg(long, env = "CTIBUS_CONFIG_PATH", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the cluster and keep heartbeating until interrupted
    Serve {
        /// Log every event appended to the platform stream
        #[arg(long)]
        tail: bool,
    },
    /// Print stream events as JSON lines
    Tail {
        /// Start cursor: `live` or a stream id such as `0-0`
        #[arg(long, default_value = "live")]
        from: String,
        /// Stream to read instead of the platform stream
        #[arg(long)]
        stream: Option<String>,
        /// Include internal events
        #[arg(long)]
        with_internal: bool,
    },
    /// Print stream bounds, store version and cluster members
    Info,
}

/// `<hostname>-<random>` unless configured
fn node_id(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    ctibus_cluster::default_node_id(&hostname)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config_from(args.config)?;
    logging::init_logging(&config.logging)?;

    let ctx = StoreContext::connect(&config).await?;
    ctx.ping().await?;

    let result = match args.command {
        Command::Serve { tail } => {
            let node_id = node_id(&config.cluster.node_id);
            server::serve(&ctx, node_id, tail).await
        }
        Command::Tail {
            from,
            stream,
            with_internal,
        } => tail(&ctx, &from, stream, with_internal).await,
        Command::Info => print_info(&ctx).await,
    };

    ctx.close();
    result
}

async fn tail(ctx: &StoreContext, from: &str, stream: Option<String>, with_internal: bool) -> Result<()> {
    let mut options = StreamOptions::from_config(&ctx.config().stream).with_internal(with_internal);
    if let Some(stream) = stream {
        options = options.with_stream(stream);
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamBatch>(16);
    let processor = StreamProcessor::new(ctx, "tail", Arc::new(tx), options);
    processor.start(Some(from)).await?;

    let shutdown = server::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                for event in batch.events {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
        }
    }

    // Unblock a handler waiting on a full channel
    drop(rx);
    processor.shutdown().await;
    Ok(())
}

async fn print_info(ctx: &StoreContext) -> Result<()> {
    let producer = StreamProducer::new(ctx);
    let registry = ctibus_cluster::NodeRegistry::new(ctx);

    let version = ctx.server_version().await?;
    let stream = producer.stream_info().await?;
    let instances = registry.get_instances().await?;
    info!(stream = %producer.stream_name(), "Collected stream info");

    let report = serde_json::json!({
        "store_version": version,
        "stream": producer.stream_name(),
        "info": stream,
        "instances": instances,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
