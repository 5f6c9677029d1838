//! dbcp-watch - logs contract events of a DBCP node until interrupted
//!
//! Every `[[watch]]` entry of the settings file becomes one event
//! subscription; decoded events are logged as they arrive.

use anyhow::Result;
use dbcp_runtime::config::{parse_address, Settings};
use dbcp_runtime::events::{accept_all, event_handler, FromBlock};
use dbcp_runtime::logging::init_logging;
use dbcp_runtime::metrics;
use dbcp_runtime::runtime::Runtime;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting dbcp-watch v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!("Loaded configuration with {} watches", settings.watch.len());

    let runtime = Runtime::connect(settings.clone(), None).await?;
    runtime.init().await;
    info!("Connected to {}", settings.node.ws_url);

    for watch in &settings.watch {
        let address = parse_address(&watch.address)?;
        let from_block = watch
            .from_block
            .map(FromBlock::Number)
            .unwrap_or_default();
        let label = format!("{}.{}", watch.contract, watch.event);

        let id = runtime
            .event_hub
            .subscribe(
                watch.contract.as_str(),
                address,
                &watch.event,
                accept_all(),
                event_handler(move |event| {
                    let label = label.clone();
                    async move {
                        let args: Vec<String> = event
                            .args
                            .iter()
                            .map(|(name, value)| format!("{}={}", name, value))
                            .collect();
                        info!(
                            block = event.block_number,
                            tx = ?event.transaction_hash,
                            "{} {}",
                            label,
                            args.join(" ")
                        );
                        Ok(())
                    }
                }),
                from_block,
            )
            .await;
        match id {
            Ok(id) => info!("Watching {} on {:?} ({})", watch.event, address, id),
            Err(e) => error!("Cannot watch {} on {:?}: {}", watch.event, address, e),
        }
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    runtime.shutdown().await;
    info!("Final metrics:\n{}", metrics::gather_text());

    info!("dbcp-watch stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
