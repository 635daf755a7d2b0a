//! `ohlcv` binary: reads JSON deal records from stdin, one per line.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ohlcv::broadcast::TracingBroadcaster;
use ohlcv::config::ServiceConfig;
use ohlcv::scheduler::SystemClock;
use ohlcv::service::OhlcvService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env().context("invalid OHLCV_* configuration")?;
    info!(
        version = ohlcv::SERVICE_VERSION,
        markets = config.markets.len(),
        resolutions = config.resolutions.len(),
        zone = %config.reference_zone,
        "Starting OHLCV service"
    );

    let cancel = CancellationToken::new();
    let service = OhlcvService::start(
        config,
        Arc::new(SystemClock),
        Arc::new(TracingBroadcaster),
        cancel.clone(),
    )
    .await
    .context("failed to start OHLCV service")?;

    let mut ingester = service.ingester();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
            line = lines.next_line() => {
                match line.context("failed to read deal feed")? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => {
                        if let Err(e) = ingester.ingest_json(&line).await {
                            warn!(error = %e, "Deal not ingested");
                        }
                    }
                    None => {
                        info!("Deal feed closed");
                        break;
                    }
                }
            }
        }
    }

    let metrics = service.metrics().export();
    service.shutdown().await;
    info!(?metrics, "Final metrics");
    Ok(())
}
