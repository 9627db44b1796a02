//! Process entry point: wires the gateway, detector, broadcaster,
//! dispatcher and feed server together and runs until interrupted.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ema_navigator::broadcast::Broadcaster;
use ema_navigator::common::channels::create_event_channel;
use ema_navigator::common::types::{Exchange, ExchangeCredential};
use ema_navigator::config::load_config;
use ema_navigator::detector::{DetectorKey, SignalMonitor};
use ema_navigator::dispatch::TradeDispatcher;
use ema_navigator::exchange::ExchangeGateway;
use ema_navigator::pipeline::SignalPipeline;
use ema_navigator::server::FeedServer;
use ema_navigator::store::InMemoryStore;

#[derive(Parser, Debug)]
#[command(name = "ema-navigator")]
#[command(about = "Multi-exchange EMA crossover signal engine", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "APP_CONFIG")]
    config: Option<String>,

    /// Override the feed server bind address
    #[arg(long)]
    bind: Option<String>,

    /// Exchange to poll candles from
    #[arg(long, default_value = "binance")]
    exchange: String,

    /// Streams to monitor, as SYMBOL:INTERVAL (repeatable)
    #[arg(long = "watch", value_name = "SYMBOL:INTERVAL", default_value = "BTCUSDT:1h")]
    watch: Vec<String>,

    /// User id the monitored streams belong to
    #[arg(long, default_value = "default")]
    user: String,
}

fn parse_watch(spec: &str) -> Result<(String, String)> {
    let (symbol, interval) = spec
        .split_once(':')
        .with_context(|| format!("invalid watch spec '{}', expected SYMBOL:INTERVAL", spec))?;
    Ok((symbol.to_uppercase(), interval.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.broadcast.bind_addr = bind;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.settings.log_level.clone())),
        )
        .init();

    info!("starting ema-navigator");

    let exchange = Exchange::from_str(&args.exchange)
        .map_err(|e| anyhow::anyhow!(e))
        .context("unsupported --exchange")?;

    let store = Arc::new(InMemoryStore::new());
    let gateway =
        Arc::new(ExchangeGateway::new(&config.gateway).context("failed to build exchange gateway")?);
    let broadcaster = Arc::new(Broadcaster::new(config.broadcast.clone()));
    let dispatcher = Arc::new(TradeDispatcher::new(gateway.clone(), store.clone()));

    let (events_tx, events_rx) = create_event_channel();
    let monitor = SignalMonitor::new(gateway.clone(), config.detector.clone(), events_tx);

    // Candle polling uses public market-data endpoints; an empty credential
    // only selects the futures market.
    let poll_cred = ExchangeCredential {
        exchange,
        api_key: String::new(),
        api_secret: String::new(),
        passphrase: None,
        is_futures: true,
    };
    for spec in &args.watch {
        let (symbol, interval) = parse_watch(spec)?;
        let key = DetectorKey {
            user_id: args.user.clone(),
            exchange,
            symbol,
            interval,
        };
        info!(key = %key, "monitoring stream");
        monitor.start(key, poll_cred.clone());
    }

    let pipeline = SignalPipeline::new(store, broadcaster.clone(), dispatcher);
    let pipeline_handle = tokio::spawn(pipeline.run(events_rx));

    let feed_server = FeedServer::new(broadcaster, config.broadcast.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(err) = feed_server.run().await {
            error!(error = %err, "feed server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    monitor.shutdown();
    server_handle.abort();
    // Dropping the monitor closed the event senders; let the pipeline drain.
    drop(monitor);
    if let Err(err) = pipeline_handle.await {
        if !err.is_cancelled() {
            warn!(error = %err, "pipeline task failed");
        }
    }

    info!("ema-navigator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_spec_parsing() {
        assert_eq!(
            parse_watch("btcusdt:15m").unwrap(),
            ("BTCUSDT".to_string(), "15m".to_string())
        );
        assert!(parse_watch("BTCUSDT").is_err());
    }
}
