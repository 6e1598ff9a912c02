//! Margin Allocator - Main Entry Point
//!
//! Wires the Bitfinex adapters, the risk components, and the control
//! loop, then runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use margin_allocator::config::Config;
use margin_allocator::control::{Controller, ControllerSettings, TickScheduler};
use margin_allocator::exchange::{
    BitfinexClient, ExchangeAdapter, PriceFeed, StreamEvent, DEFAULT_WS_URL,
};
use margin_allocator::history::SqliteHistory;
use margin_allocator::notify::{Alert, LogNotifier, Notifier};
use margin_allocator::risk::{
    EventDetector, LiquidationPlanner, RebalancePlanner, RiskEstimator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Margin Allocator CLI
#[derive(Parser)]
#[command(name = "margin-allocator")]
#[command(version, about = "Cross-margin simulation for Bitfinex derivatives")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Force all liquidation to dry-run regardless of configuration
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    info!("═══════════════════════════════════════════════════════");
    info!(
        "  Margin Allocator v{} - simulated cross-margin",
        env!("CARGO_PKG_VERSION")
    );
    info!("═══════════════════════════════════════════════════════");

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;
    config.validate()?;

    if cli.dry_run && !config.liquidation.dry_run {
        warn!("--dry-run given: liquidation forced to dry-run");
        config.liquidation.dry_run = true;
    }
    log_config(&config);

    let exchange: Arc<BitfinexClient> = Arc::new(BitfinexClient::new(&config.exchange)?);

    // Preflight: one authenticated fetch. A broken key is fatal here,
    // before the loop starts issuing writes.
    let balance = exchange
        .available_derivatives_balance()
        .await
        .map_err(|e| anyhow::anyhow!("authentication preflight failed: {}", e))?;
    info!("✅ Preflight passed, available balance: {}", balance);

    let history = Arc::new(
        SqliteHistory::new(&config.history.db_path).context("opening history sink")?,
    );
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let estimator = Arc::new(RiskEstimator::new(exchange.clone(), &config.volatility));

    let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(256);
    let (feed, feed_handle) = PriceFeed::new(DEFAULT_WS_URL, stream_tx);

    let controller = Arc::new(Controller::new(
        exchange.clone(),
        Arc::new(feed_handle),
        history,
        notifier.clone(),
        estimator,
        RebalancePlanner::new(config.rebalance.clone()),
        LiquidationPlanner::new(config.liquidation.clone()),
        EventDetector::new(config.emergency.clone()),
        ControllerSettings {
            emergency_margin_rate: config.emergency.emergency_margin_rate,
            min_adjustment_usdt: config.rebalance.min_adjustment_usdt,
            liquidation_dry_run: config.liquidation.dry_run,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shutdown on interrupt or terminate, with graceful drain.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("🛑 Shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    let feed_task = tokio::spawn(feed.run());

    // Stream consumer: prices and connection state arrive in order and
    // are handed to the controller one at a time.
    let consumer_task = {
        let controller = controller.clone();
        let notifier = notifier.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = stream_rx.recv() => {
                        match event {
                            Some(StreamEvent::Price { symbol, price }) => {
                                controller.on_price(&symbol, price).await;
                            }
                            Some(StreamEvent::Connected) => {
                                info!("price stream connected");
                            }
                            Some(StreamEvent::Disconnected) => {
                                warn!("price stream disconnected");
                            }
                            Some(StreamEvent::RetriesExhausted) => {
                                notifier.notify(&Alert::StreamOffline);
                                warn!("continuing in polling-only mode");
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    info!("🚀 Starting control loop...");
    let scheduler = TickScheduler::new(
        controller,
        Duration::from_secs(config.schedule.poll_interval_secs),
        shutdown_rx,
    );
    let scheduler_task = scheduler.spawn();

    // The scheduler finishes its in-flight tick before unwinding.
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "scheduler task panicked");
    }
    let _ = consumer_task.await;
    feed_task.abort();

    info!("👋 Margin allocator shutdown complete");
    Ok(())
}

/// Initialize logging with rolling file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "margin-allocator.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("margin_allocator=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log the effective configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Poll Interval: {}s", config.schedule.poll_interval_secs);
    info!(
        "   Volatility Lookback: {} days (refresh {}h, spike window {}m)",
        config.volatility.lookback_days,
        config.volatility.refresh_hours,
        config.volatility.spike_refresh_minutes
    );
    info!(
        "   Min Adjustment: ${} / {}%",
        config.rebalance.min_adjustment_usdt, config.rebalance.min_deviation_pct
    );
    info!(
        "   Emergency Margin Rate: {}%",
        config.emergency.emergency_margin_rate
    );
    info!("   Price Spike: {}%", config.emergency.price_spike_pct);
    info!(
        "   Liquidation: enabled={} dry_run={} max_close={}% cooldown={}s",
        config.liquidation.enabled,
        config.liquidation.dry_run,
        config.liquidation.max_single_close_pct,
        config.liquidation.cooldown_seconds
    );
    if !config.volatility.weight_overrides.is_empty() {
        info!(
            "   Weight Overrides: {:?}",
            config.volatility.weight_overrides
        );
    }
}
