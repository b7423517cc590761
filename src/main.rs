use anyhow::Result;
use momentum_scalper::alerts::AlertChannel;
use momentum_scalper::closer::PositionCloser;
use momentum_scalper::config::Config;
use momentum_scalper::engine::TradingEngine;
use momentum_scalper::exchange::{BinanceClient, ExchangeApi, PaperExchange};
use momentum_scalper::ledger::{Ledger, Reconciler, RiskLimits, SqliteStore};
use momentum_scalper::market_data::MarketDataGateway;
use momentum_scalper::scanner::MomentumScanner;
use momentum_scalper::scheduler::{ScannerWorker, Scheduler};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .init();

    info!("Starting momentum scalper v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!(
        capital = %config.capital,
        live_mode = config.live_mode,
        max_open_trades = config.risk.max_open_trades,
        "Configuration loaded"
    );

    let rest = Arc::new(BinanceClient::new(&config.binance)?);
    let exchange: Arc<dyn ExchangeApi> = if config.live_mode {
        rest
    } else {
        info!("Paper trading: orders will be acknowledged locally");
        Arc::new(PaperExchange::new(rest))
    };

    let gateway = Arc::new(MarketDataGateway::new(
        exchange.clone(),
        config.gateway.clone(),
    ));
    let store = Arc::new(SqliteStore::open(&config.store.db_path)?);
    let ledger = Ledger::new(store, RiskLimits::from_config(&config));

    let (alerts, mut alerts_rx) = AlertChannel::new();
    tokio::spawn(async move { while alerts_rx.recv().await.is_some() {} });

    let reconciler = Reconciler::new(ledger.clone(), exchange.clone(), alerts.clone());
    let scanner = MomentumScanner::new(
        gateway.clone(),
        config.scanner.clone(),
        config.execution.clone(),
        &config.sessions,
    );
    let engine = TradingEngine::new(
        exchange.clone(),
        ledger.clone(),
        config.risk.clone(),
        config.execution.clone(),
        config.capital,
        alerts.clone(),
    );
    let closer = Arc::new(PositionCloser::new(
        gateway,
        exchange,
        ledger.clone(),
        config.closer.clone(),
        alerts,
    ));

    let scanner_worker = Arc::new(ScannerWorker::new(
        ledger,
        reconciler,
        scanner,
        engine,
        config.risk.max_open_trades,
    ));

    let scheduler = Scheduler::new(
        scanner_worker,
        closer,
        config.closer.workers,
        config.closer.interval_secs,
        config.closer.stagger_secs,
    );
    let handles = scheduler.spawn();

    info!("Worker loops running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    for handle in handles {
        handle.abort();
    }
    Ok(())
}
