//! End-to-end flow: scan, open, re-price, close, account.
//!
//! Drives the real control plane against the scriptable stub exchange and
//! an in-memory ledger. Each worker gets its own market data gateway, as in
//! deployment.

use momentum_scalper::alerts::AlertChannel;
use momentum_scalper::closer::PositionCloser;
use momentum_scalper::config::{
    CloserConfig, ExecutionConfig, GatewayConfig, RiskConfig, ScannerConfig, SessionConfig,
};
use momentum_scalper::engine::TradingEngine;
use momentum_scalper::exchange::testing::{flat_candles, StubExchange};
use momentum_scalper::exchange::{Candle, Interval};
use momentum_scalper::ledger::{Ledger, PositionStatus, Reconciler, RiskLimits, SqliteStore};
use momentum_scalper::market_data::MarketDataGateway;
use momentum_scalper::scanner::MomentumScanner;
use momentum_scalper::scheduler::ScannerWorker;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const SYMBOL: &str = "XYZUSDT";

/// Flat minute candles at 100, then a jump on the last candle: EMA5 crosses
/// EMA13, volume surges, ATR stays healthy. Scores 100.
fn breakout_candles() -> Vec<Candle> {
    let mut candles = flat_candles(60, dec!(100), dec!(0.4));
    let n = candles.len();
    for c in candles[n - 3..].iter_mut() {
        c.volume = dec!(220);
    }
    let last = candles.last_mut().unwrap();
    last.close = dec!(101.2);
    last.high = dec!(101.2);
    last.low = dec!(99.8);
    candles
}

struct World {
    stub: Arc<StubExchange>,
    ledger: Ledger,
    scanner_worker: ScannerWorker,
    closer: PositionCloser,
}

fn build_world() -> World {
    let stub = Arc::new(StubExchange::new().with_ticker(SYMBOL, dec!(101.2), dec!(10_000_000)));
    stub.set_candles(SYMBOL, Interval::OneMinute, breakout_candles());

    let limits = RiskLimits {
        capital: dec!(10000),
        max_open_trades: 3,
        max_portfolio_risk: dec!(0.20),
        daily_loss_limit: dec!(0.05),
    };
    let ledger = Ledger::new(Arc::new(SqliteStore::in_memory().unwrap()), limits);
    let (alerts, _alerts_rx) = AlertChannel::new();

    let scanner_gateway = Arc::new(MarketDataGateway::new(
        stub.clone(),
        GatewayConfig::default(),
    ));
    let scanner = MomentumScanner::new(
        scanner_gateway,
        ScannerConfig::default(),
        ExecutionConfig::default(),
        &SessionConfig::default(),
    );
    let engine = TradingEngine::new(
        stub.clone(),
        ledger.clone(),
        RiskConfig::default(),
        ExecutionConfig::default(),
        dec!(10000),
        alerts.clone(),
    );
    let reconciler = Reconciler::new(ledger.clone(), stub.clone(), alerts.clone());
    let scanner_worker = ScannerWorker::new(ledger.clone(), reconciler, scanner, engine, 3);

    // The closer re-reads marks every pass; no ticker cache for it here so
    // scripted price moves are visible immediately.
    let closer_gateway = Arc::new(MarketDataGateway::new(
        stub.clone(),
        GatewayConfig {
            ticker_ttl_secs: 0,
            ..GatewayConfig::default()
        },
    ));
    let closer = PositionCloser::new(
        closer_gateway,
        stub.clone(),
        ledger.clone(),
        CloserConfig::default(),
        alerts,
    );

    World {
        stub,
        ledger,
        scanner_worker,
        closer,
    }
}

#[tokio::test]
async fn scan_opens_position_and_take_profit_closes_it() {
    let world = build_world();

    world.scanner_worker.run_tick().await.unwrap();

    let open = world.ledger.list_open().unwrap();
    assert_eq!(open.len(), 1);
    let position = &open[0];
    assert_eq!(position.symbol, SYMBOL);
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.score_at_entry, 100);
    assert_eq!(position.leverage, 3);
    let entry = position.entry_price.unwrap();
    let tp = position.tp_price.unwrap();
    let atr = position.atr_at_entry.unwrap();
    assert_eq!(tp, entry + dec!(2) * atr);
    assert_eq!(world.stub.placed_orders().len(), 1);

    // Quiet market: closer holds.
    let report = world.closer.tick().await.unwrap();
    assert_eq!(report.closed, 0);
    assert_eq!(world.ledger.list_open().unwrap().len(), 1);

    // Price pushes through the take-profit band.
    world.stub.set_ticker(SYMBOL, dec!(102.5), dec!(10_000_000));
    let report = world.closer.tick().await.unwrap();
    assert_eq!(report.closed, 1);

    assert!(world.ledger.list_open().unwrap().is_empty());
    assert_eq!(world.stub.closed_orders().len(), 1);

    let state = world.ledger.risk_state().unwrap();
    assert_eq!(state.total_reserved_risk, Decimal::ZERO);
    let quantity = position.quantity.unwrap();
    assert_eq!(state.daily_pnl, (dec!(102.5) - entry) * quantity);
}

#[tokio::test]
async fn stop_loss_day_engages_circuit_breaker() {
    let world = build_world();

    world.scanner_worker.run_tick().await.unwrap();
    let position = world.ledger.list_open().unwrap().remove(0);
    let entry = position.entry_price.unwrap();
    let quantity = position.quantity.unwrap();

    // Collapse through the stop: the realized loss of ~612 breaches the
    // -500 daily limit on 10k capital.
    world.stub.set_ticker(SYMBOL, dec!(95), dec!(10_000_000));
    let report = world.closer.tick().await.unwrap();
    assert_eq!(report.closed, 1);

    let state = world.ledger.risk_state().unwrap();
    let expected_loss = (dec!(95) - entry) * quantity;
    assert_eq!(state.daily_pnl, expected_loss);
    assert!(state.daily_pnl <= dec!(-500));
    assert!(state.breached_at.is_some());

    // The same breakout signal is still live, but every reservation is
    // refused until the next UTC day.
    world.scanner_worker.run_tick().await.unwrap();
    assert!(world.ledger.list_open().unwrap().is_empty());

    let skips = world.ledger.store().skips_for(SYMBOL).unwrap();
    assert!(skips.iter().any(|s| s.starts_with("CIRCUIT_BREAKER")));

    // Next day the breaker clears and the slot can be claimed again.
    let tomorrow = chrono::Utc::now() + chrono::Duration::days(1);
    world.ledger.daily_rollover(tomorrow).await.unwrap();
    world.scanner_worker.run_tick().await.unwrap();
    assert_eq!(world.ledger.list_open().unwrap().len(), 1);
}

#[tokio::test]
async fn fast_discard_never_fires_on_fresh_positions() {
    let world = build_world();
    world.scanner_worker.run_tick().await.unwrap();

    // Several closer passes right after entry: inside the bands, younger
    // than the fast-exit clock, nothing closes.
    for _ in 0..3 {
        let report = world.closer.tick().await.unwrap();
        assert_eq!(report.closed, 0);
    }
    assert_eq!(world.ledger.list_open().unwrap().len(), 1);
}
