//! Position closer.
//!
//! Stateless high-frequency loop: re-price open positions, run the exit
//! state machine, and submit market closes for anything that triggered.
//! Multiple workers run concurrently; `begin_close` is the only
//! serialization point, so a trigger seen by two workers produces exactly
//! one close order. CLOSING rows left behind by failed submissions are
//! retried on every pass until they finalize or are flagged stuck.

use crate::alerts::{AlertChannel, AlertKind};
use crate::config::CloserConfig;
use crate::exchange::{Direction, ExchangeApi, ExchangeError, OrderFill};
use crate::ledger::{CloseToken, Ledger, LedgerError, Position};
use crate::market_data::MarketDataGateway;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts per cycle for the close order, with backoff between them.
const CLOSE_ATTEMPTS: usize = 3;
const CLOSE_BACKOFF_MS: [u64; 2] = [200, 500];

/// Consecutive failed cycles before a position is flagged stuck.
const STUCK_AFTER_FAILURES: u32 = 3;

/// Exit triggers in priority order; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    SlHit,
    TpHit,
    NewsBlackout,
    TimeExit,
    FastDiscard,
}

impl ExitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::SlHit => "SL_HIT",
            ExitTrigger::TpHit => "TP_HIT",
            ExitTrigger::NewsBlackout => "NEWS_BLACKOUT",
            ExitTrigger::TimeExit => "TIME_EXIT",
            ExitTrigger::FastDiscard => "FAST_DISCARD",
        }
    }
}

/// Outcome of one closer pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CloserReport {
    pub checked: u32,
    pub closed: u32,
    pub retried: u32,
    pub failed: u32,
}

/// Run the exit state machine for one position against the current mark.
pub fn evaluate_exit(
    position: &Position,
    mark: Decimal,
    now: DateTime<Utc>,
    config: &CloserConfig,
) -> Option<ExitTrigger> {
    let sl = position.sl_price?;
    let tp = position.tp_price?;
    let opened_at = position.opened_at?;

    let sl_hit = match position.direction {
        Direction::Long => mark <= sl,
        Direction::Short => mark >= sl,
    };
    if sl_hit {
        return Some(ExitTrigger::SlHit);
    }

    let tp_hit = match position.direction {
        Direction::Long => mark >= tp,
        Direction::Short => mark <= tp,
    };
    if tp_hit {
        return Some(ExitTrigger::TpHit);
    }

    let window = ChronoDuration::minutes(config.news_blackout_window_min);
    let blackout = config
        .news_blackout_starts
        .iter()
        .any(|start| now >= *start - window && now <= *start + window);
    if blackout {
        return Some(ExitTrigger::NewsBlackout);
    }

    let held = now - opened_at;
    if held >= ChronoDuration::minutes(config.max_hold_minutes) {
        return Some(ExitTrigger::TimeExit);
    }

    if held >= ChronoDuration::minutes(config.fast_exit_minutes) {
        let pnl_pct = position.unrealized_pnl_pct(mark)?;
        if pnl_pct.abs() < config.fast_exit_threshold * Decimal::ONE_HUNDRED {
            return Some(ExitTrigger::FastDiscard);
        }
    }

    None
}

pub struct PositionCloser {
    gateway: Arc<MarketDataGateway>,
    exchange: Arc<dyn ExchangeApi>,
    ledger: Ledger,
    config: CloserConfig,
    alerts: AlertChannel,
}

impl PositionCloser {
    pub fn new(
        gateway: Arc<MarketDataGateway>,
        exchange: Arc<dyn ExchangeApi>,
        ledger: Ledger,
        config: CloserConfig,
        alerts: AlertChannel,
    ) -> Self {
        Self {
            gateway,
            exchange,
            ledger,
            config,
            alerts,
        }
    }

    /// One closer pass. Aborts only if open positions cannot be read; a
    /// failure on one symbol never blocks the others.
    pub async fn tick(&self) -> Result<CloserReport, LedgerError> {
        let mut report = CloserReport::default();

        // Finish what earlier cycles started before looking at new exits.
        for position in self.ledger.list_closing()? {
            let Some(token) = position.close_token.clone() else {
                continue;
            };
            let reason = position
                .exit_reason
                .clone()
                .unwrap_or_else(|| "TIME_EXIT".to_string());
            report.retried += 1;
            self.submit_close(&position, CloseToken(token), &reason, &mut report)
                .await;
        }

        let open = self.ledger.list_open()?;
        let now = Utc::now();

        for position in open {
            report.checked += 1;

            let mark = match self.gateway.mark_price(&position.symbol).await {
                Ok(ticker) => ticker.last_price,
                Err(e) => {
                    debug!(symbol = %position.symbol, error = %e, "No mark price; position skipped this pass");
                    continue;
                }
            };

            let Some(trigger) = evaluate_exit(&position, mark, now, &self.config) else {
                continue;
            };

            let token = match self
                .ledger
                .begin_close(&position.symbol, trigger.as_str())
                .await
            {
                Ok(token) => token,
                Err(LedgerError::AlreadyClosing) => {
                    debug!(symbol = %position.symbol, "Another worker owns this close");
                    continue;
                }
                Err(LedgerError::NotOpen) => {
                    debug!(symbol = %position.symbol, "Position vanished; reconciler will verify");
                    continue;
                }
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "begin_close failed");
                    continue;
                }
            };

            info!(
                symbol = %position.symbol,
                trigger = trigger.as_str(),
                mark = %mark,
                "Exit triggered"
            );
            self.submit_close(&position, token, trigger.as_str(), &mut report)
                .await;
        }

        Ok(report)
    }

    /// Submit the market close and finalize the ledger row. On repeated
    /// failure the position stays CLOSING for the next cycle.
    async fn submit_close(
        &self,
        position: &Position,
        token: CloseToken,
        reason: &str,
        report: &mut CloserReport,
    ) {
        let Some(quantity) = position.quantity else {
            return;
        };
        let side = position.direction.exit_side();

        match self.close_with_retry(&position.symbol, side, quantity).await {
            Ok(fill) => {
                let exit_price = fill.avg_price;
                let pnl = position.realized_pnl_at(exit_price).unwrap_or(Decimal::ZERO);

                if let Err(e) = self.ledger.finalize_close(&token, exit_price, pnl).await {
                    warn!(symbol = %position.symbol, error = %e, "finalize_close failed");
                    report.failed += 1;
                    return;
                }
                if let Err(e) =
                    self.ledger
                        .store()
                        .record_trade_close(&position.symbol, exit_price, pnl, reason)
                {
                    warn!(symbol = %position.symbol, error = %e, "Close history append failed");
                }

                info!(
                    symbol = %position.symbol,
                    exit_reason = reason,
                    exit_price = %exit_price,
                    pnl = %pnl,
                    "Position closed"
                );
                report.closed += 1;
            }
            Err(e) => {
                report.failed += 1;
                let failures = self
                    .ledger
                    .store()
                    .record_close_failure(&position.symbol)
                    .unwrap_or(0);
                warn!(
                    symbol = %position.symbol,
                    error = %e,
                    consecutive_failures = failures,
                    "Close order failed; position stays CLOSING"
                );
                if failures == STUCK_AFTER_FAILURES {
                    self.ledger.store().mark_stuck(&position.symbol).ok();
                    self.alerts.raise(
                        AlertKind::StuckPosition,
                        Some(&position.symbol),
                        format!("unable to close after {failures} cycles"),
                    );
                }
            }
        }
    }

    async fn close_with_retry(
        &self,
        symbol: &str,
        side: crate::exchange::OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        let mut last_err = ExchangeError::Unknown("no attempt made".to_string());
        for attempt in 0..CLOSE_ATTEMPTS {
            match self.exchange.close_position(symbol, side, quantity).await {
                Ok(fill) => return Ok(fill),
                Err(e) => {
                    last_err = e;
                    if attempt < CLOSE_BACKOFF_MS.len() {
                        tokio::time::sleep(Duration::from_millis(CLOSE_BACKOFF_MS[attempt])).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}
