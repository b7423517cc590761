//! Trading engine.
//!
//! Consumes the scanner's candidate list in score order. For each
//! candidate: adaptive leverage from the score, notional sizing bounded by
//! the liquidity cap, the per-trade loss cap enforced by stepping leverage
//! down, then the reserve / place / commit handshake against the ledger.
//! Every drop lands in the skipped-trades log with a typed reason.

use crate::alerts::{AlertChannel, AlertKind};
use crate::config::{ExecutionConfig, RiskConfig};
use crate::exchange::{Direction, ExchangeApi, ExchangeError, MarketOrderRequest, OrderStatus};
use crate::ledger::{Ledger, LedgerError, ReserveRequest};
use crate::scanner::Candidate;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Quantity precision for market orders.
const QTY_DECIMALS: u32 = 8;

/// Why a candidate never became a position.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("RISK_EXCEEDED: loss cap infeasible even at 1x")]
    RiskExceeded,

    #[error("NO_CAPACITY: {0}")]
    NoCapacity(LedgerError),

    #[error("CIRCUIT_BREAKER: daily loss limit reached")]
    CircuitBreaker,

    #[error("DUPLICATE_SYMBOL: position already live")]
    DuplicateSymbol,

    #[error("CONTENDED: reservation retries exhausted")]
    Contended,

    #[error("ORDER_FAILED: {0}")]
    OrderFailed(ExchangeError),

    #[error("ORDER_UNFILLED: venue reported {0:?}")]
    OrderUnfilled(OrderStatus),

    #[error("ZERO_QUANTITY: sizing produced no tradable quantity")]
    ZeroQuantity,
}

/// Outcome of one engine pass over a candidate list.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub opened: u32,
    pub skipped: u32,
    /// Set when the tick stopped early on NO_CAPACITY or CIRCUIT_BREAKER.
    pub halted: bool,
}

/// Sizing decision for a single candidate. `reserved_risk` is the projected
/// stop-loss loss, the quantity the ledger accounts against the portfolio
/// cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sizing {
    pub leverage: u32,
    pub notional: Decimal,
    pub reserved_risk: Decimal,
    pub quantity: Decimal,
}

/// Leverage ladder from momentum score.
pub fn leverage_for_score(score: u32) -> u32 {
    match score {
        90..=u32::MAX => 7,
        80..=89 => 5,
        70..=79 => 3,
        _ => 2,
    }
}

pub struct TradingEngine {
    exchange: Arc<dyn ExchangeApi>,
    ledger: Ledger,
    risk: RiskConfig,
    execution: ExecutionConfig,
    capital: Decimal,
    alerts: AlertChannel,
}

impl TradingEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        ledger: Ledger,
        risk: RiskConfig,
        execution: ExecutionConfig,
        capital: Decimal,
        alerts: AlertChannel,
    ) -> Self {
        Self {
            exchange,
            ledger,
            risk,
            execution,
            capital,
            alerts,
        }
    }

    /// Process candidates serially in score-descending order, so the
    /// highest-conviction signal gets first claim on the slot budget.
    pub async fn execute_candidates(&self, candidates: &[Candidate]) -> EngineReport {
        let mut report = EngineReport::default();

        for candidate in candidates {
            match self.execute_one(candidate).await {
                Ok(()) => report.opened += 1,
                Err(reason @ (SkipReason::NoCapacity(_) | SkipReason::CircuitBreaker)) => {
                    self.record_skip(candidate, &reason);
                    report.skipped += 1;
                    report.halted = true;
                    info!(reason = %reason, "Tick halted; remaining candidates dropped");
                    break;
                }
                Err(reason) => {
                    self.record_skip(candidate, &reason);
                    report.skipped += 1;
                }
            }
        }
        report
    }

    async fn execute_one(&self, candidate: &Candidate) -> Result<(), SkipReason> {
        let sizing = self
            .size_candidate(candidate)
            .ok_or(SkipReason::RiskExceeded)?;
        if sizing.quantity <= Decimal::ZERO {
            return Err(SkipReason::ZeroQuantity);
        }

        let reservation = self
            .ledger
            .reserve_slot(&ReserveRequest {
                symbol: candidate.symbol.clone(),
                margin: sizing.reserved_risk,
                leverage: sizing.leverage,
                direction: candidate.direction,
                score: candidate.score,
            })
            .await
            .map_err(|e| match e {
                LedgerError::DuplicateSymbol => SkipReason::DuplicateSymbol,
                LedgerError::Contended => SkipReason::Contended,
                LedgerError::CircuitBreaker => SkipReason::CircuitBreaker,
                other => SkipReason::NoCapacity(other),
            })?;

        let order = MarketOrderRequest {
            symbol: candidate.symbol.clone(),
            side: candidate.direction.entry_side(),
            quantity: sizing.quantity,
            leverage: reservation.leverage_granted,
        };

        let deadline = Duration::from_secs(self.execution.order_timeout_secs);
        let fill = match tokio::time::timeout(deadline, self.exchange.place_market_order(&order))
            .await
        {
            Ok(Ok(fill)) if fill.status == OrderStatus::Filled => fill,
            Ok(Ok(fill)) => {
                self.ledger
                    .rollback_reservation(&reservation.reservation_id)
                    .await
                    .ok();
                return Err(SkipReason::OrderUnfilled(fill.status));
            }
            Ok(Err(e)) => {
                self.ledger
                    .rollback_reservation(&reservation.reservation_id)
                    .await
                    .ok();
                return Err(SkipReason::OrderFailed(e));
            }
            Err(_) => {
                // Confirmation never arrived. The order may have filled, so
                // the reservation stays for the reconciler; the order is
                // never retried.
                self.alerts.raise(
                    AlertKind::CommitTimeout,
                    Some(&candidate.symbol),
                    "order confirmation timed out; reservation left for reconciliation",
                );
                return Ok(());
            }
        };

        // Recompute exits from the actual fill price.
        let tp_dist = self.execution.tp_mult * candidate.atr;
        let sl_dist = self.execution.sl_mult * candidate.atr;
        let (tp, sl) = match candidate.direction {
            Direction::Long => (fill.avg_price + tp_dist, fill.avg_price - sl_dist),
            Direction::Short => (fill.avg_price - tp_dist, fill.avg_price + sl_dist),
        };

        // The fill is real even if the commit write fails; leave such a
        // reservation for the reconciler rather than unwinding the order.
        if let Err(e) = self
            .ledger
            .commit_position(
                &reservation.reservation_id,
                fill.avg_price,
                fill.executed_qty,
                tp,
                sl,
                candidate.atr,
            )
            .await
        {
            self.alerts.raise(
                AlertKind::CommitTimeout,
                Some(&candidate.symbol),
                format!("commit failed after fill: {e}; reservation left for reconciliation"),
            );
            return Ok(());
        }

        let context = json!({
            "score": candidate.score,
            "atr": candidate.atr.to_string(),
            "volume_ratio": candidate.volume_ratio.to_string(),
            "crossover": candidate.crossover,
            "night_pump": candidate.night_pump,
            "session_factor": candidate.session_factor.to_string(),
            "mobility_rank": candidate.mobility_rank.to_string(),
            "snapshot_time": candidate.snapshot_time.to_rfc3339(),
        })
        .to_string();
        if let Err(e) = self.ledger.store().record_trade_open(
            &candidate.symbol,
            candidate.direction,
            fill.avg_price,
            fill.executed_qty,
            reservation.leverage_granted,
            &context,
        ) {
            warn!(symbol = %candidate.symbol, error = %e, "Trade history append failed");
        }

        info!(
            symbol = %candidate.symbol,
            direction = candidate.direction.as_str(),
            score = candidate.score,
            entry = %fill.avg_price,
            quantity = %fill.executed_qty,
            leverage = reservation.leverage_granted,
            tp = %tp,
            sl = %sl,
            "Position opened"
        );
        Ok(())
    }

    /// Sizing with the per-trade loss cap: step leverage down until the
    /// projected stop-loss hit fits the budget, or give up below 1x.
    pub fn size_candidate(&self, candidate: &Candidate) -> Option<Sizing> {
        let sl_distance_pct = if candidate.price == Decimal::ZERO {
            return None;
        } else {
            (candidate.price - candidate.suggested_sl).abs() / candidate.price
        };
        let loss_budget = self.capital * self.risk.max_loss_per_trade;
        let per_trade = self.capital / Decimal::from(self.risk.max_open_trades);
        let liquidity_cap = candidate.volume_24h * self.execution.liquidity_cap;

        let mut leverage = leverage_for_score(candidate.score);
        loop {
            let notional = (per_trade * Decimal::from(leverage)).min(liquidity_cap);
            let projected_loss = sl_distance_pct * Decimal::from(leverage) * notional;
            if projected_loss <= loss_budget {
                let quantity = (notional / candidate.price).round_dp(QTY_DECIMALS);
                return Some(Sizing {
                    leverage,
                    notional,
                    reserved_risk: projected_loss,
                    quantity,
                });
            }
            if leverage == 1 {
                return None;
            }
            leverage -= 1;
        }
    }

    fn record_skip(&self, candidate: &Candidate, reason: &SkipReason) {
        info!(symbol = %candidate.symbol, reason = %reason, "Candidate skipped");
        if let Err(e) = self
            .ledger
            .store()
            .record_skip(&candidate.symbol, &reason.to_string())
        {
            warn!(symbol = %candidate.symbol, error = %e, "Skip log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::StubExchange;
    use crate::ledger::{PositionStatus, RiskLimits, SqliteStore};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    // ===== Leverage ladder =====

    #[test]
    fn test_leverage_ladder() {
        assert_eq!(leverage_for_score(60), 2);
        assert_eq!(leverage_for_score(69), 2);
        assert_eq!(leverage_for_score(70), 3);
        assert_eq!(leverage_for_score(79), 3);
        assert_eq!(leverage_for_score(80), 5);
        assert_eq!(leverage_for_score(89), 5);
        assert_eq!(leverage_for_score(90), 7);
        assert_eq!(leverage_for_score(100), 7);
    }

    // ===== Harness =====

    fn candidate(symbol: &str, score: u32) -> Candidate {
        let price = dec!(100);
        let atr = dec!(0.4);
        Candidate {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            score,
            price,
            atr,
            suggested_tp: price + dec!(2) * atr,
            suggested_sl: price - atr,
            volume_24h: dec!(50_000_000),
            volume_ratio: dec!(2),
            crossover: true,
            night_pump: false,
            session_factor: Decimal::ONE,
            mobility_rank: dec!(1),
            snapshot_time: Utc::now(),
        }
    }

    struct Harness {
        engine: TradingEngine,
        ledger: Ledger,
        stub: Arc<StubExchange>,
    }

    fn harness() -> Harness {
        let stub = Arc::new(
            StubExchange::new()
                .with_ticker("AUSDT", dec!(100), dec!(50_000_000))
                .with_ticker("BUSDT", dec!(100), dec!(50_000_000))
                .with_ticker("CUSDT", dec!(100), dec!(50_000_000))
                .with_ticker("DUSDT", dec!(100), dec!(50_000_000)),
        );
        let limits = RiskLimits {
            capital: dec!(10000),
            max_open_trades: 3,
            max_portfolio_risk: dec!(0.20),
            daily_loss_limit: dec!(0.05),
        };
        let ledger = Ledger::new(Arc::new(SqliteStore::in_memory().unwrap()), limits);
        let (alerts, _rx) = AlertChannel::new();
        let engine = TradingEngine::new(
            stub.clone(),
            ledger.clone(),
            RiskConfig::default(),
            ExecutionConfig::default(),
            dec!(10000),
            alerts,
        );
        Harness {
            engine,
            ledger,
            stub,
        }
    }

    // ===== Sizing =====

    #[test]
    fn test_sizing_steps_leverage_down_to_fit_loss_cap() {
        let h = harness();
        // Score 100 -> 7x ladder. SL distance 0.4% of price; at 7x the
        // projected loss 0.004 * 7 * 23333 = 653 blows the 2% budget, and
        // stepping down lands on 3x: 0.004 * 3 * 10000 = 120.
        let sizing = h.engine.size_candidate(&candidate("AUSDT", 100)).unwrap();
        assert_eq!(sizing.leverage, 3);
        let expected_notional = dec!(10000) / dec!(3) * dec!(3);
        assert_eq!(sizing.notional, expected_notional);
        assert_eq!(sizing.reserved_risk, dec!(0.004) * dec!(3) * expected_notional);
        assert!(sizing.reserved_risk <= dec!(200));
    }

    #[test]
    fn test_sizing_liquidity_cap_binds() {
        let h = harness();
        let mut c = candidate("AUSDT", 60);
        c.volume_24h = dec!(1_000_000);
        // Cap = 0.5% of 1M = 5000 < per_trade * leverage.
        let sizing = h.engine.size_candidate(&c).unwrap();
        assert!(sizing.notional <= dec!(5000));
    }

    #[test]
    fn test_sizing_infeasible_skips() {
        let h = harness();
        let mut c = candidate("AUSDT", 60);
        // Stop 30% away: even 1x on the full per-trade slice loses > 2%.
        c.suggested_sl = dec!(70);
        assert!(h.engine.size_candidate(&c).is_none());
    }

    // ===== Execution flow =====

    #[tokio::test]
    async fn test_candidate_opens_position() {
        let h = harness();
        let report = h.engine.execute_candidates(&[candidate("AUSDT", 75)]).await;

        assert_eq!(report.opened, 1);
        assert_eq!(report.skipped, 0);

        let open = h.ledger.list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "AUSDT");
        assert_eq!(open[0].status, PositionStatus::Open);
        // Exits recomputed from the fill at 100 with ATR 0.4.
        assert_eq!(open[0].tp_price, Some(dec!(100.8)));
        assert_eq!(open[0].sl_price, Some(dec!(99.6)));
        assert_eq!(h.stub.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_symbol_skipped_and_logged() {
        let h = harness();
        h.engine.execute_candidates(&[candidate("AUSDT", 75)]).await;
        let report = h.engine.execute_candidates(&[candidate("AUSDT", 80)]).await;

        assert_eq!(report.opened, 0);
        assert_eq!(report.skipped, 1);
        let skips = h.ledger.store().skips_for("AUSDT").unwrap();
        assert_eq!(skips.len(), 1);
        assert!(skips[0].starts_with("DUPLICATE_SYMBOL"));
        // The live reservation count is unchanged.
        assert_eq!(h.ledger.store().live_positions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_capacity_halts_tick() {
        let h = harness();
        let candidates = vec![
            candidate("AUSDT", 95),
            candidate("BUSDT", 85),
            candidate("CUSDT", 75),
            candidate("DUSDT", 65),
        ];
        let report = h.engine.execute_candidates(&candidates).await;

        // Three slots fill; the fourth hits NO_CAPACITY and halts.
        assert_eq!(report.opened, 3);
        assert!(report.halted);
        assert_eq!(h.ledger.list_open().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_order_failure_rolls_back_reservation() {
        let h = harness();
        h.stub.fail_next_orders(1);
        let report = h.engine.execute_candidates(&[candidate("AUSDT", 75)]).await;

        assert_eq!(report.opened, 0);
        assert_eq!(report.skipped, 1);
        assert!(h.ledger.store().live_positions().unwrap().is_empty());
        assert_eq!(h.ledger.risk_state().unwrap().total_reserved_risk, dec!(0));

        let skips = h.ledger.store().skips_for("AUSDT").unwrap();
        assert!(skips[0].starts_with("ORDER_FAILED"));
    }

    #[tokio::test]
    async fn test_trade_history_context_recorded() {
        let h = harness();
        h.engine.execute_candidates(&[candidate("AUSDT", 75)]).await;
        // The scoring context is serialized with the OPEN event; duplicate
        // inserts would violate the append-only expectations.
        let open = h.ledger.list_open().unwrap();
        assert_eq!(open[0].score_at_entry, 75);
        assert_eq!(open[0].leverage, 3);
    }
}
