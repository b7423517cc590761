//! Ledger/venue reconciliation sweep.
//!
//! Runs at the start of every scanner tick. Worker deaths can strand a
//! reservation between the exchange fill and `commit_position`, and a venue
//! outage can leave the ledger believing in positions the venue no longer
//! holds. The sweep repairs both directions so the risk accounting stays
//! truthful across worker restarts.

use super::{Ledger, LedgerError, PositionStatus};
use crate::alerts::{AlertChannel, AlertKind};
use crate::exchange::{ExchangeApi, VenuePosition};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Protective exit distances applied when a stranded reservation is promoted
/// without its signal-time ATR.
const EMERGENCY_TP_PCT: Decimal = dec!(0.01);
const EMERGENCY_SL_PCT: Decimal = dec!(0.005);

/// How long a RESERVED row may exist before an absent venue order means the
/// entry never happened.
const RESERVATION_GRACE_SECS: i64 = 60;

/// Outcome counters for one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: u32,
    pub rolled_back: u32,
    pub ghosts_closed: u32,
    pub venue_only: u32,
}

pub struct Reconciler {
    ledger: Ledger,
    exchange: Arc<dyn ExchangeApi>,
    alerts: AlertChannel,
}

impl Reconciler {
    pub fn new(ledger: Ledger, exchange: Arc<dyn ExchangeApi>, alerts: AlertChannel) -> Self {
        Self {
            ledger,
            exchange,
            alerts,
        }
    }

    /// Sweep the ledger against venue state, correcting both sides.
    pub async fn sweep(&self) -> Result<SweepReport, LedgerError> {
        let venue: HashMap<String, VenuePosition> = match self.exchange.fetch_positions().await {
            Ok(positions) => positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped: venue positions unavailable");
                return Ok(SweepReport::default());
            }
        };

        let mut report = SweepReport::default();
        let live = self.ledger.store().live_positions()?;

        for position in &live {
            match position.status {
                PositionStatus::Reserved => match venue.get(&position.symbol) {
                    Some(on_venue) => {
                        self.promote(&position.reservation_id, on_venue).await?;
                        report.promoted += 1;
                    }
                    None => {
                        let age = Utc::now() - position.updated_at;
                        if age > ChronoDuration::seconds(RESERVATION_GRACE_SECS) {
                            self.ledger
                                .rollback_reservation(&position.reservation_id)
                                .await?;
                            info!(symbol = %position.symbol, "Stale reservation rolled back");
                            report.rolled_back += 1;
                        }
                    }
                },
                PositionStatus::Open | PositionStatus::Closing => {
                    if !venue.contains_key(&position.symbol) {
                        self.close_ghost(&position.symbol, position.status).await?;
                        report.ghosts_closed += 1;
                    }
                }
                PositionStatus::Closed => {}
            }
        }

        for symbol in venue.keys() {
            if !live.iter().any(|p| p.symbol == *symbol) {
                self.alerts.raise(
                    AlertKind::ReconciliationAnomaly,
                    Some(symbol),
                    "venue holds a position the ledger does not know",
                );
                report.venue_only += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                promoted = report.promoted,
                rolled_back = report.rolled_back,
                ghosts_closed = report.ghosts_closed,
                venue_only = report.venue_only,
                "Reconciliation sweep applied corrections"
            );
        }
        Ok(report)
    }

    /// A fill happened but the worker died before commit: adopt the venue's
    /// numbers, with tight protective exits until the closer takes over.
    async fn promote(
        &self,
        reservation_id: &str,
        on_venue: &VenuePosition,
    ) -> Result<(), LedgerError> {
        let entry = on_venue.entry_price;
        let (tp, sl) = match on_venue.direction {
            crate::exchange::Direction::Long => (
                entry * (Decimal::ONE + EMERGENCY_TP_PCT),
                entry * (Decimal::ONE - EMERGENCY_SL_PCT),
            ),
            crate::exchange::Direction::Short => (
                entry * (Decimal::ONE - EMERGENCY_TP_PCT),
                entry * (Decimal::ONE + EMERGENCY_SL_PCT),
            ),
        };

        self.ledger
            .commit_position(reservation_id, entry, on_venue.quantity, tp, sl, Decimal::ZERO)
            .await?;
        self.alerts.raise(
            AlertKind::ReconciliationAnomaly,
            Some(&on_venue.symbol),
            "stranded reservation promoted to OPEN from venue state",
        );
        Ok(())
    }

    /// The ledger believes in a position the venue no longer holds.
    async fn close_ghost(&self, symbol: &str, status: PositionStatus) -> Result<(), LedgerError> {
        let token = match status {
            PositionStatus::Open => self.ledger.begin_close(symbol, "GHOST_CLEANUP").await?,
            _ => match self
                .ledger
                .list_closing()?
                .into_iter()
                .find(|p| p.symbol == symbol)
                .and_then(|p| p.close_token)
            {
                Some(token) => super::CloseToken(token),
                None => return Ok(()),
            },
        };

        self.ledger
            .finalize_close(&token, Decimal::ZERO, Decimal::ZERO)
            .await?;
        self.ledger
            .store()
            .record_trade_close(symbol, Decimal::ZERO, Decimal::ZERO, "GHOST_CLEANUP")?;
        self.alerts.raise(
            AlertKind::ReconciliationAnomaly,
            Some(symbol),
            "ghost position closed: ledger row had no venue counterpart",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::StubExchange;
    use crate::exchange::Direction;
    use crate::ledger::{ReserveRequest, RiskLimits, SqliteStore};

    fn test_setup(stub: StubExchange) -> (Ledger, Reconciler) {
        let limits = RiskLimits {
            capital: dec!(10000),
            max_open_trades: 3,
            max_portfolio_risk: dec!(0.20),
            daily_loss_limit: dec!(0.05),
        };
        let ledger = Ledger::new(Arc::new(SqliteStore::in_memory().unwrap()), limits);
        let (alerts, _rx) = AlertChannel::new();
        let reconciler = Reconciler::new(ledger.clone(), Arc::new(stub), alerts);
        (ledger, reconciler)
    }

    fn reserve_req(symbol: &str) -> ReserveRequest {
        ReserveRequest {
            symbol: symbol.to_string(),
            margin: dec!(500),
            leverage: 3,
            direction: Direction::Long,
            score: 70,
        }
    }

    #[tokio::test]
    async fn test_stranded_reservation_promoted() {
        let stub = StubExchange::new();
        stub.set_position(VenuePosition {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            quantity: dec!(0.5),
            entry_price: dec!(50000),
        });
        let (ledger, reconciler) = test_setup(stub);

        ledger.reserve_slot(&reserve_req("BTCUSDT")).await.unwrap();
        let report = reconciler.sweep().await.unwrap();

        assert_eq!(report.promoted, 1);
        let open = ledger.list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entry_price, Some(dec!(50000)));
        assert_eq!(open[0].quantity, Some(dec!(0.5)));
    }

    #[tokio::test]
    async fn test_fresh_reservation_left_alone() {
        let (ledger, reconciler) = test_setup(StubExchange::new());
        ledger.reserve_slot(&reserve_req("BTCUSDT")).await.unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.rolled_back, 0);
        assert_eq!(ledger.store().live_positions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ghost_open_position_closed() {
        let (ledger, reconciler) = test_setup(StubExchange::new());

        let reservation = ledger.reserve_slot(&reserve_req("BTCUSDT")).await.unwrap();
        ledger
            .commit_position(
                &reservation.reservation_id,
                dec!(100),
                dec!(1),
                dec!(102),
                dec!(99),
                dec!(1),
            )
            .await
            .unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.ghosts_closed, 1);
        assert!(ledger.list_open().unwrap().is_empty());
        assert_eq!(ledger.risk_state().unwrap().total_reserved_risk, dec!(0));
    }

    #[tokio::test]
    async fn test_venue_only_position_raises_alert() {
        let stub = StubExchange::new();
        stub.set_position(VenuePosition {
            symbol: "ETHUSDT".to_string(),
            direction: Direction::Short,
            quantity: dec!(1),
            entry_price: dec!(3000),
        });
        let limits = RiskLimits {
            capital: dec!(10000),
            max_open_trades: 3,
            max_portfolio_risk: dec!(0.20),
            daily_loss_limit: dec!(0.05),
        };
        let ledger = Ledger::new(Arc::new(SqliteStore::in_memory().unwrap()), limits);
        let (alerts, mut rx) = AlertChannel::new();
        let reconciler = Reconciler::new(ledger, Arc::new(stub), alerts);

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.venue_only, 1);

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.kind, AlertKind::ReconciliationAnomaly);
        assert_eq!(alert.symbol.as_deref(), Some("ETHUSDT"));
    }
}
