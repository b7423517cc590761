//! Authoritative risk ledger.
//!
//! Every position-opening decision flows through `reserve_slot`, a single
//! conditional write that verifies the exposure invariants and inserts a
//! tentative RESERVED row. The reservation is either committed into an OPEN
//! position after the exchange fill, or rolled back. Closes go through the
//! `begin_close` / `finalize_close` handshake so concurrent closer workers
//! cannot double-submit exits.

mod reconciler;
mod store;

pub use reconciler::Reconciler;
pub use store::SqliteStore;

use crate::config::Config;
use crate::exchange::Direction;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Exponential backoff for contended conditional writes, capped per the
/// three-attempt budget.
const CONTENTION_BACKOFF_MS: [u64; 2] = [50, 200];

/// Ledger operation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("no remaining risk capacity")]
    NoCapacity,

    #[error("symbol already holds a live position")]
    DuplicateSymbol,

    #[error("daily loss circuit breaker engaged")]
    CircuitBreaker,

    #[error("conditional write contended")]
    Contended,

    #[error("unknown reservation")]
    UnknownReservation,

    #[error("reservation already committed")]
    AlreadyCommitted,

    #[error("position is not open")]
    NotOpen,

    #[error("position is already closing")]
    AlreadyClosing,

    #[error("unknown close token")]
    UnknownCloseToken,

    #[error("ledger store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Store(e.to_string())
    }
}

/// Position lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Reserved,
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Reserved => "RESERVED",
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub(crate) fn from_str_or_closed(s: &str) -> Self {
        match s {
            "RESERVED" => PositionStatus::Reserved,
            "OPEN" => PositionStatus::Open,
            "CLOSING" => PositionStatus::Closing,
            _ => PositionStatus::Closed,
        }
    }
}

/// Persisted position record.
#[derive(Debug, Clone)]
pub struct Position {
    pub reservation_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub status: PositionStatus,
    pub margin_committed: Decimal,
    pub leverage: u32,
    pub score_at_entry: u32,
    pub entry_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub atr_at_entry: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    pub close_token: Option<String>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
    pub closer_failures: u32,
    pub stuck: bool,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Unrealized PnL percent at the given mark price. `None` before commit.
    pub fn unrealized_pnl_pct(&self, mark: Decimal) -> Option<Decimal> {
        let entry = self.entry_price?;
        if entry == Decimal::ZERO {
            return None;
        }
        let raw = (mark - entry) / entry * Decimal::ONE_HUNDRED;
        Some(match self.direction {
            Direction::Long => raw,
            Direction::Short => -raw,
        })
    }

    /// Realized PnL for a fill at `exit`. `None` before commit.
    pub fn realized_pnl_at(&self, exit: Decimal) -> Option<Decimal> {
        let entry = self.entry_price?;
        let quantity = self.quantity?;
        Some(match self.direction {
            Direction::Long => (exit - entry) * quantity,
            Direction::Short => (entry - exit) * quantity,
        })
    }
}

/// Snapshot of the risk accumulator.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub version: u64,
    pub day: NaiveDate,
    pub daily_pnl: Decimal,
    pub total_reserved_risk: Decimal,
    pub breached_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Limits enforced by every reservation.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub capital: Decimal,
    pub max_open_trades: u32,
    pub max_portfolio_risk: Decimal,
    pub daily_loss_limit: Decimal,
}

impl RiskLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capital: config.capital,
            max_open_trades: config.risk.max_open_trades,
            max_portfolio_risk: config.risk.max_portfolio_risk,
            daily_loss_limit: config.risk.daily_loss_limit,
        }
    }
}

/// Request for a risk slot.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub symbol: String,
    pub margin: Decimal,
    pub leverage: u32,
    pub direction: Direction,
    pub score: u32,
}

/// Granted reservation.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: String,
    pub leverage_granted: u32,
    pub margin_granted: Decimal,
}

/// Token proving exclusive rights to finalize a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseToken(pub String);

/// The risk ledger. Cheap to clone and share between workers.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<SqliteStore>,
    limits: RiskLimits,
}

impl Ledger {
    pub fn new(store: Arc<SqliteStore>, limits: RiskLimits) -> Self {
        Self { store, limits }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Atomically claim a risk slot, inserting a RESERVED row.
    pub async fn reserve_slot(&self, req: &ReserveRequest) -> Result<Reservation, LedgerError> {
        let reservation_id = Uuid::new_v4().to_string();
        self.with_contention_retry(|| {
            self.store.try_reserve(req, &reservation_id, &self.limits)
        })
        .await?;
        Ok(Reservation {
            reservation_id,
            leverage_granted: req.leverage,
            margin_granted: req.margin,
        })
    }

    /// RESERVED -> OPEN with fill details. Idempotent per reservation.
    pub async fn commit_position(
        &self,
        reservation_id: &str,
        entry_price: Decimal,
        quantity: Decimal,
        tp_price: Decimal,
        sl_price: Decimal,
        atr: Decimal,
    ) -> Result<(), LedgerError> {
        self.store
            .commit_position(reservation_id, entry_price, quantity, tp_price, sl_price, atr)
    }

    /// Release a reservation whose exchange order never materialized.
    pub async fn rollback_reservation(&self, reservation_id: &str) -> Result<(), LedgerError> {
        self.with_contention_retry(|| self.store.rollback_reservation(reservation_id))
            .await
    }

    /// Read-only view of OPEN positions; may lag by one replication round.
    pub fn list_open(&self) -> Result<Vec<Position>, LedgerError> {
        self.store.positions_with_status(PositionStatus::Open)
    }

    /// CLOSING positions whose exit order still needs to be (re)submitted.
    pub fn list_closing(&self) -> Result<Vec<Position>, LedgerError> {
        self.store.positions_with_status(PositionStatus::Closing)
    }

    /// OPEN -> CLOSING. Exactly one caller per symbol wins the token.
    pub async fn begin_close(
        &self,
        symbol: &str,
        exit_reason: &str,
    ) -> Result<CloseToken, LedgerError> {
        let token = Uuid::new_v4().to_string();
        self.store.begin_close(symbol, exit_reason, &token)?;
        debug!(%symbol, exit_reason, "Close ownership acquired");
        Ok(CloseToken(token))
    }

    /// CLOSING -> CLOSED, releasing risk and folding PnL into the day.
    pub async fn finalize_close(
        &self,
        token: &CloseToken,
        exit_price: Decimal,
        realized_pnl: Decimal,
    ) -> Result<(), LedgerError> {
        self.with_contention_retry(|| {
            self.store
                .finalize_close(&token.0, exit_price, realized_pnl, &self.limits)
        })
        .await
    }

    /// Reset the daily accumulator when the UTC day has advanced.
    pub async fn daily_rollover(&self, now: DateTime<Utc>) -> Result<bool, LedgerError> {
        self.store.daily_rollover(now)
    }

    pub fn risk_state(&self) -> Result<RiskState, LedgerError> {
        self.store.risk_state()
    }

    async fn with_contention_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let attempts = CONTENTION_BACKOFF_MS.len() + 1;
        for attempt in 0..attempts {
            match op() {
                Err(LedgerError::Contended) if attempt + 1 < attempts => {
                    let base = CONTENTION_BACKOFF_MS[attempt];
                    let jitter = rand::thread_rng().gen_range(0..base);
                    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                }
                other => return other,
            }
        }
        Err(LedgerError::Contended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_limits() -> RiskLimits {
        RiskLimits {
            capital: dec!(10000),
            max_open_trades: 3,
            max_portfolio_risk: dec!(0.20),
            daily_loss_limit: dec!(0.05),
        }
    }

    fn test_ledger() -> Ledger {
        Ledger::new(Arc::new(SqliteStore::in_memory().unwrap()), test_limits())
    }

    fn reserve_req(symbol: &str, margin: Decimal) -> ReserveRequest {
        ReserveRequest {
            symbol: symbol.to_string(),
            margin,
            leverage: 3,
            direction: Direction::Long,
            score: 75,
        }
    }

    async fn open_position(ledger: &Ledger, symbol: &str, margin: Decimal, entry: Decimal) {
        let reservation = ledger.reserve_slot(&reserve_req(symbol, margin)).await.unwrap();
        ledger
            .commit_position(
                &reservation.reservation_id,
                entry,
                dec!(1),
                entry + dec!(2),
                entry - dec!(1),
                dec!(1),
            )
            .await
            .unwrap();
    }

    // ===== Reservation invariants =====

    #[tokio::test]
    async fn test_reserve_and_commit_opens_position() {
        let ledger = test_ledger();
        open_position(&ledger, "BTCUSDT", dec!(500), dec!(100)).await;

        let open = ledger.list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "BTCUSDT");
        assert_eq!(open[0].entry_price, Some(dec!(100)));
        assert_eq!(ledger.risk_state().unwrap().total_reserved_risk, dec!(500));
    }

    #[tokio::test]
    async fn test_duplicate_symbol_rejected() {
        let ledger = test_ledger();
        open_position(&ledger, "BTCUSDT", dec!(500), dec!(100)).await;

        let err = ledger
            .reserve_slot(&reserve_req("BTCUSDT", dec!(100)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicateSymbol);
        assert_eq!(ledger.live_count(), 1);
    }

    #[tokio::test]
    async fn test_portfolio_risk_cap() {
        // 600 + 700 committed, 800 requested, cap 2000.
        let ledger = test_ledger();
        open_position(&ledger, "AUSDT", dec!(600), dec!(10)).await;
        open_position(&ledger, "BUSDT", dec!(700), dec!(10)).await;

        let err = ledger
            .reserve_slot(&reserve_req("CUSDT", dec!(800)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::NoCapacity);

        // 600 + 700 + 700 = 2000 fits exactly.
        ledger
            .reserve_slot(&reserve_req("CUSDT", dec!(700)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_max_open_trades_cap() {
        let ledger = test_ledger();
        open_position(&ledger, "AUSDT", dec!(100), dec!(10)).await;
        open_position(&ledger, "BUSDT", dec!(100), dec!(10)).await;
        open_position(&ledger, "CUSDT", dec!(100), dec!(10)).await;

        let err = ledger
            .reserve_slot(&reserve_req("DUSDT", dec!(100)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::NoCapacity);
    }

    #[tokio::test]
    async fn test_rollback_releases_risk() {
        let ledger = test_ledger();
        let reservation = ledger
            .reserve_slot(&reserve_req("BTCUSDT", dec!(500)))
            .await
            .unwrap();
        assert_eq!(ledger.risk_state().unwrap().total_reserved_risk, dec!(500));

        ledger
            .rollback_reservation(&reservation.reservation_id)
            .await
            .unwrap();
        assert_eq!(ledger.risk_state().unwrap().total_reserved_risk, dec!(0));

        // Idempotent on a second call.
        ledger
            .rollback_reservation(&reservation.reservation_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        // Committing twice with the same reservation leaves one state.
        let ledger = test_ledger();
        let reservation = ledger
            .reserve_slot(&reserve_req("BTCUSDT", dec!(500)))
            .await
            .unwrap();

        for _ in 0..2 {
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
        }

        assert_eq!(ledger.list_open().unwrap().len(), 1);
        assert_eq!(ledger.risk_state().unwrap().total_reserved_risk, dec!(500));
    }

    #[tokio::test]
    async fn test_commit_unknown_reservation() {
        let ledger = test_ledger();
        let err = ledger
            .commit_position("missing", dec!(100), dec!(1), dec!(102), dec!(99), dec!(1))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::UnknownReservation);
    }

    // ===== Close handshake =====

    #[tokio::test]
    async fn test_begin_close_is_exclusive() {
        // Two workers race begin_close; exactly one wins.
        let ledger = test_ledger();
        open_position(&ledger, "BTCUSDT", dec!(500), dec!(100)).await;

        let first = ledger.begin_close("BTCUSDT", "TP_HIT").await;
        let second = ledger.begin_close("BTCUSDT", "TP_HIT").await;

        assert!(first.is_ok());
        assert_eq!(second.unwrap_err(), LedgerError::AlreadyClosing);
    }

    #[tokio::test]
    async fn test_begin_close_not_open() {
        let ledger = test_ledger();
        let err = ledger.begin_close("BTCUSDT", "TP_HIT").await.unwrap_err();
        assert_eq!(err, LedgerError::NotOpen);
    }

    #[tokio::test]
    async fn test_finalize_close_updates_daily_pnl() {
        // daily_pnl is the exact sum of realized closes.
        let ledger = test_ledger();
        open_position(&ledger, "AUSDT", dec!(500), dec!(100)).await;
        open_position(&ledger, "BUSDT", dec!(500), dec!(100)).await;

        let token = ledger.begin_close("AUSDT", "TP_HIT").await.unwrap();
        ledger.finalize_close(&token, dec!(110), dec!(10)).await.unwrap();

        let token = ledger.begin_close("BUSDT", "SL_HIT").await.unwrap();
        ledger.finalize_close(&token, dec!(96), dec!(-4)).await.unwrap();

        let state = ledger.risk_state().unwrap();
        assert_eq!(state.daily_pnl, dec!(6));
        assert_eq!(state.total_reserved_risk, dec!(0));
        assert!(ledger.list_open().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_close_is_idempotent() {
        let ledger = test_ledger();
        open_position(&ledger, "AUSDT", dec!(500), dec!(100)).await;

        let token = ledger.begin_close("AUSDT", "TP_HIT").await.unwrap();
        ledger.finalize_close(&token, dec!(110), dec!(10)).await.unwrap();
        ledger.finalize_close(&token, dec!(110), dec!(10)).await.unwrap();

        assert_eq!(ledger.risk_state().unwrap().daily_pnl, dec!(10));
    }

    // ===== Circuit breaker =====

    #[tokio::test]
    async fn test_circuit_breaker_engages_and_rolls_over() {
        // A -550 day on 10k capital blocks reservations until the
        // next UTC day.
        let ledger = test_ledger();
        open_position(&ledger, "AUSDT", dec!(500), dec!(100)).await;

        let token = ledger.begin_close("AUSDT", "SL_HIT").await.unwrap();
        ledger.finalize_close(&token, dec!(45), dec!(-550)).await.unwrap();

        let err = ledger
            .reserve_slot(&reserve_req("BUSDT", dec!(100)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::CircuitBreaker);

        // Same-day rollover is a no-op; the breaker stays engaged.
        assert!(!ledger.daily_rollover(Utc::now()).await.unwrap());
        assert_eq!(
            ledger
                .reserve_slot(&reserve_req("BUSDT", dec!(100)))
                .await
                .unwrap_err(),
            LedgerError::CircuitBreaker
        );

        // Next UTC day clears it.
        let tomorrow = Utc::now() + chrono::Duration::days(1);
        assert!(ledger.daily_rollover(tomorrow).await.unwrap());
        ledger.reserve_slot(&reserve_req("BUSDT", dec!(100))).await.unwrap();
    }

    #[tokio::test]
    async fn test_breach_exactly_at_limit() {
        let ledger = test_ledger();
        open_position(&ledger, "AUSDT", dec!(500), dec!(100)).await;

        // Loss of exactly capital * limit trips the breaker (<=).
        let token = ledger.begin_close("AUSDT", "SL_HIT").await.unwrap();
        ledger.finalize_close(&token, dec!(50), dec!(-500)).await.unwrap();

        assert_eq!(
            ledger
                .reserve_slot(&reserve_req("BUSDT", dec!(100)))
                .await
                .unwrap_err(),
            LedgerError::CircuitBreaker
        );
    }

    // ===== PnL helpers =====

    #[tokio::test]
    async fn test_position_pnl_math() {
        let ledger = test_ledger();
        open_position(&ledger, "AUSDT", dec!(500), dec!(100)).await;
        let position = &ledger.list_open().unwrap()[0];

        assert_eq!(position.unrealized_pnl_pct(dec!(101)), Some(dec!(1)));
        assert_eq!(position.realized_pnl_at(dec!(103)), Some(dec!(3)));
    }

    impl Ledger {
        fn live_count(&self) -> usize {
            self.store.live_positions().unwrap().len()
        }
    }
}
