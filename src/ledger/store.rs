//! SQLite-backed ledger storage.
//!
//! Every mutation of the risk accumulator is a version-guarded `UPDATE`;
//! a failed guard surfaces as `Contended` and the ledger retries with fresh
//! state. Position lifecycle transitions are status-conditional updates, so
//! concurrent workers on separate hosts sharing the database cannot
//! double-apply them. A partial unique index over live rows backstops the
//! one-position-per-symbol invariant.

use super::{LedgerError, Position, PositionStatus, ReserveRequest, RiskLimits, RiskState};
use crate::exchange::Direction;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const POSITION_COLUMNS: &str = "reservation_id, symbol, direction, status, margin_committed, \
     leverage, score_at_entry, entry_price, quantity, tp_price, sl_price, atr_at_entry, \
     opened_at, close_token, exit_price, exit_reason, closed_at, realized_pnl, \
     closer_failures, stuck, updated_at";

/// Ledger storage with conditional-write semantics.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the ledger database at the given path.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, LedgerError> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| LedgerError::Store(format!("open {:?}: {e}", db_path.as_ref())))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Ledger store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Store(format!("open in-memory: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        conn.execute_batch(
            r#"
            -- Risk accumulator (singleton row, version-guarded)
            CREATE TABLE IF NOT EXISTS risk_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                day TEXT NOT NULL,
                daily_pnl TEXT NOT NULL,
                total_reserved_risk TEXT NOT NULL,
                breached_at TEXT,
                updated_at TEXT NOT NULL
            );

            -- Positions across their whole lifecycle
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reservation_id TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                margin_committed TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                score_at_entry INTEGER NOT NULL,
                entry_price TEXT,
                quantity TEXT,
                tp_price TEXT,
                sl_price TEXT,
                atr_at_entry TEXT,
                opened_at TEXT,
                close_token TEXT,
                exit_price TEXT,
                exit_reason TEXT,
                closed_at TEXT,
                realized_pnl TEXT,
                closer_failures INTEGER NOT NULL DEFAULT 0,
                stuck INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_live
                ON positions(symbol) WHERE status IN ('RESERVED','OPEN','CLOSING');
            CREATE INDEX IF NOT EXISTS idx_positions_status
                ON positions(status, updated_at);

            -- Append-only trade history
            CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                event TEXT NOT NULL,
                direction TEXT,
                price TEXT,
                quantity TEXT,
                leverage INTEGER,
                pnl TEXT,
                reason TEXT,
                context TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON trade_history(timestamp);

            -- Append-only skipped-trades log
            CREATE TABLE IF NOT EXISTS skipped_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                reason TEXT NOT NULL
            );
            "#,
        )?;

        conn.execute(
            r#"
            INSERT INTO risk_state (id, version, day, daily_pnl, total_reserved_risk, breached_at, updated_at)
            VALUES (1, 0, ?1, '0', '0', NULL, ?2)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![Utc::now().date_naive().to_string(), Utc::now().to_rfc3339()],
        )?;

        debug!("Ledger schema initialized");
        Ok(())
    }

    // ===== Risk accumulator =====

    pub fn risk_state(&self) -> Result<RiskState, LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        Self::read_risk_state(&conn)
    }

    fn read_risk_state(conn: &Connection) -> Result<RiskState, LedgerError> {
        let state = conn.query_row(
            "SELECT version, day, daily_pnl, total_reserved_risk, breached_at, updated_at
             FROM risk_state WHERE id = 1",
            [],
            |row| {
                Ok(RiskState {
                    version: row.get(0)?,
                    day: NaiveDate::from_str(&row.get::<_, String>(1)?)
                        .unwrap_or_else(|_| Utc::now().date_naive()),
                    daily_pnl: parse_decimal(&row.get::<_, String>(2)?),
                    total_reserved_risk: parse_decimal(&row.get::<_, String>(3)?),
                    breached_at: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|s| parse_timestamp(&s)),
                    updated_at: parse_timestamp(&row.get::<_, String>(5)?)
                        .unwrap_or_else(Utc::now),
                })
            },
        )?;
        Ok(state)
    }

    /// Atomically verify the risk invariants and insert a RESERVED row.
    pub fn try_reserve(
        &self,
        req: &ReserveRequest,
        reservation_id: &str,
        limits: &RiskLimits,
    ) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().expect("ledger store mutex poisoned");
        let tx = conn.transaction()?;

        let state = Self::read_risk_state(&tx)?;

        if state.daily_pnl <= -limits.capital * limits.daily_loss_limit {
            return Err(LedgerError::CircuitBreaker);
        }

        let live_count: u32 = tx.query_row(
            "SELECT COUNT(*) FROM positions WHERE status IN ('RESERVED','OPEN','CLOSING')",
            [],
            |row| row.get(0),
        )?;
        if live_count >= limits.max_open_trades {
            return Err(LedgerError::NoCapacity);
        }

        if state.total_reserved_risk + req.margin > limits.capital * limits.max_portfolio_risk {
            return Err(LedgerError::NoCapacity);
        }

        let duplicate: Option<String> = tx
            .query_row(
                "SELECT reservation_id FROM positions
                 WHERE symbol = ?1 AND status IN ('RESERVED','OPEN','CLOSING')",
                params![req.symbol],
                |row| row.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Err(LedgerError::DuplicateSymbol);
        }

        let now = Utc::now().to_rfc3339();
        let inserted = tx.execute(
            "INSERT INTO positions (reservation_id, symbol, direction, status, margin_committed,
                                    leverage, score_at_entry, updated_at)
             VALUES (?1, ?2, ?3, 'RESERVED', ?4, ?5, ?6, ?7)",
            params![
                reservation_id,
                req.symbol,
                req.direction.as_str(),
                req.margin.to_string(),
                req.leverage,
                req.score,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(LedgerError::DuplicateSymbol);
            }
            Err(e) => return Err(e.into()),
        }

        let new_total = state.total_reserved_risk + req.margin;
        let changed = tx.execute(
            "UPDATE risk_state
             SET total_reserved_risk = ?1, version = version + 1, updated_at = ?2
             WHERE id = 1 AND version = ?3",
            params![new_total.to_string(), now, state.version],
        )?;
        if changed == 0 {
            return Err(LedgerError::Contended);
        }

        tx.commit()?;
        debug!(
            symbol = %req.symbol,
            margin = %req.margin,
            total_reserved = %new_total,
            "Risk slot reserved"
        );
        Ok(())
    }

    /// RESERVED -> OPEN with entry details. Idempotent per reservation id.
    pub fn commit_position(
        &self,
        reservation_id: &str,
        entry_price: Decimal,
        quantity: Decimal,
        tp_price: Decimal,
        sl_price: Decimal,
        atr: Decimal,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        let now = Utc::now().to_rfc3339();

        let changed = conn.execute(
            "UPDATE positions
             SET status = 'OPEN', entry_price = ?2, quantity = ?3, tp_price = ?4,
                 sl_price = ?5, atr_at_entry = ?6, opened_at = ?7, updated_at = ?7
             WHERE reservation_id = ?1 AND status = 'RESERVED'",
            params![
                reservation_id,
                entry_price.to_string(),
                quantity.to_string(),
                tp_price.to_string(),
                sl_price.to_string(),
                atr.to_string(),
                now,
            ],
        )?;
        if changed > 0 {
            return Ok(());
        }

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM positions WHERE reservation_id = ?1",
                params![reservation_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => Err(LedgerError::UnknownReservation),
            Some("OPEN") => Ok(()),
            Some(_) => Err(LedgerError::AlreadyCommitted),
        }
    }

    /// Remove a RESERVED row and release its risk. Idempotent.
    pub fn rollback_reservation(&self, reservation_id: &str) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().expect("ledger store mutex poisoned");
        let tx = conn.transaction()?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT status, margin_committed FROM positions WHERE reservation_id = ?1",
                params![reservation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((status, margin)) = row else {
            return Ok(());
        };
        if status != "RESERVED" {
            return Err(LedgerError::AlreadyCommitted);
        }

        let state = Self::read_risk_state(&tx)?;
        let margin = parse_decimal(&margin);
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "DELETE FROM positions WHERE reservation_id = ?1 AND status = 'RESERVED'",
            params![reservation_id],
        )?;
        let changed = tx.execute(
            "UPDATE risk_state
             SET total_reserved_risk = ?1, version = version + 1, updated_at = ?2
             WHERE id = 1 AND version = ?3",
            params![
                (state.total_reserved_risk - margin).max(Decimal::ZERO).to_string(),
                now,
                state.version,
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::Contended);
        }

        tx.commit()?;
        debug!(%reservation_id, %margin, "Reservation rolled back");
        Ok(())
    }

    /// OPEN -> CLOSING, stamping the close token and exit reason.
    pub fn begin_close(
        &self,
        symbol: &str,
        exit_reason: &str,
        close_token: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        let now = Utc::now().to_rfc3339();

        let changed = conn.execute(
            "UPDATE positions
             SET status = 'CLOSING', close_token = ?3, exit_reason = ?2, updated_at = ?4
             WHERE symbol = ?1 AND status = 'OPEN'",
            params![symbol, exit_reason, close_token, now],
        )?;
        if changed > 0 {
            return Ok(());
        }

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM positions
                 WHERE symbol = ?1 AND status IN ('RESERVED','OPEN','CLOSING')",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            Some("CLOSING") => Err(LedgerError::AlreadyClosing),
            _ => Err(LedgerError::NotOpen),
        }
    }

    /// CLOSING -> CLOSED; releases risk and folds the realized PnL into the
    /// daily accumulator, tripping the breach marker when the loss limit is
    /// crossed.
    pub fn finalize_close(
        &self,
        close_token: &str,
        exit_price: Decimal,
        realized_pnl: Decimal,
        limits: &RiskLimits,
    ) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().expect("ledger store mutex poisoned");
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT status, margin_committed FROM positions WHERE close_token = ?1",
                params![close_token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((status, margin)) = row else {
            return Err(LedgerError::UnknownCloseToken);
        };
        if status == "CLOSED" {
            return Ok(());
        }
        if status != "CLOSING" {
            return Err(LedgerError::NotOpen);
        }

        tx.execute(
            "UPDATE positions
             SET status = 'CLOSED', exit_price = ?2, realized_pnl = ?3,
                 closed_at = ?4, updated_at = ?4
             WHERE close_token = ?1 AND status = 'CLOSING'",
            params![
                close_token,
                exit_price.to_string(),
                realized_pnl.to_string(),
                now,
            ],
        )?;

        let state = Self::read_risk_state(&tx)?;
        let margin = parse_decimal(&margin);
        let new_pnl = state.daily_pnl + realized_pnl;
        let breached = new_pnl <= -limits.capital * limits.daily_loss_limit;
        let breached_at = match (state.breached_at, breached) {
            (Some(at), _) => Some(at.to_rfc3339()),
            (None, true) => {
                warn!(daily_pnl = %new_pnl, "Daily loss limit breached; circuit breaker engaged");
                Some(now.clone())
            }
            (None, false) => None,
        };

        let changed = tx.execute(
            "UPDATE risk_state
             SET total_reserved_risk = ?1, daily_pnl = ?2, breached_at = ?3,
                 version = version + 1, updated_at = ?4
             WHERE id = 1 AND version = ?5",
            params![
                (state.total_reserved_risk - margin).max(Decimal::ZERO).to_string(),
                new_pnl.to_string(),
                breached_at,
                now,
                state.version,
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::Contended);
        }

        tx.commit()?;
        Ok(())
    }

    /// Reset the daily accumulator when the UTC date has advanced.
    pub fn daily_rollover(&self, now: DateTime<Utc>) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        let today = now.date_naive().to_string();
        let changed = conn.execute(
            "UPDATE risk_state
             SET day = ?1, daily_pnl = '0', breached_at = NULL,
                 version = version + 1, updated_at = ?2
             WHERE id = 1 AND day <> ?1",
            params![today, now.to_rfc3339()],
        )?;
        if changed > 0 {
            info!(%today, "Daily risk accumulator rolled over");
        }
        Ok(changed > 0)
    }

    // ===== Position queries =====

    pub fn positions_with_status(&self, status: PositionStatus) -> Result<Vec<Position>, LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE status = ?1 ORDER BY updated_at"
        ))?;
        let positions = stmt
            .query_map(params![status.as_str()], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    /// All rows that hold a live claim on a symbol.
    pub fn live_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE status IN ('RESERVED','OPEN','CLOSING') ORDER BY updated_at"
        ))?;
        let positions = stmt
            .query_map([], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    pub fn position_by_symbol(&self, symbol: &str) -> Result<Option<Position>, LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        let position = conn
            .query_row(
                &format!(
                    "SELECT {POSITION_COLUMNS} FROM positions
                     WHERE symbol = ?1 AND status IN ('RESERVED','OPEN','CLOSING')"
                ),
                params![symbol],
                row_to_position,
            )
            .optional()?;
        Ok(position)
    }

    /// Bump the consecutive close-failure counter, returning the new count.
    pub fn record_close_failure(&self, symbol: &str) -> Result<u32, LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        conn.execute(
            "UPDATE positions SET closer_failures = closer_failures + 1, updated_at = ?2
             WHERE symbol = ?1 AND status = 'CLOSING'",
            params![symbol, Utc::now().to_rfc3339()],
        )?;
        let count: u32 = conn
            .query_row(
                "SELECT closer_failures FROM positions
                 WHERE symbol = ?1 AND status = 'CLOSING'",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }

    pub fn mark_stuck(&self, symbol: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        conn.execute(
            "UPDATE positions SET stuck = 1, updated_at = ?2
             WHERE symbol = ?1 AND status = 'CLOSING'",
            params![symbol, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ===== Append-only logs =====

    pub fn record_skip(&self, symbol: &str, reason: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        conn.execute(
            "INSERT INTO skipped_trades (timestamp, symbol, reason) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), symbol, reason],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_trade_open(
        &self,
        symbol: &str,
        direction: Direction,
        price: Decimal,
        quantity: Decimal,
        leverage: u32,
        context: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        conn.execute(
            "INSERT INTO trade_history (timestamp, symbol, event, direction, price, quantity, leverage, context)
             VALUES (?1, ?2, 'OPEN', ?3, ?4, ?5, ?6, ?7)",
            params![
                Utc::now().to_rfc3339(),
                symbol,
                direction.as_str(),
                price.to_string(),
                quantity.to_string(),
                leverage,
                context,
            ],
        )?;
        Ok(())
    }

    pub fn record_trade_close(
        &self,
        symbol: &str,
        price: Decimal,
        pnl: Decimal,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        conn.execute(
            "INSERT INTO trade_history (timestamp, symbol, event, price, pnl, reason)
             VALUES (?1, ?2, 'CLOSE', ?3, ?4, ?5)",
            params![
                Utc::now().to_rfc3339(),
                symbol,
                price.to_string(),
                pnl.to_string(),
                reason,
            ],
        )?;
        Ok(())
    }

    /// Skip reasons recorded for a symbol, most recent last.
    pub fn skips_for(&self, symbol: &str) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn.lock().expect("ledger store mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT reason FROM skipped_trades WHERE symbol = ?1 ORDER BY id")?;
        let reasons = stmt
            .query_map(params![symbol], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(reasons)
    }
}

fn parse_decimal(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or_default()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn parse_opt_decimal(value: Option<String>) -> Option<Decimal> {
    value.map(|s| parse_decimal(&s))
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    let direction: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Position {
        reservation_id: row.get(0)?,
        symbol: row.get(1)?,
        direction: direction.parse().unwrap_or(Direction::Long),
        status: PositionStatus::from_str_or_closed(&status),
        margin_committed: parse_decimal(&row.get::<_, String>(4)?),
        leverage: row.get(5)?,
        score_at_entry: row.get(6)?,
        entry_price: parse_opt_decimal(row.get(7)?),
        quantity: parse_opt_decimal(row.get(8)?),
        tp_price: parse_opt_decimal(row.get(9)?),
        sl_price: parse_opt_decimal(row.get(10)?),
        atr_at_entry: parse_opt_decimal(row.get(11)?),
        opened_at: row.get::<_, Option<String>>(12)?.and_then(|s| parse_timestamp(&s)),
        close_token: row.get(13)?,
        exit_price: parse_opt_decimal(row.get(14)?),
        exit_reason: row.get(15)?,
        closed_at: row.get::<_, Option<String>>(16)?.and_then(|s| parse_timestamp(&s)),
        realized_pnl: parse_opt_decimal(row.get(17)?),
        closer_failures: row.get(18)?,
        stuck: row.get::<_, i64>(19)? != 0,
        updated_at: parse_timestamp(&row.get::<_, String>(20)?).unwrap_or_else(Utc::now),
    })
}
