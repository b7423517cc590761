//! Momentum scanner.
//!
//! One pass per scheduler minute, in four phases: universe filter on the
//! ticker snapshot, a cheap mobility pre-filter on 25 one-minute candles,
//! deep momentum analysis on 60 candles for the survivors, and candidate
//! emission bounded by the free slot budget. Phases one and two are
//! self-bounded: on deadline overrun the tick emits nothing rather than
//! acting on partial data.

mod indicators;
mod sessions;

pub use indicators::{atr, ema, mean};
pub use sessions::{base_asset, SessionTable};

use crate::config::{ExecutionConfig, ScannerConfig, SessionConfig};
use crate::exchange::{Candle, Direction, Interval};
use crate::market_data::{GatewayError, MarketDataGateway};
use crate::utils::decimal::safe_div;
use chrono::{DateTime, Timelike, Utc};
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Candles fetched for the mobility pre-filter.
const PREFILTER_CANDLES: usize = 25;
/// Candles fetched for deep analysis.
const ANALYSIS_CANDLES: usize = 60;
/// Concurrent candle fetches per phase.
const FETCH_CONCURRENCY: usize = 10;

/// Signals below this ATR percent are too flat to trade.
const ATR_SKIP_PCT: Decimal = dec!(0.10);
/// ATR percent above which the volatility bonus applies.
const ATR_BONUS_PCT: Decimal = dec!(0.15);

/// Night-pump gates: 5-minute move, volume surge, and dominance of the
/// 5-minute move over the 15-minute move.
const PUMP_MOVE_PCT: Decimal = dec!(0.5);
const PUMP_VOLUME_RATIO: Decimal = dec!(3.0);
const PUMP_BOOST: Decimal = dec!(1.5);

/// A scored trading opportunity, consumed within the same tick.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub symbol: String,
    pub direction: Direction,
    pub score: u32,
    pub price: Decimal,
    pub atr: Decimal,
    pub suggested_tp: Decimal,
    pub suggested_sl: Decimal,
    pub volume_24h: Decimal,
    pub volume_ratio: Decimal,
    pub crossover: bool,
    pub night_pump: bool,
    pub session_factor: Decimal,
    pub mobility_rank: Decimal,
    pub snapshot_time: DateTime<Utc>,
}

/// Mobility metrics from the pre-filter phase.
#[derive(Debug, Clone)]
pub struct Mobility {
    pub atr_pct: Decimal,
    pub vol_ratio: Decimal,
    pub thrust: Decimal,
    pub rank: Decimal,
}

/// Outcome of deep analysis for one symbol.
#[derive(Debug, Clone)]
pub struct ScoredSignal {
    pub direction: Direction,
    pub score: u32,
    pub price: Decimal,
    pub atr: Decimal,
    pub atr_pct: Decimal,
    pub volume_ratio: Decimal,
    pub crossover: bool,
    pub night_pump: bool,
    pub session_factor: Decimal,
}

#[derive(Debug, Default)]
struct ScanCounters {
    universe: u32,
    below_volume: u32,
    quote_filtered: u32,
    denied: u32,
    unavailable: u32,
    not_mobile: u32,
    prefiltered: u32,
    no_signal: u32,
    below_score: u32,
    emitted: u32,
}

struct PrefilterHit {
    symbol: String,
    volume_24h: Decimal,
    mobility: Mobility,
}

pub struct MomentumScanner {
    gateway: Arc<MarketDataGateway>,
    config: ScannerConfig,
    execution: ExecutionConfig,
    sessions: SessionTable,
}

impl MomentumScanner {
    pub fn new(
        gateway: Arc<MarketDataGateway>,
        config: ScannerConfig,
        execution: ExecutionConfig,
        sessions: &SessionConfig,
    ) -> Self {
        Self {
            gateway,
            config,
            execution,
            sessions: SessionTable::from_config(sessions),
        }
    }

    /// Run one scan and return at most `available_slots` candidates, best
    /// first.
    pub async fn scan(
        &self,
        now: DateTime<Utc>,
        available_slots: usize,
    ) -> Result<Vec<Candidate>, GatewayError> {
        if available_slots == 0 {
            debug!("No free slots; scan skipped");
            return Ok(Vec::new());
        }

        let mut counters = ScanCounters::default();
        let deadline = Duration::from_secs(self.config.prefilter_deadline_secs);

        let prefilter = tokio::time::timeout(deadline, self.prefilter(&mut counters)).await;
        let hits = match prefilter {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    deadline_secs = deadline.as_secs(),
                    "Universe and mobility phases overran; emitting no candidates"
                );
                return Ok(Vec::new());
            }
        };

        let signals = self.analyze(hits, now, &mut counters).await;
        let candidates = self.emit(signals, available_slots, now, &mut counters);

        info!(
            universe = counters.universe,
            below_volume = counters.below_volume,
            quote_filtered = counters.quote_filtered,
            denied = counters.denied,
            unavailable = counters.unavailable,
            not_mobile = counters.not_mobile,
            prefiltered = counters.prefiltered,
            no_signal = counters.no_signal,
            below_score = counters.below_score,
            emitted = counters.emitted,
            "Scan complete"
        );
        Ok(candidates)
    }

    /// Phases 1 + 2: universe filter, then the mobility check on light
    /// candle windows. Returns the top K by mobility rank.
    async fn prefilter(
        &self,
        counters: &mut ScanCounters,
    ) -> Result<Vec<PrefilterHit>, GatewayError> {
        let tickers = self.gateway.tickers().await?;
        counters.universe = tickers.len() as u32;

        let mut universe: Vec<(String, Decimal)> = Vec::new();
        for ticker in tickers.values() {
            if !self.quote_allowed(&ticker.symbol) {
                counters.quote_filtered += 1;
            } else if self.config.deny_list.iter().any(|d| d == &ticker.symbol) {
                counters.denied += 1;
            } else if ticker.quote_volume_24h < self.config.min_volume_24h {
                counters.below_volume += 1;
            } else {
                universe.push((ticker.symbol.clone(), ticker.quote_volume_24h));
            }
        }

        let results: Vec<_> = stream::iter(universe.into_iter().map(|(symbol, volume_24h)| {
            let gateway = self.gateway.clone();
            async move {
                let candles = gateway
                    .candles(&symbol, Interval::OneMinute, PREFILTER_CANDLES)
                    .await;
                (symbol, volume_24h, candles)
            }
        }))
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect()
        .await;

        let mut hits = Vec::new();
        for (symbol, volume_24h, candles) in results {
            match candles {
                Ok(candles) => match self.mobility(&candles) {
                    Some(mobility) => hits.push(PrefilterHit {
                        symbol,
                        volume_24h,
                        mobility,
                    }),
                    None => counters.not_mobile += 1,
                },
                Err(e) => {
                    debug!(%symbol, error = %e, "Symbol unscanned this tick");
                    counters.unavailable += 1;
                }
            }
        }

        hits.sort_by(|a, b| b.mobility.rank.cmp(&a.mobility.rank));
        hits.truncate(self.config.prefilter_top_k);
        counters.prefiltered = hits.len() as u32;
        Ok(hits)
    }

    /// Cheap mobility gate over the last 25 one-minute candles.
    fn mobility(&self, candles: &[Candle]) -> Option<Mobility> {
        if candles.len() < PREFILTER_CANDLES {
            return None;
        }
        let n = candles.len();
        let last_close = candles[n - 1].close;

        let atr_pct = safe_div(atr(candles, 10)?, last_close) * Decimal::ONE_HUNDRED;
        if atr_pct < self.config.min_atr_pct_1min {
            return None;
        }

        let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();
        let vol_ratio = safe_div(mean(&volumes[n - 3..]), mean(&volumes[n - 23..n - 3]));
        if vol_ratio < self.config.min_volume_ratio {
            return None;
        }

        let base = candles[n - 6].close;
        let thrust = safe_div((last_close - base).abs(), base) * Decimal::ONE_HUNDRED;
        if thrust < self.config.min_thrust_pct {
            return None;
        }

        Some(Mobility {
            atr_pct,
            vol_ratio,
            thrust,
            rank: atr_pct * vol_ratio * thrust,
        })
    }

    /// Phase 3: deep analysis on 60 one-minute candles per survivor.
    async fn analyze(
        &self,
        hits: Vec<PrefilterHit>,
        now: DateTime<Utc>,
        counters: &mut ScanCounters,
    ) -> Vec<(PrefilterHit, ScoredSignal)> {
        let results: Vec<_> = stream::iter(hits.into_iter().map(|hit| {
            let gateway = self.gateway.clone();
            async move {
                let candles = gateway
                    .candles(&hit.symbol, Interval::OneMinute, ANALYSIS_CANDLES)
                    .await;
                (hit, candles)
            }
        }))
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect()
        .await;

        let mut signals = Vec::new();
        for (hit, candles) in results {
            match candles {
                Ok(candles) => {
                    match self.deep_score(&hit.symbol, &candles, now) {
                        Some(signal) => signals.push((hit, signal)),
                        None => counters.no_signal += 1,
                    }
                }
                Err(e) => {
                    debug!(symbol = %hit.symbol, error = %e, "Analysis fetch failed");
                    counters.unavailable += 1;
                }
            }
        }
        signals
    }

    /// Momentum scoring for one symbol. `None` means the symbol produced no
    /// tradable signal this tick.
    fn deep_score(
        &self,
        symbol: &str,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Option<ScoredSignal> {
        if candles.len() < 30 {
            return None;
        }
        let n = candles.len();
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();
        let price = closes[n - 1];

        let ema_fast = ema(&closes, 5);
        let ema_slow = ema(&closes, 13);
        let (f2, f1) = (ema_fast[ema_fast.len() - 2], ema_fast[ema_fast.len() - 1]);
        let (s2, s1) = (ema_slow[ema_slow.len() - 2], ema_slow[ema_slow.len() - 1]);

        let crossover = if f2 <= s2 && f1 > s1 {
            Some(Direction::Long)
        } else if f2 >= s2 && f1 < s1 {
            Some(Direction::Short)
        } else {
            None
        };

        let price_change_3 = safe_div(closes[n - 1] - closes[n - 4], closes[n - 4]);
        let volume_ratio = safe_div(mean(&volumes[n - 3..]), mean(&volumes[n - 20..n - 3]));

        let atr = atr(candles, 14)?;
        let atr_pct = safe_div(atr, price) * Decimal::ONE_HUNDRED;
        if atr_pct < ATR_SKIP_PCT {
            return None;
        }

        // Night-pump detection: most of the move concentrated in the last
        // five minutes, on a volume surge.
        let move_5 = safe_div(closes[n - 1] - closes[n - 6], closes[n - 6]) * Decimal::ONE_HUNDRED;
        let move_15 =
            safe_div(closes[n - 1] - closes[n - 16], closes[n - 16]) * Decimal::ONE_HUNDRED;
        let night_pump = move_5.abs() > PUMP_MOVE_PCT
            && volume_ratio > PUMP_VOLUME_RATIO
            && move_5.abs() > Decimal::TWO * move_15.abs();

        let direction = match crossover {
            Some(direction) => direction,
            None if night_pump => {
                if move_5 > Decimal::ZERO {
                    Direction::Long
                } else {
                    Direction::Short
                }
            }
            None => return None,
        };

        let mut score: i64 = 0;
        if crossover.is_some() {
            score += 40;
        }

        let change_matches = match direction {
            Direction::Long => price_change_3 > Decimal::ZERO,
            Direction::Short => price_change_3 < Decimal::ZERO,
        };
        if change_matches {
            score += 20;
        }

        if volume_ratio >= dec!(2.0) {
            score += 35;
        } else if volume_ratio >= dec!(1.5) {
            score += 25;
        } else if volume_ratio >= dec!(1.2) {
            score += 15;
        } else if volume_ratio < Decimal::ONE {
            score -= 20;
        }

        if atr_pct >= ATR_BONUS_PCT {
            score += 15;
        }

        let session_factor = self.sessions.multiplier(symbol, now.hour());
        let mut boosted = Decimal::from(score) * session_factor;
        if night_pump {
            boosted *= PUMP_BOOST;
        }

        let score = boosted
            .round()
            .to_i64()
            .unwrap_or(0)
            .clamp(0, 100) as u32;

        Some(ScoredSignal {
            direction,
            score,
            price,
            atr,
            atr_pct,
            volume_ratio,
            crossover: crossover.is_some(),
            night_pump,
            session_factor,
        })
    }

    /// Phase 4: threshold, price targets, ordering, slot budget.
    fn emit(
        &self,
        signals: Vec<(PrefilterHit, ScoredSignal)>,
        available_slots: usize,
        now: DateTime<Utc>,
        counters: &mut ScanCounters,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for (hit, signal) in signals {
            if signal.score < self.config.min_momentum_score {
                counters.below_score += 1;
                continue;
            }

            let tp_dist = self.execution.tp_mult * signal.atr;
            let sl_dist = self.execution.sl_mult * signal.atr;
            let (suggested_tp, suggested_sl) = match signal.direction {
                Direction::Long => (signal.price + tp_dist, signal.price - sl_dist),
                Direction::Short => (signal.price - tp_dist, signal.price + sl_dist),
            };

            candidates.push(Candidate {
                symbol: hit.symbol,
                direction: signal.direction,
                score: signal.score,
                price: signal.price,
                atr: signal.atr,
                suggested_tp,
                suggested_sl,
                volume_24h: hit.volume_24h,
                volume_ratio: signal.volume_ratio,
                crossover: signal.crossover,
                night_pump: signal.night_pump,
                session_factor: signal.session_factor,
                mobility_rank: hit.mobility.rank,
                snapshot_time: now,
            });
        }

        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.mobility_rank.cmp(&a.mobility_rank))
        });
        candidates.truncate(available_slots);
        counters.emitted = candidates.len() as u32;

        for candidate in &candidates {
            info!(
                symbol = %candidate.symbol,
                direction = candidate.direction.as_str(),
                score = candidate.score,
                price = %candidate.price,
                tp = %candidate.suggested_tp,
                sl = %candidate.suggested_sl,
                night_pump = candidate.night_pump,
                "Candidate emitted"
            );
        }
        candidates
    }

    fn quote_allowed(&self, symbol: &str) -> bool {
        self.config
            .quote_allowlist
            .iter()
            .any(|quote| symbol.ends_with(quote.as_str()))
    }
}
