//! Scriptable in-memory exchange used by unit and integration tests.

use super::error::ExchangeError;
use super::traits::ExchangeApi;
use super::types::*;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory exchange whose market data and failure modes are scripted by
/// the test. Orders fill at the scripted ticker price.
#[derive(Default)]
pub struct StubExchange {
    tickers: Mutex<HashMap<String, Ticker24h>>,
    candles: Mutex<HashMap<(String, Interval), Vec<Candle>>>,
    books: Mutex<HashMap<String, OrderBook>>,
    positions: Mutex<HashMap<String, VenuePosition>>,
    placed_orders: Mutex<Vec<MarketOrderRequest>>,
    closed_orders: Mutex<Vec<(String, OrderSide, Decimal)>>,
    order_id_counter: AtomicI64,
    /// Number of upcoming order placements that should fail.
    fail_orders: AtomicU32,
    /// Number of upcoming close calls that should fail.
    fail_closes: AtomicU32,
    /// Number of upcoming ticker fetches that should fail transiently.
    fail_tickers: AtomicU32,
}

impl StubExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ticker(self, symbol: &str, last_price: Decimal, quote_volume: Decimal) -> Self {
        self.set_ticker(symbol, last_price, quote_volume);
        self
    }

    pub fn with_candles(self, symbol: &str, interval: Interval, candles: Vec<Candle>) -> Self {
        self.candles
            .lock()
            .unwrap()
            .insert((symbol.to_string(), interval), candles);
        self
    }

    pub fn with_book(self, symbol: &str, book: OrderBook) -> Self {
        self.books.lock().unwrap().insert(symbol.to_string(), book);
        self
    }

    pub fn set_ticker(&self, symbol: &str, last_price: Decimal, quote_volume: Decimal) {
        self.tickers.lock().unwrap().insert(
            symbol.to_string(),
            Ticker24h {
                symbol: symbol.to_string(),
                last_price,
                quote_volume,
                close_time: Utc::now().timestamp_millis(),
            },
        );
    }

    pub fn set_candles(&self, symbol: &str, interval: Interval, candles: Vec<Candle>) {
        self.candles
            .lock()
            .unwrap()
            .insert((symbol.to_string(), interval), candles);
    }

    pub fn set_position(&self, position: VenuePosition) {
        self.positions
            .lock()
            .unwrap()
            .insert(position.symbol.clone(), position);
    }

    pub fn remove_position(&self, symbol: &str) {
        self.positions.lock().unwrap().remove(symbol);
    }

    pub fn fail_next_orders(&self, count: u32) {
        self.fail_orders.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_closes(&self, count: u32) {
        self.fail_closes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_ticker_fetches(&self, count: u32) {
        self.fail_tickers.store(count, Ordering::SeqCst);
    }

    pub fn placed_orders(&self) -> Vec<MarketOrderRequest> {
        self.placed_orders.lock().unwrap().clone()
    }

    pub fn closed_orders(&self) -> Vec<(String, OrderSide, Decimal)> {
        self.closed_orders.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Build a flat candle series for tests: constant close with a fixed
/// high-low range, one candle per minute ending now.
pub fn flat_candles(count: usize, close: Decimal, range: Decimal) -> Vec<Candle> {
    let half = range / Decimal::TWO;
    let start = Utc
        .timestamp_opt(Utc::now().timestamp() / 60 * 60, 0)
        .single()
        .unwrap()
        - ChronoDuration::minutes(count as i64);
    (0..count)
        .map(|i| Candle {
            open_time: start + ChronoDuration::minutes(i as i64),
            open: close,
            high: close + half,
            low: close - half,
            close,
            volume: Decimal::ONE_HUNDRED,
        })
        .collect()
}

#[async_trait]
impl ExchangeApi for StubExchange {
    fn name(&self) -> &str {
        "stub"
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>, ExchangeError> {
        if Self::take_failure(&self.fail_tickers) {
            return Err(ExchangeError::Transient("scripted failure".into()));
        }
        Ok(self.tickers.lock().unwrap().values().cloned().collect())
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self.candles.lock().unwrap();
        let series = candles
            .get(&(symbol.to_string(), interval))
            .cloned()
            .unwrap_or_default();
        let skip = series.len().saturating_sub(limit as usize);
        Ok(series[skip..].to_vec())
    }

    async fn fetch_order_book(
        &self,
        symbol: &str,
        _depth: u32,
    ) -> Result<OrderBook, ExchangeError> {
        Ok(self
            .books
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn place_market_order(
        &self,
        order: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        if Self::take_failure(&self.fail_orders) {
            return Err(ExchangeError::Transient("scripted order failure".into()));
        }

        let price = self
            .tickers
            .lock()
            .unwrap()
            .get(&order.symbol)
            .map(|t| t.last_price)
            .ok_or_else(|| ExchangeError::InvalidSymbol(order.symbol.clone()))?;

        self.placed_orders.lock().unwrap().push(order.clone());
        self.positions.lock().unwrap().insert(
            order.symbol.clone(),
            VenuePosition {
                symbol: order.symbol.clone(),
                direction: match order.side {
                    OrderSide::Buy => Direction::Long,
                    OrderSide::Sell => Direction::Short,
                },
                quantity: order.quantity,
                entry_price: price,
            },
        );

        Ok(OrderFill {
            order_id: self.order_id_counter.fetch_add(1, Ordering::SeqCst),
            status: OrderStatus::Filled,
            executed_qty: order.quantity,
            avg_price: price,
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        if Self::take_failure(&self.fail_closes) {
            return Err(ExchangeError::Transient("scripted close failure".into()));
        }

        let price = self
            .tickers
            .lock()
            .unwrap()
            .get(symbol)
            .map(|t| t.last_price)
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;

        self.closed_orders
            .lock()
            .unwrap()
            .push((symbol.to_string(), side, quantity));
        self.positions.lock().unwrap().remove(symbol);

        Ok(OrderFill {
            order_id: self.order_id_counter.fetch_add(1, Ordering::SeqCst),
            status: OrderStatus::Filled,
            executed_qty: quantity,
            avg_price: price,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        Ok(self.positions.lock().unwrap().values().cloned().collect())
    }
}
