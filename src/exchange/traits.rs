//! Venue-agnostic trait for perpetual futures exchanges.
//!
//! Implemented by the REST client for live trading and by the paper client
//! when `live_mode` is off. The control plane only ever sees this interface.

use super::error::ExchangeError;
use super::types::{
    Candle, Interval, MarketOrderRequest, OrderBook, OrderFill, OrderSide, Ticker24h,
    VenuePosition,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Typed operations against a perpetual futures venue.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Human-readable client name for logging.
    fn name(&self) -> &str;

    /// Fetch 24h tickers for every listed contract in one call.
    async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>, ExchangeError>;

    /// Fetch up to `limit` most recent candles, oldest first.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Fetch the order book up to `depth` levels per side.
    async fn fetch_order_book(&self, symbol: &str, depth: u32)
        -> Result<OrderBook, ExchangeError>;

    /// Place a market entry order with the given leverage.
    async fn place_market_order(
        &self,
        order: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError>;

    /// Close (reduce-only) a position with a market order.
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, ExchangeError>;

    /// List positions currently open on the venue.
    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError>;
}
