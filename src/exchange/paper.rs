//! Paper trading client used when `live_mode` is off.
//!
//! Market data is delegated to the wrapped client; order placement is
//! simulated against the last seen ticker price and acknowledged locally, so
//! the whole control plane runs unmodified without touching the venue.

use super::error::ExchangeError;
use super::traits::ExchangeApi;
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Simulated venue-side position.
#[derive(Debug, Clone)]
struct PaperPosition {
    direction: Direction,
    quantity: Decimal,
    entry_price: Decimal,
}

/// Exchange client that acknowledges orders without reaching the venue.
pub struct PaperExchange {
    inner: Arc<dyn ExchangeApi>,
    order_id_counter: AtomicI64,
    /// Last traded price per symbol, refreshed on every ticker fetch.
    marks: RwLock<HashMap<String, Decimal>>,
    positions: RwLock<HashMap<String, PaperPosition>>,
}

impl PaperExchange {
    /// Wrap a real client for market data, simulating all order flow.
    pub fn new(inner: Arc<dyn ExchangeApi>) -> Self {
        Self {
            inner,
            order_id_counter: AtomicI64::new(1),
            marks: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
        }
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if let Some(price) = self.marks.read().await.get(symbol) {
            return Ok(*price);
        }
        // No ticker seen yet for this symbol: fall back to its latest candle.
        let candles = self
            .inner
            .fetch_candles(symbol, Interval::OneMinute, 1)
            .await?;
        candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| ExchangeError::Transient(format!("no mark price for {symbol}")))
    }

    fn next_order_id(&self) -> i64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>, ExchangeError> {
        let tickers = self.inner.fetch_tickers().await?;
        let mut marks = self.marks.write().await;
        for t in &tickers {
            marks.insert(t.symbol.clone(), t.last_price);
        }
        Ok(tickers)
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.inner.fetch_candles(symbol, interval, limit).await
    }

    async fn fetch_order_book(
        &self,
        symbol: &str,
        depth: u32,
    ) -> Result<OrderBook, ExchangeError> {
        self.inner.fetch_order_book(symbol, depth).await
    }

    async fn place_market_order(
        &self,
        order: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        let price = self.mark_price(&order.symbol).await?;
        let direction = match order.side {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        };

        self.positions.write().await.insert(
            order.symbol.clone(),
            PaperPosition {
                direction,
                quantity: order.quantity,
                entry_price: price,
            },
        );

        let order_id = self.next_order_id();
        info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            quantity = %order.quantity,
            fill_price = %price,
            leverage = order.leverage,
            "Paper order acknowledged"
        );

        Ok(OrderFill {
            order_id,
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
        let price = self.mark_price(symbol).await?;
        self.positions.write().await.remove(symbol);

        let order_id = self.next_order_id();
        info!(
            %symbol,
            side = side.as_str(),
            %quantity,
            fill_price = %price,
            "Paper close acknowledged"
        );

        Ok(OrderFill {
            order_id,
            status: OrderStatus::Filled,
            executed_qty: quantity,
            avg_price: price,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        let positions = self.positions.read().await;
        Ok(positions
            .iter()
            .map(|(symbol, p)| VenuePosition {
                symbol: symbol.clone(),
                direction: p.direction,
                quantity: p.quantity,
                entry_price: p.entry_price,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::StubExchange;
    use rust_decimal_macros::dec;

    fn paper_with_price(symbol: &str, price: Decimal) -> PaperExchange {
        let stub = StubExchange::new().with_ticker(symbol, price, dec!(10_000_000));
        PaperExchange::new(Arc::new(stub))
    }

    #[tokio::test]
    async fn test_order_fills_at_last_ticker_price() {
        let paper = paper_with_price("BTCUSDT", dec!(50000));
        // Prime the mark cache the way the gateway would.
        paper.fetch_tickers().await.unwrap();

        let fill = paper
            .place_market_order(&MarketOrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                quantity: dec!(0.5),
                leverage: 3,
            })
            .await
            .unwrap();

        assert_eq!(fill.status, OrderStatus::Filled);
        assert_eq!(fill.avg_price, dec!(50000));
        assert_eq!(fill.executed_qty, dec!(0.5));
    }

    #[tokio::test]
    async fn test_positions_tracked_until_closed() {
        let paper = paper_with_price("ETHUSDT", dec!(3000));
        paper.fetch_tickers().await.unwrap();

        paper
            .place_market_order(&MarketOrderRequest {
                symbol: "ETHUSDT".to_string(),
                side: OrderSide::Sell,
                quantity: dec!(2),
                leverage: 2,
            })
            .await
            .unwrap();

        let open = paper.fetch_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].direction, Direction::Short);

        paper
            .close_position("ETHUSDT", OrderSide::Buy, dec!(2))
            .await
            .unwrap();
        assert!(paper.fetch_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_order_ids_are_monotonic() {
        let paper = paper_with_price("BTCUSDT", dec!(50000));
        paper.fetch_tickers().await.unwrap();

        let req = MarketOrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(1),
            leverage: 2,
        };
        let first = paper.place_market_order(&req).await.unwrap();
        let second = paper.place_market_order(&req).await.unwrap();
        assert!(second.order_id > first.order_id);
    }
}
