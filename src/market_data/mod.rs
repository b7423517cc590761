//! Market data gateway with per-process caches.
//!
//! Amortizes venue round-trips across ticks: tickers are batch-fetched with
//! a 30 s freshness window, candle series are merged incrementally from
//! their cached head, order books are held for 5 s. All outbound requests
//! pass through a token bucket sized below the venue's request budget and
//! are retried with jittered backoff before a symbol is reported
//! unavailable for the tick.

use crate::config::GatewayConfig;
use crate::exchange::{Candle, ExchangeApi, ExchangeError, Interval, OrderBook, Ticker};
use futures_util::future::BoxFuture;
use governor::{Quota, RateLimiter};
use rand::Rng;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Backoff schedule for transient venue errors.
const RETRY_BACKOFF_MS: [u64; 3] = [200, 500, 1200];
/// Stale cache entries may be served for up to TTL times this factor when
/// the venue is unreachable; beyond that the symbol is unscanned.
const STALE_FACTOR: u32 = 3;
/// Candles fetched per request when advancing a cached series.
const INCREMENTAL_FETCH: u32 = 10;

/// Gateway-level failures. `Unavailable` means the caller must treat the
/// symbol as unscanned for this tick.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("market data unavailable for {0}")]
    Unavailable(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

struct TickerCache {
    fetched_at: Instant,
    map: HashMap<String, Ticker>,
}

struct CandleCache {
    candles: Vec<Candle>,
}

struct BookCache {
    fetched_at: Instant,
    book: OrderBook,
}

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Cached, rate-limited access to venue market data.
pub struct MarketDataGateway {
    api: Arc<dyn ExchangeApi>,
    limiter: DirectLimiter,
    config: GatewayConfig,
    tickers: RwLock<Option<TickerCache>>,
    candles: RwLock<HashMap<(String, Interval), CandleCache>>,
    books: RwLock<HashMap<String, BookCache>>,
}

impl MarketDataGateway {
    pub fn new(api: Arc<dyn ExchangeApi>, config: GatewayConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute.max(1))
            .expect("requests_per_minute is clamped to at least 1");
        Self {
            api,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            config,
            tickers: RwLock::new(None),
            candles: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of all USDT-perp tickers, at most `ticker_ttl_secs` old.
    pub async fn tickers(&self) -> Result<HashMap<String, Ticker>, GatewayError> {
        let ttl = Duration::from_secs(self.config.ticker_ttl_secs);
        {
            let cache = self.tickers.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.fetched_at.elapsed() < ttl {
                    return Ok(entry.map.clone());
                }
            }
        }

        let fetched = self
            .with_retry("universe", || {
                let api = self.api.clone();
                Box::pin(async move { api.fetch_tickers().await })
            })
            .await;

        match fetched {
            Ok(raw) => {
                let map: HashMap<String, Ticker> = raw
                    .into_iter()
                    .map(|t| (t.symbol.clone(), Ticker::from(t)))
                    .collect();
                *self.tickers.write().await = Some(TickerCache {
                    fetched_at: Instant::now(),
                    map: map.clone(),
                });
                Ok(map)
            }
            Err(e) => {
                let cache = self.tickers.read().await;
                if let Some(entry) = cache.as_ref() {
                    if entry.fetched_at.elapsed() < ttl * STALE_FACTOR {
                        warn!(error = %e, "Serving stale ticker snapshot");
                        return Ok(entry.map.clone());
                    }
                }
                Err(e)
            }
        }
    }

    /// Current mark price for one symbol, from the ticker cache.
    pub async fn mark_price(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        let map = self.tickers().await?;
        map.get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::Unavailable(symbol.to_string()))
    }

    /// The last `limit` candles for a symbol, oldest first. Cached series
    /// are advanced by fetching only candles newer than the cached head.
    pub async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let depth = interval.cache_depth().max(limit);
        let key = (symbol.to_string(), interval);

        let cached = {
            let cache = self.candles.read().await;
            cache.get(&key).map(|c| c.candles.clone())
        };

        let merged = match cached {
            Some(cached) if !cached.is_empty() => {
                let head = self
                    .fetch_candles_retry(symbol, interval, INCREMENTAL_FETCH)
                    .await?;
                merge_candles(cached, head, depth)
            }
            _ => {
                self.fetch_candles_retry(symbol, interval, depth as u32)
                    .await?
            }
        };

        self.candles.write().await.insert(
            key,
            CandleCache {
                candles: merged.clone(),
            },
        );

        let skip = merged.len().saturating_sub(limit);
        Ok(merged[skip..].to_vec())
    }

    /// Order book for a symbol, depth capped at 20 levels, at most
    /// `book_ttl_secs` old.
    pub async fn order_book(&self, symbol: &str, depth: u32) -> Result<OrderBook, GatewayError> {
        let depth = depth.min(20);
        let ttl = Duration::from_secs(self.config.book_ttl_secs);
        {
            let cache = self.books.read().await;
            if let Some(entry) = cache.get(symbol) {
                if entry.fetched_at.elapsed() < ttl {
                    return Ok(entry.book.clone());
                }
            }
        }

        let book = self
            .with_retry(symbol, || {
                let api = self.api.clone();
                let symbol = symbol.to_string();
                Box::pin(async move { api.fetch_order_book(&symbol, depth).await })
            })
            .await?;

        self.books.write().await.insert(
            symbol.to_string(),
            BookCache {
                fetched_at: Instant::now(),
                book: book.clone(),
            },
        );
        Ok(book)
    }

    async fn fetch_candles_retry(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.with_retry(symbol, || {
            let api = self.api.clone();
            let symbol = symbol.to_string();
            Box::pin(async move { api.fetch_candles(&symbol, interval, limit).await })
        })
        .await
    }

    /// Serialize the request through the token bucket, then retry transient
    /// failures with jittered backoff. Logical venue errors pass straight
    /// through; exhausted retries become `Unavailable`.
    async fn with_retry<T>(
        &self,
        symbol: &str,
        mut op: impl FnMut() -> BoxFuture<'static, Result<T, ExchangeError>>,
    ) -> Result<T, GatewayError> {
        let attempts = RETRY_BACKOFF_MS.len() + 1;
        for attempt in 0..attempts {
            self.acquire_token(symbol).await?;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let jitter = rand::thread_rng().gen_range(0..100);
                    let delay = Duration::from_millis(RETRY_BACKOFF_MS[attempt] + jitter);
                    debug!(%symbol, error = %e, attempt, delay_ms = delay.as_millis() as u64, "Retrying venue request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(%symbol, error = %e, "Venue retries exhausted");
                    return Err(GatewayError::Unavailable(symbol.to_string()));
                }
                Err(e) => return Err(GatewayError::Exchange(e)),
            }
        }
        Err(GatewayError::Unavailable(symbol.to_string()))
    }

    async fn acquire_token(&self, symbol: &str) -> Result<(), GatewayError> {
        let wait = Duration::from_secs(self.config.token_wait_secs);
        tokio::time::timeout(wait, self.limiter.until_ready())
            .await
            .map_err(|_| {
                warn!(%symbol, "Token bucket exhausted beyond wait budget");
                GatewayError::Unavailable(symbol.to_string())
            })
    }
}

/// Merge freshly fetched candles onto a cached series: fetched data replaces
/// any overlapping cached candles (the cached head is still-forming), and
/// the result is truncated to `depth`. A fetch that does not overlap or
/// extend the cache replaces it outright.
pub(crate) fn merge_candles(
    cached: Vec<Candle>,
    fetched: Vec<Candle>,
    depth: usize,
) -> Vec<Candle> {
    let Some(first_new) = fetched.first() else {
        return cached;
    };
    let Some(last_cached) = cached.last() else {
        return truncate_front(fetched, depth);
    };

    // Disjoint series (cache too old to bridge): trust the fetch.
    if first_new.open_time > last_cached.open_time {
        return truncate_front(fetched, depth);
    }

    let mut merged: Vec<Candle> = cached
        .into_iter()
        .filter(|c| c.open_time < first_new.open_time)
        .collect();
    merged.extend(fetched);
    truncate_front(merged, depth)
}

fn truncate_front(mut candles: Vec<Candle>, depth: usize) -> Vec<Candle> {
    let excess = candles.len().saturating_sub(depth);
    if excess > 0 {
        candles.drain(..excess);
    }
    candles
}
