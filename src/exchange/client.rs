//! REST API client for Binance USDT-margined perpetual futures.

use super::error::ExchangeError;
use super::traits::ExchangeApi;
use super::types::*;
use crate::config::BinanceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Binance futures API client.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

/// Raw kline row: the venue returns a heterogeneous JSON array per candle.
type RawKline = (
    i64,    // open time
    String, // open
    String, // high
    String, // low
    String, // close
    String, // volume
    i64,    // close time
    String, // quote volume
    i64,    // trade count
    String, // taker buy base volume
    String, // taker buy quote volume
    String, // ignore
);

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

impl BinanceClient {
    /// Create a new client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if config.testnet {
            FUTURES_TESTNET_URL.to_string()
        } else {
            FUTURES_BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
        })
    }

    /// HMAC-SHA256 signature over the query string.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    fn map_transport_error(e: reqwest::Error) -> ExchangeError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ExchangeError::Transient(e.to_string())
        } else {
            ExchangeError::Unknown(e.to_string())
        }
    }

    /// Map an HTTP response into a typed value or the bounded error taxonomy.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ExchangeError::Unknown(format!("decode failed: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(ExchangeError::RateLimited),
            s if s.as_u16() == 418 => Err(ExchangeError::RateLimited),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ExchangeError::Unauthorized(body))
            }
            s if s.is_server_error() => Err(ExchangeError::Transient(format!("{s}: {body}"))),
            _ => match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => Err(Self::classify_api_error(err)),
                Err(_) => Err(ExchangeError::Unknown(format!("{status}: {body}"))),
            },
        }
    }

    fn classify_api_error(err: ApiErrorBody) -> ExchangeError {
        match err.code {
            -1003 => ExchangeError::RateLimited,
            -1121 | -4141 => ExchangeError::InvalidSymbol(err.msg),
            -2018 | -2019 | -4164 => ExchangeError::InsufficientMargin(err.msg),
            -1021 | -1001 => ExchangeError::Transient(err.msg),
            _ => ExchangeError::Unknown(format!("code {}: {}", err.code, err.msg)),
        }
    }

    fn parse_decimal(raw: &str) -> Result<Decimal, ExchangeError> {
        Decimal::from_str(raw)
            .map_err(|e| ExchangeError::Unknown(format!("bad decimal {raw:?}: {e}")))
    }

    fn candle_from_raw(raw: RawKline) -> Result<Candle, ExchangeError> {
        Ok(Candle {
            open_time: Utc
                .timestamp_millis_opt(raw.0)
                .single()
                .ok_or_else(|| ExchangeError::Unknown(format!("bad open time {}", raw.0)))?,
            open: Self::parse_decimal(&raw.1)?,
            high: Self::parse_decimal(&raw.2)?,
            low: Self::parse_decimal(&raw.3)?,
            close: Self::parse_decimal(&raw.4)?,
            volume: Self::parse_decimal(&raw.5)?,
        })
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, ExchangeError> {
        let mut query: Vec<String> = params
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        query.push(format!("timestamp={}", Self::timestamp()));
        let query = query.join("&");
        let signature = self.sign(&query);

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        Self::decode(response).await
    }

    /// Set leverage for a symbol before order placement.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        #[derive(Deserialize)]
        struct LeverageAck {
            #[allow(dead_code)]
            leverage: u32,
        }
        let _: LeverageAck = self
            .signed_post(
                "/fapi/v1/leverage",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("leverage".to_string(), leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    fn name(&self) -> &str {
        "binance-futures"
    }

    #[instrument(skip(self))]
    async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        Self::decode(response).await
    }

    #[instrument(skip(self))]
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        let rows: Vec<RawKline> = Self::decode(response).await?;
        rows.into_iter().map(Self::candle_from_raw).collect()
    }

    #[instrument(skip(self))]
    async fn fetch_order_book(
        &self,
        symbol: &str,
        depth: u32,
    ) -> Result<OrderBook, ExchangeError> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url, symbol, depth
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        let raw: DepthResponse = Self::decode(response).await?;

        let parse_side = |levels: Vec<(String, String)>| {
            levels
                .into_iter()
                .map(|(p, q)| Ok((Self::parse_decimal(&p)?, Self::parse_decimal(&q)?)))
                .collect::<Result<Vec<_>, ExchangeError>>()
        };

        Ok(OrderBook {
            bids: parse_side(raw.bids)?,
            asks: parse_side(raw.asks)?,
        })
    }

    #[instrument(skip(self, order), fields(symbol = %order.symbol, side = order.side.as_str()))]
    async fn place_market_order(
        &self,
        order: &MarketOrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        self.set_leverage(&order.symbol, order.leverage).await?;

        let fill: OrderFill = self
            .signed_post(
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), order.symbol.clone()),
                    ("side".to_string(), order.side.as_str().to_string()),
                    ("type".to_string(), "MARKET".to_string()),
                    ("quantity".to_string(), order.quantity.to_string()),
                    ("newOrderRespType".to_string(), "RESULT".to_string()),
                ],
            )
            .await?;

        debug!(
            order_id = fill.order_id,
            filled_qty = %fill.executed_qty,
            avg_price = %fill.avg_price,
            "Market order placed"
        );
        Ok(fill)
    }

    #[instrument(skip(self))]
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        self.signed_post(
            "/fapi/v1/order",
            vec![
                ("symbol".to_string(), symbol.to_string()),
                ("side".to_string(), side.as_str().to_string()),
                ("type".to_string(), "MARKET".to_string()),
                ("quantity".to_string(), quantity.to_string()),
                ("reduceOnly".to_string(), "true".to_string()),
                ("newOrderRespType".to_string(), "RESULT".to_string()),
            ],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        let query = format!("timestamp={}", Self::timestamp());
        let signature = self.sign(&query);
        let url = format!(
            "{}/fapi/v2/positionRisk?{}&signature={}",
            self.base_url, query, signature
        );

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        let rows: Vec<PositionRisk> = Self::decode(response).await?;

        Ok(rows
            .into_iter()
            .filter(|p| !p.position_amt.is_zero())
            .map(|p| VenuePosition {
                symbol: p.symbol,
                direction: if p.position_amt > Decimal::ZERO {
                    Direction::Long
                } else {
                    Direction::Short
                },
                quantity: p.position_amt.abs(),
                entry_price: p.entry_price,
            })
            .collect())
    }
}
