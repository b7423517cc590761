//! Exchange integration for USDT perpetual futures.
//!
//! ## Live client
//! REST access to the venue: tickers, candles, order books, market orders
//! and position queries, with a bounded error taxonomy.
//!
//! ## Paper client
//! Drop-in replacement when `live_mode` is off: real market data, simulated
//! order flow.

mod client;
mod error;
mod paper;
pub mod testing;
mod traits;
mod types;

pub use client::BinanceClient;
pub use error::ExchangeError;
pub use paper::PaperExchange;
pub use traits::ExchangeApi;
pub use types::*;
