//! # Momentum Scalper
//!
//! Automated momentum trading for USDT perpetual futures on a one-minute
//! cadence.
//!
//! ## Architecture
//!
//! - `config`: configuration loading and validation
//! - `exchange`: venue REST client, paper client, bounded error taxonomy
//! - `market_data`: cached, rate-limited market data gateway
//! - `ledger`: atomic risk ledger, position lifecycle, reconciliation
//! - `scanner`: universe filtering and momentum scoring
//! - `engine`: sizing, leverage, and the reserve/place/commit handshake
//! - `closer`: exit state machine and close submission
//! - `scheduler`: scanner and closer worker loops
//! - `alerts`: operator alert channel

pub mod alerts;
pub mod closer;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod ledger;
pub mod market_data;
pub mod scanner;
pub mod scheduler;
pub mod utils;

pub use config::Config;
