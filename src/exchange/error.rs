//! Bounded error taxonomy for venue operations.

use thiserror::Error;

/// Errors surfaced by exchange clients. Transient variants are retried by
/// the market data gateway; logical variants reach the control plane.
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("rate limited by venue")]
    RateLimited,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("transient venue error: {0}")]
    Transient(String),

    #[error("unknown venue error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// Whether a retry with backoff can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::RateLimited | ExchangeError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::RateLimited.is_retryable());
        assert!(ExchangeError::Transient("502".into()).is_retryable());
        assert!(!ExchangeError::Unauthorized("bad key".into()).is_retryable());
        assert!(!ExchangeError::InsufficientMargin("x".into()).is_retryable());
        assert!(!ExchangeError::InvalidSymbol("NOPEUSDT".into()).is_retryable());
        assert!(!ExchangeError::Unknown("?".into()).is_retryable());
    }
}
