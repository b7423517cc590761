//! Operator alert channel.
//!
//! Alerts are delivered through the structured log and fanned out on an
//! in-process channel so the scheduler (and tests) can observe them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::error;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    /// Ledger and venue disagree about a position.
    ReconciliationAnomaly,
    /// A position could not be closed after repeated attempts.
    StuckPosition,
    /// An exchange fill could not be confirmed within the commit deadline.
    CommitTimeout,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ReconciliationAnomaly => "RECONCILIATION_ANOMALY",
            AlertKind::StuckPosition => "STUCK_POSITION",
            AlertKind::CommitTimeout => "COMMIT_TIMEOUT",
        }
    }
}

/// A single operator alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub symbol: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Sender half, cheap to clone into every component.
#[derive(Clone)]
pub struct AlertChannel {
    tx: UnboundedSender<Alert>,
}

impl AlertChannel {
    pub fn new() -> (Self, UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an alert. Never blocks; a dropped receiver only loses fan-out,
    /// the log record is always written.
    pub fn raise(&self, kind: AlertKind, symbol: Option<&str>, message: impl Into<String>) {
        let alert = Alert {
            kind,
            symbol: symbol.map(str::to_string),
            message: message.into(),
            at: Utc::now(),
        };
        error!(
            alert = alert.kind.as_str(),
            symbol = alert.symbol.as_deref().unwrap_or("-"),
            "{}",
            alert.message
        );
        let _ = self.tx.send(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alerts_reach_subscriber() {
        let (channel, mut rx) = AlertChannel::new();
        channel.raise(AlertKind::StuckPosition, Some("BTCUSDT"), "cannot close");

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.kind, AlertKind::StuckPosition);
        assert_eq!(alert.symbol.as_deref(), Some("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_raise_survives_dropped_receiver() {
        let (channel, rx) = AlertChannel::new();
        drop(rx);
        channel.raise(AlertKind::CommitTimeout, None, "no receiver");
    }
}
