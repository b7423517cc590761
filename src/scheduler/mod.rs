//! Two-loop scheduler.
//!
//! One scanner worker per minute, self-bounded under the scheduler period,
//! and several staggered closer workers. Workers share nothing in process;
//! all coordination goes through the ledger.

use crate::closer::PositionCloser;
use crate::engine::TradingEngine;
use crate::ledger::{Ledger, Reconciler};
use crate::scanner::MomentumScanner;
use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Scanner cadence and its wall-time budget.
const SCANNER_PERIOD_SECS: u64 = 60;
const SCANNER_BUDGET_SECS: u64 = 55;

/// One scanner tick: rollover, reconcile, scan, execute.
pub struct ScannerWorker {
    ledger: Ledger,
    reconciler: Reconciler,
    scanner: MomentumScanner,
    engine: TradingEngine,
    max_open_trades: u32,
}

impl ScannerWorker {
    pub fn new(
        ledger: Ledger,
        reconciler: Reconciler,
        scanner: MomentumScanner,
        engine: TradingEngine,
        max_open_trades: u32,
    ) -> Self {
        Self {
            ledger,
            reconciler,
            scanner,
            engine,
            max_open_trades,
        }
    }

    pub async fn run_tick(&self) -> Result<()> {
        let now = Utc::now();
        self.ledger.daily_rollover(now).await?;
        self.reconciler.sweep().await?;

        let open = self.ledger.list_open()?.len() as u32;
        let available_slots = self.max_open_trades.saturating_sub(open) as usize;

        let candidates = self.scanner.scan(now, available_slots).await?;
        let report = self.engine.execute_candidates(&candidates).await;

        info!(
            open_before = open,
            candidates = candidates.len(),
            opened = report.opened,
            skipped = report.skipped,
            halted = report.halted,
            "Scanner tick complete"
        );
        Ok(())
    }
}

/// Owns the worker loops.
pub struct Scheduler {
    scanner: Arc<ScannerWorker>,
    closer: Arc<PositionCloser>,
    closer_workers: u32,
    closer_interval: Duration,
    closer_stagger: Duration,
}

impl Scheduler {
    pub fn new(
        scanner: Arc<ScannerWorker>,
        closer: Arc<PositionCloser>,
        closer_workers: u32,
        closer_interval_secs: u64,
        closer_stagger_secs: u64,
    ) -> Self {
        Self {
            scanner,
            closer,
            closer_workers: closer_workers.max(1),
            closer_interval: Duration::from_secs(closer_interval_secs),
            closer_stagger: Duration::from_secs(closer_stagger_secs),
        }
    }

    /// Spawn all worker loops. They run until the process exits.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scanner = self.scanner;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SCANNER_PERIOD_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let budget = Duration::from_secs(SCANNER_BUDGET_SECS);
                let tick: Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> =
                    Box::pin(scanner.run_tick());
                match tokio::time::timeout(budget, tick).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Scanner tick failed"),
                    Err(_) => warn!("Scanner tick exceeded its budget and was cancelled"),
                }
            }
        }));

        for worker in 0..self.closer_workers {
            let closer = self.closer.clone();
            let interval = self.closer_interval;
            let offset = self.closer_stagger * worker;
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(offset).await;
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match tokio::time::timeout(interval, closer.tick()).await {
                        Ok(Ok(report)) if report.closed > 0 || report.failed > 0 => {
                            info!(
                                worker,
                                checked = report.checked,
                                closed = report.closed,
                                retried = report.retried,
                                failed = report.failed,
                                "Closer pass complete"
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(worker, error = %e, "Closer pass aborted"),
                        Err(_) => warn!(worker, "Closer pass exceeded its period and was cancelled"),
                    }
                }
            }));
        }

        handles
    }
}
