//! Periodic accrual sweep.
//!
//! ```plain
//!   Idle ──tick / run_now──► Scanning ──► recompute(entry) × N ──► Idle
//! ```
//!
//! One sweep at a time: a trigger that finds a sweep already running gets
//! [`AccrualError::SweepInProgress`] instead of queueing behind it. Every entry
//! in a sweep is recomputed against the same `now`. A failing entry is logged,
//! counted and left for the next sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::error::{AccrualError, AccrualResult};
use super::service::{AccrualService, EntryOutcome};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub scanned: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Entries withdrawn or rewritten while the sweep was running.
    pub stale: usize,
    /// Entries skipped because of an error; retried by the next sweep.
    pub failed: usize,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

pub struct AccrualScheduler {
    service: Arc<AccrualService>,
    interval: Duration,
    running: tokio::sync::Mutex<()>,
    last_report: parking_lot::Mutex<Option<SweepReport>>,
}

impl AccrualScheduler {
    pub fn new(service: Arc<AccrualService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            running: tokio::sync::Mutex::new(()),
            last_report: parking_lot::Mutex::new(None),
        }
    }

    /// Report of the most recent completed sweep.
    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().clone()
    }

    /// Runs one sweep immediately, unless one is already running.
    pub async fn run_now(&self) -> AccrualResult<SweepReport> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(AccrualError::SweepInProgress);
        };

        let report = self.sweep().await?;
        tracing::info!(
            scanned = report.scanned,
            updated = report.updated,
            unchanged = report.unchanged,
            stale = report.stale,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "Accrual sweep: completed"
        );
        *self.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    async fn sweep(&self) -> AccrualResult<SweepReport> {
        let clock_start = Instant::now();
        let now = self.service.now();

        let entries = self.service.active_deposits().map_err(|e| {
            tracing::error!(error = %e, "Accrual sweep: failed to list active deposits");
            e
        })?;

        let mut report = SweepReport {
            started_at: now,
            scanned: entries.len(),
            updated: 0,
            unchanged: 0,
            stale: 0,
            failed: 0,
            duration: Duration::ZERO,
        };

        for deposit in &entries {
            match self.service.recompute(deposit, now) {
                Ok(EntryOutcome::Updated { accumulated_yield }) => {
                    report.updated += 1;
                    tracing::debug!(
                        deposit_id = %deposit.id,
                        accumulated_yield = %accumulated_yield,
                        "Accrual sweep: yield updated"
                    );
                }
                Ok(EntryOutcome::Unchanged) => report.unchanged += 1,
                Ok(EntryOutcome::Stale) => {
                    report.stale += 1;
                    tracing::debug!(deposit_id = %deposit.id, "Accrual sweep: stale recompute discarded");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        deposit_id = %deposit.id,
                        error = %e,
                        "Accrual sweep: failed to recompute entry, skipping"
                    );
                }
            }
            tokio::task::yield_now().await;
        }

        report.duration = clock_start.elapsed();
        Ok(report)
    }

    /// Spawns the timer task. The first sweep runs one interval after start.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Accrual sweep: scheduler started"
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // skip first immediate tick

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                match self.run_now().await {
                    Ok(_) => {}
                    Err(AccrualError::SweepInProgress) => {
                        tracing::warn!("Accrual sweep: previous sweep still running, skipping tick");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accrual sweep: sweep failed");
                    }
                }
            }

            tracing::info!("Accrual sweep: scheduler stopped");
        });

        SchedulerHandle { shutdown, task }
    }
}

/// Owner of a running scheduler task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the task and waits for it to exit. A sweep in flight finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Accrual sweep: scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::calculator::BasisPoints;
    use crate::accrual::ledger::{
        Deposit, DepositId, InMemoryLedger, LedgerError, LedgerStore, NewDeposit,
    };
    use crate::accrual::rates::RateOracle;
    use crate::accrual::service::tests::service_with;
    use crate::util::time_source::{SharedMockTimeSource, TimeSource};
    use std::sync::atomic::{AtomicBool, Ordering};

    const DAY: Duration = Duration::from_secs(86_400);
    const HOUR: Duration = Duration::from_secs(3_600);

    /// Ledger whose writes to one chosen record, or whose listing, can be made to fail.
    #[derive(Default)]
    struct FlakyLedger {
        inner: InMemoryLedger,
        broken: parking_lot::Mutex<Option<DepositId>>,
        listing_down: AtomicBool,
    }

    impl LedgerStore for FlakyLedger {
        fn create(&self, deposit: NewDeposit) -> Result<Deposit, LedgerError> {
            self.inner.create(deposit)
        }
        fn find_by_id(&self, id: &DepositId) -> Result<Option<Deposit>, LedgerError> {
            self.inner.find_by_id(id)
        }
        fn find_active(&self) -> Result<Vec<Deposit>, LedgerError> {
            if self.listing_down.load(Ordering::SeqCst) {
                return Err(LedgerError::Persistence("disk unavailable".into()));
            }
            self.inner.find_active()
        }
        fn find_by_owner(&self, owner: &str) -> Result<Vec<Deposit>, LedgerError> {
            self.inner.find_by_owner(owner)
        }
        fn update(&self, next: &Deposit) -> Result<Deposit, LedgerError> {
            if *self.broken.lock() == Some(next.id) {
                return Err(LedgerError::Persistence("write failed".into()));
            }
            self.inner.update(next)
        }
    }

    fn setup(store: Arc<dyn LedgerStore>) -> (Arc<AccrualService>, SharedMockTimeSource) {
        let clock = SharedMockTimeSource::new();
        let service = service_with(store, RateOracle::fixed(BasisPoints::new(1_000)), &clock);
        (Arc::new(service), clock)
    }

    async fn open(service: &AccrualService, principal: u128) -> DepositId {
        service
            .deposit("0xseller", "USDC", principal)
            .await
            .unwrap()
            .deposit
            .id
    }

    #[tokio::test]
    async fn test_sweep_persists_active_entries_only() {
        let (service, clock) = setup(Arc::new(InMemoryLedger::new()));
        let scheduler = AccrualScheduler::new(service.clone(), HOUR);
        let a = open(&service, 1_000_000_000).await;
        let b = open(&service, 1_000_000_000).await;
        service.withdraw(b, "0xseller").await.unwrap();

        clock.advance_time(30 * DAY);
        let report = scheduler.run_now().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.started_at, clock.now());
        assert_eq!(service.status(a).unwrap().deposit.accumulated_yield, 8_219_178);
        assert_eq!(service.status(b).unwrap().deposit.accumulated_yield, 0);

        let again = scheduler.run_now().await.unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(again.updated, 0);
        assert_eq!(scheduler.last_report(), Some(again));
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_entry_does_not_abort_sweep() {
        let ledger = Arc::new(FlakyLedger::default());
        let (service, clock) = setup(ledger.clone());
        let scheduler = AccrualScheduler::new(service.clone(), HOUR);

        let first = open(&service, 1_000_000_000).await;
        let broken = open(&service, 1_000_000_000).await;
        let last = open(&service, 1_000_000_000).await;
        *ledger.broken.lock() = Some(broken);

        clock.advance_time(DAY);
        let report = scheduler.run_now().await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.failed, 1);
        assert!(service.status(first).unwrap().deposit.accumulated_yield > 0);
        assert!(service.status(last).unwrap().deposit.accumulated_yield > 0);
        assert_eq!(service.status(broken).unwrap().deposit.accumulated_yield, 0);

        // The skipped entry catches up on the next sweep.
        *ledger.broken.lock() = None;
        let report = scheduler.run_now().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(service.status(broken).unwrap().deposit.accumulated_yield, 273_973);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_sweep() {
        let ledger = Arc::new(FlakyLedger::default());
        let (service, _clock) = setup(ledger.clone());
        let scheduler = AccrualScheduler::new(service, HOUR);
        ledger.listing_down.store(true, Ordering::SeqCst);

        assert!(matches!(
            scheduler.run_now().await,
            Err(AccrualError::Persistence(_))
        ));
        assert_eq!(scheduler.last_report(), None);
    }

    #[tokio::test]
    async fn test_sweep_rejected_while_running() {
        let (service, _clock) = setup(Arc::new(InMemoryLedger::new()));
        let scheduler = AccrualScheduler::new(service, HOUR);

        let held = scheduler.running.try_lock().unwrap();
        assert_eq!(
            scheduler.run_now().await.unwrap_err(),
            AccrualError::SweepInProgress
        );
        drop(held);
        assert!(scheduler.run_now().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drives_sweeps() {
        let (service, clock) = setup(Arc::new(InMemoryLedger::new()));
        let id = open(&service, 1_000_000_000).await;
        clock.advance_time(30 * DAY);

        let scheduler = Arc::new(AccrualScheduler::new(service.clone(), HOUR));
        let handle = scheduler.clone().start();

        // Nothing runs before the first interval elapses.
        tokio::time::sleep(HOUR - Duration::from_secs(1)).await;
        assert_eq!(scheduler.last_report(), None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        for _ in 0..100 {
            if scheduler.last_report().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let report = scheduler.last_report().unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(service.status(id).unwrap().deposit.accumulated_yield, 8_219_178);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick() {
        let (service, _clock) = setup(Arc::new(InMemoryLedger::new()));
        let scheduler = Arc::new(AccrualScheduler::new(service, HOUR));
        let handle = scheduler.clone().start();
        handle.stop().await;
        assert_eq!(scheduler.last_report(), None);
    }
}
