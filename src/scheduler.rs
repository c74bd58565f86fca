//! Periodic and on-demand sync scheduling.
//!
//! The scheduler owns *when* to sync; the coordinator owns *what* a sync does.
//! It ticks the coordinator:
//!
//! - once at start-up, then every `interval` after a successful or empty tick,
//! - immediately when a [`SyncTrigger`] fires while no attempt is running
//!   (a trigger during an attempt is dropped, it does not queue another one),
//! - immediately again after a full accepted batch (backlog drain),
//! - after an exponentially growing delay while attempts keep failing.
//!
//! The loop ends when the shutdown channel flips to `true` or its sender is
//! dropped. An attempt already running is allowed to finish.

use crate::error_recovery::{Backoff, RetryPolicy};
use crate::sync::{SyncCoordinator, SyncReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Cloneable handle that requests an immediate sync.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    /// Ask for a sync as soon as possible. Repeated requests collapse into one,
    /// and requests made while an attempt is running are discarded.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Drives a [`SyncCoordinator`] until shutdown.
pub struct SyncScheduler {
    coordinator: Arc<SyncCoordinator>,
    interval: Duration,
    backoff: Backoff,
    notify: Arc<Notify>,
}

impl SyncScheduler {
    /// Create a scheduler ticking every `interval`, backing off per `policy`.
    pub fn new(coordinator: Arc<SyncCoordinator>, interval: Duration, policy: RetryPolicy) -> Self {
        Self {
            coordinator,
            interval,
            backoff: Backoff::new(policy),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Handle for on-demand syncs.
    pub fn trigger(&self) -> SyncTrigger {
        SyncTrigger {
            notify: Arc::clone(&self.notify),
        }
    }

    /// Run until `shutdown` becomes `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");
        let mut delay = Duration::ZERO;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                () = self.notify.notified() => {
                    tracing::debug!("On-demand sync requested");
                }
                () = tokio::time::sleep(delay) => {}
            }

            let report = self.coordinator.tick().await;
            self.discard_pending_trigger().await;
            delay = self.next_delay(&report);
        }

        tracing::info!("Sync scheduler stopped");
    }

    /// Consume a permit stored by a trigger that fired during the last tick.
    async fn discard_pending_trigger(&self) {
        tokio::select! {
            biased;
            () = self.notify.notified() => {
                tracing::debug!("On-demand sync requested mid-attempt, dropped");
            }
            () = std::future::ready(()) => {}
        }
    }

    fn next_delay(&mut self, report: &SyncReport) -> Duration {
        match report {
            SyncReport::Synced { sent, .. } => {
                self.backoff.reset();
                if *sent >= self.coordinator.batch_size() {
                    Duration::ZERO
                } else {
                    self.interval
                }
            }
            SyncReport::Empty | SyncReport::Coalesced => {
                self.backoff.reset();
                self.interval
            }
            SyncReport::RetryLater { reason } => {
                let delay = self.backoff.fail();
                tracing::info!(
                    failures = self.backoff.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    %reason,
                    "Sync failed, backing off"
                );
                delay.min(self.interval)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest_client::{IngestClient, IngestOutcome};
    use crate::sample::{NewSample, Sample, SourceTag};
    use crate::store::{SampleStore, StoreOptions};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingClient {
        calls: AtomicUsize,
        fail_first: usize,
        latency: Duration,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl IngestClient for CountingClient {
        async fn send(&self, _u: &str, _t: &str, batch: &[Sample]) -> IngestOutcome {
            self.batches.lock().push(batch.len());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if n < self.fail_first {
                IngestOutcome::TransportFailure("offline".into())
            } else {
                IngestOutcome::Accepted
            }
        }
    }

    type Fixture = (TempDir, Arc<SampleStore>, Arc<CountingClient>, Arc<SyncCoordinator>);

    fn fixture(samples: usize, fail_first: usize, batch: usize) -> Fixture {
        slow_fixture(samples, fail_first, batch, Duration::ZERO)
    }

    fn slow_fixture(samples: usize, fail_first: usize, batch: usize, latency: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SampleStore::open(
                dir.path().join("samples.journal"),
                StoreOptions {
                    compact_after: 1000,
                    fsync: false,
                },
            )
            .unwrap(),
        );
        for _ in 0..samples {
            store
                .append(NewSample {
                    user_id: "u".into(),
                    team_id: "t".into(),
                    device_id: "C01".into(),
                    source: SourceTag::Chest,
                    timestamp_millis: 0,
                    battery_pct: 0.0,
                    heart_rate: 60.0,
                    spo2: 97.0,
                    temperature: 0.0,
                    raw_payload_echo: String::new(),
                })
                .unwrap();
        }
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            fail_first,
            latency,
            batches: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(SyncCoordinator::new(store.clone(), client.clone(), "u", "t", batch));
        (dir, store, client, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_drains_without_waiting_interval() {
        let (_dir, store, client, coordinator) = fixture(5, 0, 2);
        let scheduler = SyncScheduler::new(coordinator, Duration::from_secs(900), RetryPolicy::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.pending_count(), 0);
        assert_eq!(client.batches.lock().clone(), vec![2, 2, 1]);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_then_recover() {
        let (_dir, store, client, coordinator) = fixture(1, 2, 100);
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60));
        let scheduler = SyncScheduler::new(coordinator, Duration::from_secs(900), policy);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        // first attempt at t=0 fails, retry at t=10 fails, retry at t=30 succeeds
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.pending_count(), 1);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.pending_count(), 0);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_runs_sync_before_interval() {
        let (_dir, store, client, coordinator) = fixture(0, 0, 100);
        let scheduler = SyncScheduler::new(coordinator, Duration::from_secs(900), RetryPolicy::default());
        let trigger = scheduler.trigger();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        // initial tick finds nothing
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        store
            .append(NewSample {
                user_id: "u".into(),
                team_id: "t".into(),
                device_id: "W01".into(),
                source: SourceTag::Wrist,
                timestamp_millis: 0,
                battery_pct: 0.0,
                heart_rate: 60.0,
                spo2: 97.0,
                temperature: 0.0,
                raw_payload_echo: String::new(),
            })
            .unwrap();
        trigger.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending_count(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_attempt_is_dropped_and_backoff_holds() {
        let (_dir, store, client, coordinator) = slow_fixture(1, 1, 100, Duration::from_secs(5));
        let policy = RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(300));
        let scheduler = SyncScheduler::new(coordinator, Duration::from_secs(900), policy);
        let trigger = scheduler.trigger();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        // first attempt runs from t=0 to t=5 and fails
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        trigger.trigger();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending_count(), 1);

        // retry waits out the 60 s backoff from t=5
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        // the retry sent at t=65 completes at t=70
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.pending_count(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
