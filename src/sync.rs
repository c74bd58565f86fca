//! Pull → send → delete-on-success.
//!
//! ```text
//! Idle ─tick─▶ Pulling ─▶ Sending ─Accepted─▶ Deleting ─▶ Idle
//!                   │            └Rejected / TransportFailure──▶ Idle (batch kept)
//!                   └─empty batch──────────────────────────────▶ Idle
//! ```
//!
//! At most one attempt is in flight; a tick arriving meanwhile is dropped
//! (coalesced), not queued. Every attempt pulls from the oldest undeleted
//! sample (cursor 0), and on success deletes exactly the ids it sent, so a
//! sample appended while the request was on the wire survives to the next
//! batch. No store lock is held while the request is outstanding, and the
//! journal delete runs on the blocking pool.

use crate::ingest_client::{IngestClient, IngestOutcome};
use crate::store::SampleStore;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Instrument;

/// Batch size used when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Where the coordinator currently is in an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No attempt running.
    Idle,
    /// Reading the next batch from the store.
    Pulling,
    /// Waiting on the ingest endpoint.
    Sending,
    /// Removing the accepted ids.
    Deleting,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    /// Nothing pending; no request was made.
    Empty,
    /// The batch was accepted and its ids removed from the store.
    Synced {
        /// Samples in the accepted batch.
        sent: usize,
        /// Samples actually removed (equal to `sent` unless deleted concurrently).
        deleted: usize,
        /// Highest id in the batch.
        last_id: u64,
    },
    /// The attempt failed; the batch is still buffered.
    RetryLater {
        /// Human-readable cause.
        reason: String,
    },
    /// Another attempt was already in flight; this tick did nothing.
    Coalesced,
}

impl SyncReport {
    /// Whether the scheduler should back off before the next attempt.
    pub fn should_retry(&self) -> bool {
        matches!(self, SyncReport::RetryLater { .. })
    }
}

/// Drives one sync attempt at a time against a store and an ingest client.
pub struct SyncCoordinator {
    store: Arc<SampleStore>,
    client: Arc<dyn IngestClient>,
    user_id: String,
    team_id: String,
    batch_size: usize,
    in_flight: AtomicBool,
    state: Mutex<SyncState>,
}

/// Releases the in-flight flag even if the attempt future is dropped.
struct InFlightGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.coordinator.state.lock() = SyncState::Idle;
        self.coordinator.in_flight.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    /// Create a coordinator. A `batch_size` of 0 is treated as 1.
    pub fn new(
        store: Arc<SampleStore>,
        client: Arc<dyn IngestClient>,
        user_id: impl Into<String>,
        team_id: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            client,
            user_id: user_id.into(),
            team_id: team_id.into(),
            batch_size: batch_size.max(1),
            in_flight: AtomicBool::new(false),
            state: Mutex::new(SyncState::Idle),
        }
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run one attempt, or return [`SyncReport::Coalesced`] if one is running.
    pub async fn tick(&self) -> SyncReport {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("Sync already in flight, trigger coalesced");
            return SyncReport::Coalesced;
        };

        let span = tracing::info_span!("sync_attempt", batch_len = tracing::field::Empty);
        self.attempt().instrument(span).await
    }

    fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard { coordinator: self })
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock() = state;
    }

    async fn attempt(&self) -> SyncReport {
        self.set_state(SyncState::Pulling);
        let batch = self.store.next_batch(0, self.batch_size);
        if batch.is_empty() {
            tracing::debug!("No pending samples");
            return SyncReport::Empty;
        }
        tracing::Span::current().record("batch_len", batch.len());

        self.set_state(SyncState::Sending);
        let outcome = self.client.send(&self.user_id, &self.team_id, &batch).await;

        match outcome {
            IngestOutcome::Accepted => {
                self.set_state(SyncState::Deleting);
                let ids: BTreeSet<u64> = batch.iter().map(|s| s.id).collect();
                let last_id = ids.last().copied().unwrap_or_default();

                let store = Arc::clone(&self.store);
                let deleted = tokio::task::spawn_blocking(move || store.delete_by_ids(&ids))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|res| res.map_err(|e| e.to_string()));

                match deleted {
                    Ok(deleted) => {
                        tracing::info!(sent = batch.len(), deleted, last_id, "Batch accepted");
                        SyncReport::Synced {
                            sent: batch.len(),
                            deleted,
                            last_id,
                        }
                    }
                    Err(e) => {
                        // the batch will be sent again; the endpoint sees it twice
                        tracing::error!(error = %e, "Accepted batch could not be deleted");
                        SyncReport::RetryLater {
                            reason: format!("delete failed: {e}"),
                        }
                    }
                }
            }
            IngestOutcome::Rejected(reason) => {
                tracing::warn!(%reason, "Batch rejected, will retry");
                SyncReport::RetryLater {
                    reason: format!("rejected: {reason}"),
                }
            }
            IngestOutcome::TransportFailure(reason) => {
                tracing::warn!(%reason, "Batch not delivered, will retry");
                SyncReport::RetryLater {
                    reason: format!("transport failure: {reason}"),
                }
            }
        }
    }
}
