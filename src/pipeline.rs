//! Ingest path from the BLE layer into the sample store.
//!
//! ```text
//! IngestSource(Wrist) ─┐
//!                      ├─▶ bounded mpsc ─▶ IngestWorker ─▶ decode ─▶ SampleStore::append
//! IngestSource(Chest) ─┘
//! ```
//!
//! Both peripherals share one code path: an [`IngestSource`] is the same type
//! for either, parameterised by its [`SourceTag`]. Packets are queued rather
//! than persisted from inside the notification callback, so back-pressure is
//! visible (a full queue is reported to the caller) and append order is the
//! order the single worker dequeues in.
//!
//! A bad packet is logged and counted, then dropped. It never stops the
//! worker or affects neighbouring packets.

use crate::decoder::PacketDecoder;
use crate::error::{AppResult, WearSyncError};
use crate::sample::{RawPacket, SourceTag};
use crate::store::SampleStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Running totals for the ingest path.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    appended: AtomicU64,
    decode_failures: AtomicU64,
    store_failures: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    /// Packets accepted onto the queue.
    pub received: u64,
    /// Samples persisted.
    pub appended: u64,
    /// Packets that matched no payload shape.
    pub decode_failures: u64,
    /// Decoded samples lost to a store error.
    pub store_failures: u64,
    /// Packets refused because the queue was full.
    pub dropped: u64,
}

impl IngestStats {
    /// Read all counters.
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the ingest queue. Hands out one [`IngestSource`] per peripheral.
#[derive(Clone)]
pub struct IngestHub {
    tx: mpsc::Sender<RawPacket>,
    stats: Arc<IngestStats>,
}

/// Delivery handle for one peripheral.
#[derive(Clone)]
pub struct IngestSource {
    tag: SourceTag,
    tx: mpsc::Sender<RawPacket>,
    stats: Arc<IngestStats>,
}

/// Consumer side: decodes queued packets and appends them.
pub struct IngestWorker {
    rx: mpsc::Receiver<RawPacket>,
    decoder: PacketDecoder,
    store: Arc<SampleStore>,
    stats: Arc<IngestStats>,
}

/// Build the queue with room for `capacity` packets in flight.
pub fn ingest_channel(
    decoder: PacketDecoder,
    store: Arc<SampleStore>,
    capacity: usize,
) -> (IngestHub, IngestWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(IngestStats::default());
    (
        IngestHub {
            tx,
            stats: Arc::clone(&stats),
        },
        IngestWorker {
            rx,
            decoder,
            store,
            stats,
        },
    )
}

impl IngestHub {
    /// Delivery handle for `tag`.
    pub fn source(&self, tag: SourceTag) -> IngestSource {
        IngestSource {
            tag,
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }
}

impl IngestSource {
    /// Peripheral this handle delivers for.
    pub fn tag(&self) -> SourceTag {
        self.tag
    }

    /// Queue a payload, waiting for room if the queue is full.
    pub async fn deliver(&self, payload: Vec<u8>) -> AppResult<()> {
        self.tx
            .send(RawPacket::now(self.tag, payload))
            .await
            .map_err(|_| WearSyncError::QueueClosed)?;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a payload without waiting. For callback contexts that must not block.
    pub fn try_deliver(&self, payload: Vec<u8>) -> AppResult<()> {
        match self.tx.try_send(RawPacket::now(self.tag, payload)) {
            Ok(()) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(source = %self.tag, "Ingest queue full, packet dropped");
                Err(WearSyncError::QueueFull(self.tag))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WearSyncError::QueueClosed),
        }
    }
}

impl IngestWorker {
    /// Process packets until every hub and source handle is dropped and the
    /// queue is drained.
    pub async fn run(mut self) -> IngestStatsSnapshot {
        tracing::info!("Ingest worker started");
        while let Some(packet) = self.rx.recv().await {
            self.process(&packet).await;
        }
        let stats = self.stats.snapshot();
        tracing::info!(
            appended = stats.appended,
            decode_failures = stats.decode_failures,
            "Ingest worker stopped"
        );
        stats
    }

    /// Decode and persist one packet. Returns the new sample id, if any.
    ///
    /// The journal write runs on the blocking pool.
    pub async fn process(&self, packet: &RawPacket) -> Option<u64> {
        let sample = match self.decoder.decode_packet(packet) {
            Ok(sample) => sample,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    source = %e.peripheral,
                    payload_len = e.payload_len,
                    reason = %e.reason,
                    "Dropping undecodable packet"
                );
                return None;
            }
        };

        let store = Arc::clone(&self.store);
        let appended = tokio::task::spawn_blocking(move || store.append(sample))
            .await
            .map_err(|e| e.to_string())
            .and_then(|res| res.map_err(|e| e.to_string()));

        match appended {
            Ok(id) => {
                self.stats.appended.fetch_add(1, Ordering::Relaxed);
                Some(id)
            }
            Err(e) => {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(source = %packet.source, error = %e, "Sample lost: append failed");
                None
            }
        }
    }
}
