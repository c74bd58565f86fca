//! # wearsync
//!
//! Collects health telemetry from two BLE wearables (wrist and chest), buffers
//! it durably on the host and forwards it in batches to a remote ingest
//! endpoint, deleting only what the endpoint acknowledged.
//!
//! ## Crate Structure
//!
//! - **`sample`**: `SourceTag`, `RawPacket` and the persisted `Sample` record.
//! - **`decoder`**: `PacketDecoder`, the tolerant multi-shape payload decoder.
//! - **`store`**: `SampleStore`, the append-only sample journal with id cursoring
//!   and id-set deletion.
//! - **`pipeline`**: `IngestSource` handles feeding a bounded queue drained by a
//!   single `IngestWorker` (decode, then append).
//! - **`ingest_client`**: the `IngestClient` trait and its HTTP implementation.
//! - **`sync`**: `SyncCoordinator`, one pull → send → delete attempt at a time.
//! - **`scheduler`**: periodic, on-demand and backoff-driven sync ticks.
//! - **`error_recovery`**: retry timing.
//! - **`capture`**: text line formats for replaying captured payloads.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`error`**: error types.
//!
//! The BLE link itself (scanning, GATT discovery, notification subscription) is
//! outside this crate; it only has to call [`pipeline::IngestSource::deliver`]
//! with each notification payload.

pub mod capture;
pub mod config;
pub mod decoder;
pub mod error;
pub mod error_recovery;
pub mod ingest_client;
pub mod logging;
pub mod pipeline;
pub mod sample;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use decoder::PacketDecoder;
pub use error::{AppResult, DecodeError, StoreError, WearSyncError};
pub use ingest_client::{HttpIngestClient, IngestClient, IngestOutcome};
pub use pipeline::{ingest_channel, IngestSource, IngestWorker};
pub use sample::{NewSample, RawPacket, Sample, SourceTag};
pub use store::{SampleStore, StoreOptions};
pub use sync::{SyncCoordinator, SyncReport, SyncState};
