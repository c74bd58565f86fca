//! Durable, ordered sample journal.
//!
//! Samples are kept in an append-only journal file of JSON lines plus an
//! in-memory index ordered by id. The journal is the source of truth; the
//! index is rebuilt from it on [`SampleStore::open`].
//!
//! # Journal Layout
//! ```text
//! {"op":"append","sample":{"id":1,...}}
//! {"op":"append","sample":{"id":2,...}}
//! {"op":"delete","ids":[1]}
//! {"op":"high_water","last_id":2}      (first line after compaction)
//! ```
//!
//! # Concurrency
//!
//! All mutations go through a single writer section (`writer` mutex) that
//! assigns ids, writes the record and only then publishes it to the index.
//! Readers take the index read lock only, so they never see a sample whose
//! journal record is not fully written, and they never wait on disk I/O.
//! Deletes name their ids explicitly; a sample appended while a delete is in
//! progress is untouched by it.
//!
//! A torn final line (crash mid-write) is ignored and truncated on open. Any
//! other unreadable line is reported as [`StoreError::Corrupt`].

use crate::error::StoreError;
use crate::sample::{NewSample, Sample};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Tuning knobs for the journal.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Rewrite the journal once this many records are superseded by deletes.
    pub compact_after: usize,
    /// `fsync` after every record.
    pub fsync: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compact_after: 1000,
            fsync: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Append { sample: Sample },
    Delete { ids: Vec<u64> },
    HighWater { last_id: u64 },
}

struct Journal {
    file: File,
    /// Byte length of the journal up to the last complete record.
    len: u64,
    next_id: u64,
    /// Records that no longer describe a live sample.
    superseded: usize,
}

/// Durable sample buffer shared by the ingest worker and the sync coordinator.
pub struct SampleStore {
    path: PathBuf,
    options: StoreOptions,
    writer: Mutex<Journal>,
    index: RwLock<BTreeMap<u64, Sample>>,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl SampleStore {
    /// Open (or create) the journal at `path` and rebuild the index.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let bytes = std::fs::read(&path)?;
        let replay = replay(&bytes)?;

        if replay.valid_len < bytes.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() as u64 - replay.valid_len,
                "Discarding torn record at end of sample journal"
            );
            file.set_len(replay.valid_len)?;
        }

        tracing::info!(
            path = %path.display(),
            pending = replay.index.len(),
            next_id = replay.next_id,
            "Sample journal opened"
        );

        Ok(Self {
            path,
            options,
            writer: Mutex::new(Journal {
                file,
                len: replay.valid_len,
                next_id: replay.next_id,
                superseded: replay.superseded,
            }),
            index: RwLock::new(replay.index),
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Make every following journal write fail with an I/O error.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Path of the backing journal.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a decoded sample and return its id.
    ///
    /// Ids are assigned inside the writer section, so concurrent appends from
    /// both sources receive distinct, strictly increasing ids.
    pub fn append(&self, data: NewSample) -> Result<u64, StoreError> {
        let mut journal = self.writer.lock();
        let id = journal.next_id;
        let sample = Sample::new(id, data);

        self.write_record(
            &mut journal,
            &JournalRecord::Append {
                sample: sample.clone(),
            },
        )?;
        journal.next_id += 1;

        tracing::debug!(id, source = %sample.source, "Sample appended");
        self.index.write().insert(id, sample);
        Ok(id)
    }

    /// Highest-id sample still buffered.
    pub fn latest(&self) -> Option<Sample> {
        self.index.read().values().next_back().cloned()
    }

    /// Up to `limit` samples with `id > after_id`, ascending.
    ///
    /// Reading does not consume: without an intervening delete, repeated calls
    /// return the same batch.
    pub fn next_batch(&self, after_id: u64, limit: usize) -> Vec<Sample> {
        self.index
            .read()
            .range((Bound::Excluded(after_id), Bound::Unbounded))
            .take(limit)
            .map(|(_, sample)| sample.clone())
            .collect()
    }

    /// Number of samples waiting to be synced.
    pub fn pending_count(&self) -> usize {
        self.index.read().len()
    }

    /// Remove exactly the given ids; ids not present are ignored.
    ///
    /// Returns how many samples were removed. Deleting an already-deleted set
    /// returns 0 and writes nothing.
    pub fn delete_by_ids(&self, ids: &BTreeSet<u64>) -> Result<usize, StoreError> {
        let mut journal = self.writer.lock();

        let present: Vec<u64> = {
            let index = self.index.read();
            ids.iter().copied().filter(|id| index.contains_key(id)).collect()
        };
        if present.is_empty() {
            return Ok(0);
        }

        let record = JournalRecord::Delete {
            ids: present.clone(),
        };
        self.write_record(&mut journal, &record)?;

        {
            let mut index = self.index.write();
            for id in &present {
                index.remove(id);
            }
        }
        // the delete record and each append it cancels
        journal.superseded += present.len() + 1;
        tracing::debug!(count = present.len(), "Samples deleted");

        if journal.superseded >= self.options.compact_after {
            if let Err(e) = self.compact_locked(&mut journal) {
                // the journal is still consistent, compaction is retried on the next delete
                tracing::warn!(error = %e, "Sample journal compaction failed");
            }
        }

        Ok(present.len())
    }

    /// Rewrite the journal so it holds only live samples.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut journal = self.writer.lock();
        self.compact_locked(&mut journal)
    }

    fn compact_locked(&self, journal: &mut Journal) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("compact.tmp");
        let mut buf = Vec::new();
        encode_line(
            &mut buf,
            &JournalRecord::HighWater {
                last_id: journal.next_id - 1,
            },
        )?;
        {
            let index = self.index.read();
            for sample in index.values() {
                encode_line(
                    &mut buf,
                    &JournalRecord::Append {
                        sample: sample.clone(),
                    },
                )?;
            }
        }

        match std::fs::remove_file(&tmp_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        // the handle written here becomes the live journal, nothing is reopened
        let mut compacted = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&tmp_path)?;
        compacted.write_all(&buf)?;
        compacted.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        journal.file = compacted;
        journal.len = buf.len() as u64;
        journal.superseded = 0;
        sync_parent_dir(&self.path)?;

        tracing::info!(
            path = %self.path.display(),
            bytes = journal.len,
            "Sample journal compacted"
        );
        Ok(())
    }

    fn write_record(&self, journal: &mut Journal, record: &JournalRecord) -> Result<(), StoreError> {
        let mut line = Vec::with_capacity(256);
        encode_line(&mut line, record)?;

        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::other("journal writes disabled").into());
        }

        let written = journal.file.write_all(&line).and_then(|()| {
            if self.options.fsync {
                journal.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            // drop any partial line so the next record starts on a clean boundary
            if let Err(trunc) = journal.file.set_len(journal.len) {
                tracing::error!(error = %trunc, "Failed to roll back partial journal write");
            }
            return Err(e.into());
        }

        journal.len += line.len() as u64;
        Ok(())
    }
}

/// Make a rename in `path`'s directory durable.
fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

fn encode_line(buf: &mut Vec<u8>, record: &JournalRecord) -> Result<(), StoreError> {
    serde_json::to_writer(&mut *buf, record)?;
    buf.push(b'\n');
    Ok(())
}

struct Replay {
    index: BTreeMap<u64, Sample>,
    next_id: u64,
    superseded: usize,
    valid_len: u64,
}

fn replay(bytes: &[u8]) -> Result<Replay, StoreError> {
    let mut index = BTreeMap::new();
    let mut last_id = 0u64;
    let mut superseded = 0usize;
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        let Some(newline) = bytes[offset..].iter().position(|&b| b == b'\n') else {
            // unterminated tail: the write never completed
            break;
        };
        let line = &bytes[offset..offset + newline];
        offset += newline + 1;
        line_no += 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let record: JournalRecord =
            serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
                line: line_no,
                detail: e.to_string(),
            })?;

        match record {
            JournalRecord::Append { sample } => {
                last_id = last_id.max(sample.id);
                index.insert(sample.id, sample);
            }
            JournalRecord::Delete { ids } => {
                for id in &ids {
                    if index.remove(id).is_some() {
                        superseded += 1;
                    }
                }
                superseded += 1;
            }
            JournalRecord::HighWater { last_id: mark } => {
                last_id = last_id.max(mark);
            }
        }
    }

    Ok(Replay {
        index,
        next_id: last_id + 1,
        superseded,
        valid_len: offset as u64,
    })
}
