//! Per-pass completion tracking.
//!
//! The [`CompletionTracker`] knows which file records of a snapshot still
//! wait for their content. When a signature resolves, every record sharing
//! that signature is written through the [`OutputSink`] with the same bytes.
//!
//! ```text
//! pending: signature ──► [records]
//!              │
//!   materialize(sig, payload)
//!              │
//!   pending ──► writing ──┬── write ok ──► completed
//!                         └── write err ──► write_failures, back to pending
//! ```
//!
//! A record counts as remaining until its write has returned, so a pass that
//! is abandoned mid-write leaves the record for the next pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::model::{FileRecord, Signature, Snapshot};
use crate::output::OutputSink;

#[derive(Debug, Default)]
struct TrackerState {
    pending: HashMap<Signature, Vec<FileRecord>>,
    /// Records handed to the sink whose write has not returned yet.
    writing: HashMap<Signature, Vec<FileRecord>>,
    completed: HashSet<FileRecord>,
    write_failures: HashSet<FileRecord>,
}

/// Tracks which files of one snapshot are still missing.
pub struct CompletionTracker {
    /// Every record tracked, fixed at construction.
    tracked: HashSet<FileRecord>,
    state: Mutex<TrackerState>,
    sink: Arc<dyn OutputSink>,
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionTracker")
            .field("pending", &state.pending.len())
            .field("writing", &state.writing.len())
            .field("completed", &state.completed.len())
            .field("write_failures", &state.write_failures.len())
            .finish()
    }
}

impl CompletionTracker {
    /// Track the downloadable records of `snapshot`.
    pub fn new(snapshot: &Snapshot, sink: Arc<dyn OutputSink>) -> Self {
        let mut pending: HashMap<Signature, Vec<FileRecord>> = HashMap::new();
        for file in snapshot.files().iter().filter(|f| f.is_downloadable()) {
            if let Some(signature) = &file.signature {
                pending.entry(signature.clone()).or_default().push(file.clone());
            }
        }

        let tracked = pending.values().flatten().cloned().collect();
        Self {
            tracked,
            state: Mutex::new(TrackerState {
                pending,
                ..TrackerState::default()
            }),
            sink,
        }
    }

    /// Signatures with at least one record not yet written.
    pub fn remaining_signatures(&self) -> HashSet<Signature> {
        let state = self.state.lock();
        state
            .pending
            .keys()
            .chain(state.writing.keys())
            .cloned()
            .collect()
    }

    /// Records not yet written, including records whose write is in flight.
    pub fn remaining_files(&self) -> HashSet<FileRecord> {
        let state = self.state.lock();
        state
            .pending
            .values()
            .chain(state.writing.values())
            .flatten()
            .cloned()
            .collect()
    }

    /// Remaining and completed records, read under one lock so a write
    /// finishing concurrently lands in exactly one of the two.
    pub fn progress(&self) -> (HashSet<FileRecord>, HashSet<FileRecord>) {
        let state = self.state.lock();
        let remaining = state
            .pending
            .values()
            .chain(state.writing.values())
            .flatten()
            .cloned()
            .collect();
        (remaining, state.completed.clone())
    }

    /// Records whose write is in flight.
    pub fn writing_files(&self) -> HashSet<FileRecord> {
        self.state.lock().writing.values().flatten().cloned().collect()
    }

    /// Records written successfully during this pass.
    pub fn completed(&self) -> HashSet<FileRecord> {
        self.state.lock().completed.clone()
    }

    /// Records whose write was rejected by the sink during this pass.
    pub fn write_failures(&self) -> HashSet<FileRecord> {
        self.state.lock().write_failures.clone()
    }

    /// Every record this tracker was built with, including records whose
    /// write is still in flight.
    pub fn tracked_files(&self) -> HashSet<FileRecord> {
        self.tracked.clone()
    }

    /// Write `payload` to every pending record with `signature`.
    ///
    /// Unknown or already completed signatures are ignored. Records stay
    /// remaining until their write returns; records whose write fails go back
    /// to pending so the next pass retries them.
    pub async fn materialize(&self, signature: &Signature, payload: Bytes) {
        let records = {
            let mut state = self.state.lock();
            let Some(records) = state.pending.remove(signature) else {
                debug!(%signature, "Signature not pending, ignoring");
                return;
            };
            state.writing.insert(signature.clone(), records.clone());
            records
        };

        for record in records {
            let result = self.sink.write(&record, payload.clone()).await;

            let mut state = self.state.lock();
            if let Some(writing) = state.writing.get_mut(signature) {
                writing.retain(|r| r != &record);
                if writing.is_empty() {
                    state.writing.remove(signature);
                }
            }
            match result {
                Ok(()) => {
                    debug!(file = %record, bytes = payload.len(), "File materialized");
                    state.write_failures.remove(&record);
                    state.completed.insert(record);
                }
                Err(e) => {
                    warn!(file = %record, error = %e, "Failed to write file");
                    state.write_failures.insert(record.clone());
                    state
                        .pending
                        .entry(signature.clone())
                        .or_default()
                        .push(record);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::BoxFuture;
    use crate::model::FileKind;
    use std::io;

    /// Sink recording writes; rejects paths listed in `reject`.
    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(String, Bytes)>>,
        reject: Vec<String>,
    }

    impl OutputSink for RecordingSink {
        fn write<'a>(&'a self, file: &'a FileRecord, data: Bytes) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                if self.reject.contains(&file.relative_path) {
                    return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
                }
                self.writes.lock().push((file.relative_path.clone(), data));
                Ok(())
            })
        }
    }

    /// Sink that holds every write until a permit is released.
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        started: std::sync::atomic::AtomicUsize,
    }

    impl OutputSink for GatedSink {
        fn write<'a>(
            &'a self,
            _file: &'a FileRecord,
            _data: Bytes,
        ) -> BoxFuture<'a, io::Result<()>> {
            Box::pin(async move {
                self.started.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| io::Error::other(e.to_string()))?;
                Ok(())
            })
        }
    }

    fn sig(b: u8) -> Signature {
        Signature::new(vec![b; 20])
    }

    fn snapshot() -> Snapshot {
        let mut dir = FileRecord::regular("D", "dir", 0, sig(0));
        dir.kind = FileKind::Directory;
        Snapshot::new(
            "udid",
            1,
            "account",
            vec![
                FileRecord::regular("D", "x1", 2, sig(b'X')),
                FileRecord::regular("D", "x2", 2, sig(b'X')),
                FileRecord::regular("D", "y", 1, sig(b'Y')),
                FileRecord::regular("D", "empty", 0, sig(b'E')),
                dir,
            ],
        )
    }

    #[test]
    fn test_tracks_only_downloadable_records() {
        let tracker = CompletionTracker::new(&snapshot(), Arc::new(RecordingSink::default()));

        assert_eq!(tracker.remaining_files().len(), 3);
        assert_eq!(tracker.remaining_signatures(), HashSet::from([sig(b'X'), sig(b'Y')]));
    }

    #[tokio::test]
    async fn test_materialize_writes_all_sharing_records() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = CompletionTracker::new(&snapshot(), sink.clone());

        tracker.materialize(&sig(b'X'), Bytes::from_static(b"AA")).await;

        let mut writes = sink.writes.lock().clone();
        writes.sort();
        assert_eq!(
            writes,
            vec![
                ("x1".to_string(), Bytes::from_static(b"AA")),
                ("x2".to_string(), Bytes::from_static(b"AA")),
            ]
        );
        assert_eq!(tracker.completed().len(), 2);
        assert_eq!(tracker.remaining_signatures(), HashSet::from([sig(b'Y')]));
    }

    #[tokio::test]
    async fn test_repeat_and_unknown_signatures_are_noops() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = CompletionTracker::new(&snapshot(), sink.clone());

        tracker.materialize(&sig(b'Y'), Bytes::from_static(b"B")).await;
        tracker.materialize(&sig(b'Y'), Bytes::from_static(b"B")).await;
        tracker.materialize(&sig(b'Q'), Bytes::from_static(b"?")).await;

        assert_eq!(sink.writes.lock().len(), 1);
        assert_eq!(tracker.completed().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_returns_record_to_pending() {
        let sink = Arc::new(RecordingSink {
            reject: vec!["x2".to_string()],
            ..RecordingSink::default()
        });
        let tracker = CompletionTracker::new(&snapshot(), sink);

        tracker.materialize(&sig(b'X'), Bytes::from_static(b"AA")).await;

        let remaining = tracker.remaining_files();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|f| f.relative_path == "x2"));
        assert_eq!(tracker.write_failures().len(), 1);
        assert_eq!(tracker.completed().len(), 1);
        assert!(tracker.remaining_signatures().contains(&sig(b'X')));
        assert_eq!(tracker.tracked_files().len(), 3);
    }

    #[tokio::test]
    async fn test_record_remains_until_write_returns() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            started: std::sync::atomic::AtomicUsize::new(0),
        });
        let tracker = Arc::new(CompletionTracker::new(&snapshot(), sink.clone()));

        let writer = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tracker.materialize(&sig(b'Y'), Bytes::from_static(b"B")).await;
            })
        };
        while sink.started.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert!(tracker.remaining_files().iter().any(|f| f.relative_path == "y"));
        assert!(tracker.remaining_signatures().contains(&sig(b'Y')));
        assert_eq!(tracker.writing_files().len(), 1);
        assert!(tracker.completed().is_empty());
        let (remaining, completed) = tracker.progress();
        assert_eq!(remaining.len(), 3);
        assert!(completed.is_empty());

        sink.gate.add_permits(1);
        writer.await.unwrap();

        assert!(!tracker.remaining_files().iter().any(|f| f.relative_path == "y"));
        assert!(tracker.writing_files().is_empty());
        assert_eq!(tracker.completed().len(), 1);
    }
}
