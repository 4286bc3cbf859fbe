//! Outer retry loop over one snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::agent::HttpAgent;
use crate::config::ConfigFile;
use crate::crypto::ChunkDecrypter;
use crate::engine::{ConcurrentEngine, EngineConfig, PassContext};
use crate::error::{DownloadError, DownloadResult};
use crate::model::{Backup, FileRecord, IndexedChunkList, Snapshot};
use crate::outcome::{FailureKind, Outcome, OutcomeMap, OutcomeSink};
use crate::output::{DirectorySink, OutputSink};
use crate::store::ChunkStore;
use crate::tracker::CompletionTracker;

/// Why the snapshot loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No requestable file is left.
    Complete,
    /// The authenticator became permanently invalid.
    AuthInvalidated,
    /// The pass limit was reached.
    MaxPasses,
    /// A full pass finished without writing any file.
    NoProgress,
}

/// Result of downloading one snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub snapshot_id: u32,
    /// Downloadable files at the start.
    pub requested: usize,
    /// Files written.
    pub completed: usize,
    /// Files the server offered no chunks for.
    pub unavailable: Vec<FileRecord>,
    /// Files still missing when the loop stopped.
    pub remaining: Vec<FileRecord>,
    pub passes: u32,
    pub timeouts: u32,
    /// Fetch retries across all passes that finished in time.
    pub retries: u32,
    /// Remaining file count after each pass.
    pub remaining_history: Vec<usize>,
    pub stop: StopReason,
}

impl SnapshotSummary {
    fn new(snapshot_id: u32, requested: usize) -> Self {
        Self {
            snapshot_id,
            requested,
            completed: 0,
            unavailable: Vec::new(),
            remaining: Vec::new(),
            passes: 0,
            timeouts: 0,
            retries: 0,
            remaining_history: Vec::new(),
            stop: StopReason::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Downloads one snapshot in repeated passes.
pub struct SnapshotDownloader {
    engine: ConcurrentEngine,
    decrypter: Arc<dyn ChunkDecrypter>,
    sink: Arc<dyn OutputSink>,
}

impl SnapshotDownloader {
    pub fn new(
        config: EngineConfig,
        decrypter: Arc<dyn ChunkDecrypter>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            engine: ConcurrentEngine::new(config),
            decrypter,
            sink,
        }
    }

    /// Downloader writing backup `udid` to the configured output directory.
    pub fn from_config<D: ChunkDecrypter>(config: &ConfigFile, decrypter: D, udid: &str) -> Self {
        let sink = DirectorySink::from_config(&config.output, udid);
        Self::new(
            config.engine.clone(),
            config.engine.decrypter(decrypter),
            Arc::new(sink),
        )
    }

    pub fn engine_config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// Download `snapshot` until nothing is left or the loop has to stop.
    ///
    /// Loss of authentication ends the loop with `Ok`; the summary lists the
    /// files still missing. A failed resolution with valid authentication is
    /// returned as [`DownloadError::Resolution`].
    #[instrument(skip_all, fields(udid = backup.udid(), snapshot = snapshot.snapshot_id()))]
    pub async fn download(
        &self,
        agent: &Arc<HttpAgent>,
        backup: &Backup,
        snapshot: Snapshot,
        outcomes: &dyn OutcomeSink,
    ) -> DownloadResult<SnapshotSummary> {
        let max_passes = self.engine.config().max_passes;
        let mut current = snapshot.filter(FileRecord::is_downloadable);
        let mut summary = SnapshotSummary::new(current.snapshot_id(), current.file_count());

        let stop = loop {
            if current.is_empty() {
                break StopReason::Complete;
            }
            if agent.authenticator_is_invalid() {
                break StopReason::AuthInvalidated;
            }
            if summary.passes >= max_passes {
                break StopReason::MaxPasses;
            }
            summary.passes += 1;

            info!(
                pass = summary.passes,
                files = current.file_count(),
                "Resolving chunk lists"
            );
            let requested = &current;
            let groups = match agent
                .execute(|transport, token| async move {
                    transport.file_groups(&token, backup, requested).await
                })
                .await
            {
                Ok(groups) => groups,
                Err(e) if agent.authenticator_is_invalid() => {
                    warn!(error = %e, "Resolution failed after authentication loss");
                    break StopReason::AuthInvalidated;
                }
                Err(source) => {
                    return Err(DownloadError::Resolution {
                        udid: backup.udid().to_string(),
                        source,
                    });
                }
            };

            let store = ChunkStore::new(&groups);
            let mut unavailable_outcomes = OutcomeMap::new();
            let unavailable: Vec<FileRecord> = current
                .files()
                .iter()
                .filter(|f| f.signature.as_ref().map_or(true, |s| !store.contains(s)))
                .cloned()
                .collect();
            if !unavailable.is_empty() {
                warn!(
                    files = unavailable.len(),
                    "Server offered no chunks for some files, dropping them"
                );
                unavailable_outcomes = unavailable
                    .iter()
                    .map(|f| (f.clone(), Outcome::Failed(FailureKind::Unavailable)))
                    .collect();
                let dropped: HashSet<&FileRecord> = unavailable.iter().collect();
                current = current.filter(|f| !dropped.contains(f));
                summary.unavailable.extend(unavailable);
            }
            if current.is_empty() {
                outcomes.report(&unavailable_outcomes);
                summary.remaining_history.push(0);
                continue;
            }
            let pass_outcomes = MergedOutcomes {
                inner: outcomes,
                extra: unavailable_outcomes,
            };

            let before = current.file_count();
            let tracker = Arc::new(CompletionTracker::new(&current, Arc::clone(&self.sink)));
            let ctx = PassContext {
                agent: Arc::clone(agent),
                store: Arc::new(store),
                tracker: Arc::clone(&tracker),
                decrypter: Arc::clone(&self.decrypter),
                keybag: Arc::clone(backup.keybag()),
            };

            let timed_out = match self
                .engine
                .execute(&ctx, &pass_outcomes, IndexedChunkList::flatten(&groups))
                .await
            {
                Ok(report) => {
                    summary.retries += report.total_retries();
                    false
                }
                Err(DownloadError::Timeout { elapsed }) => {
                    warn!(
                        pass = summary.passes,
                        elapsed_secs = elapsed.as_secs(),
                        "Pass timed out, retrying remaining files"
                    );
                    summary.timeouts += 1;
                    true
                }
                Err(e) => return Err(e),
            };

            let (remaining, completed) = tracker.progress();
            current = current.retain_files(&remaining);
            let after = current.file_count();
            let written = completed.len();
            summary.completed += written;
            summary.remaining_history.push(after);

            info!(
                pass = summary.passes,
                written,
                in_flight = tracker.writing_files().len(),
                remaining = after,
                "Pass complete"
            );

            if after > 0 && after == before && !timed_out && !agent.authenticator_is_invalid() {
                warn!(remaining = after, "Pass made no progress, giving up");
                break StopReason::NoProgress;
            }
        };

        summary.remaining = current.files().to_vec();
        summary.stop = stop;

        info!(
            completed = summary.completed,
            remaining = summary.remaining.len(),
            unavailable = summary.unavailable.len(),
            passes = summary.passes,
            stop = ?stop,
            "Snapshot download finished"
        );

        Ok(summary)
    }
}

/// Adds the files dropped before a pass to the outcomes the pass reports,
/// so the caller still sees one mapping per pass.
struct MergedOutcomes<'a> {
    inner: &'a dyn OutcomeSink,
    extra: OutcomeMap,
}

impl OutcomeSink for MergedOutcomes<'_> {
    fn report(&self, outcomes: &OutcomeMap) {
        if self.extra.is_empty() {
            self.inner.report(outcomes);
        } else {
            let mut merged = self.extra.clone();
            merged.extend(outcomes.iter().map(|(file, outcome)| (file.clone(), *outcome)));
            self.inner.report(&merged);
        }
    }
}
