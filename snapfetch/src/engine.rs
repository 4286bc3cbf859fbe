//! Concurrent engine running one download pass.
//!
//! The engine spawns one [`Donkey`] per chunk list and bounds how many run at
//! once with a semaphore. The whole pass runs under a wall-clock deadline:
//!
//! ```text
//! execute(lists)
//!   │
//!   ├── spawn donkey per list ──► semaphore(thread_count) ──► run
//!   │     (first thread_count permit holders start stagger_delay apart)
//!   │
//!   ├── join until all done ──────────────┐
//!   │                                     ▼
//!   └── deadline expires ──► halt + detach │
//!                                         ▼
//!                       derive outcome per file ──► OutcomeSink (once)
//! ```
//!
//! On timeout the remaining donkeys are halted and detached rather than
//! aborted: a donkey that is writing finishes the write and then stops at its
//! next state check.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::HttpAgent;
use crate::crypto::{ChunkDecrypter, VerifyingDecrypter};
use crate::donkey::{ChunkFailures, Donkey, DonkeyReport, FatalSignal};
use crate::error::{DownloadError, DownloadResult};
use crate::model::{ChunkListId, FileRecord, IndexedChunkList, KeyBag};
use crate::outcome::{FailureKind, Outcome, OutcomeMap, OutcomeSink};
use crate::retry::RetryPolicy;
use crate::store::ChunkStore;
use crate::tracker::CompletionTracker;

// =============================================================================
// Engine Constants
// =============================================================================

/// Default number of chunk lists downloaded concurrently.
pub const DEFAULT_THREAD_COUNT: usize = 4;

/// Default delay between the start of the first workers (1 second).
pub const DEFAULT_STAGGER_DELAY_MS: u64 = 1000;

/// Default minimum bytes per chunk fetch (4 MiB).
pub const DEFAULT_BATCH_SIZE_MIN_BYTES: u64 = 4 * 1024 * 1024;

/// Default wall-clock budget of one pass (30 minutes).
pub const DEFAULT_PASS_TIMEOUT_SECS: u64 = 1800;

/// Default maximum number of passes over one snapshot.
pub const DEFAULT_MAX_PASSES: u32 = 8;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum donkeys running at once.
    pub thread_count: usize,
    /// Retry policy for each fetch position.
    pub retry: RetryPolicy,
    /// Start delay between the first `thread_count` donkeys.
    pub stagger_delay: Duration,
    /// Minimum served bytes per fetch.
    pub batch_size_min_bytes: u64,
    /// Wall-clock budget of one pass.
    pub pass_timeout: Duration,
    /// Passes the snapshot loop runs at most.
    pub max_passes: u32,
    /// Verify chunk checksums after decryption.
    pub verify_checksums: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            retry: RetryPolicy::default(),
            stagger_delay: Duration::from_millis(DEFAULT_STAGGER_DELAY_MS),
            batch_size_min_bytes: DEFAULT_BATCH_SIZE_MIN_BYTES,
            pass_timeout: Duration::from_secs(DEFAULT_PASS_TIMEOUT_SECS),
            max_passes: DEFAULT_MAX_PASSES,
            verify_checksums: true,
        }
    }
}

impl EngineConfig {
    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_stagger_delay(mut self, delay: Duration) -> Self {
        self.stagger_delay = delay;
        self
    }

    pub fn with_batch_size_min_bytes(mut self, bytes: u64) -> Self {
        self.batch_size_min_bytes = bytes;
        self
    }

    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes.max(1);
        self
    }

    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Wrap `inner` in a [`VerifyingDecrypter`] when checksums are verified.
    pub fn decrypter<D: ChunkDecrypter>(&self, inner: D) -> Arc<dyn ChunkDecrypter> {
        if self.verify_checksums {
            Arc::new(VerifyingDecrypter::new(inner))
        } else {
            Arc::new(inner)
        }
    }
}

/// Collaborators shared by every donkey of one pass.
#[derive(Clone)]
pub struct PassContext {
    pub agent: Arc<HttpAgent>,
    pub store: Arc<ChunkStore>,
    pub tracker: Arc<CompletionTracker>,
    pub decrypter: Arc<dyn ChunkDecrypter>,
    pub keybag: Arc<KeyBag>,
}

/// Result of a pass that finished before its deadline.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub outcomes: OutcomeMap,
    pub donkeys: Vec<DonkeyReport>,
    /// Cause of the fatal signal, if it was set.
    pub fatal_cause: Option<String>,
    pub elapsed: Duration,
}

impl PassReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    /// Retries across all chunk lists.
    pub fn total_retries(&self) -> u32 {
        self.donkeys.iter().map(|d| d.retries).sum()
    }
}

/// Runs the donkeys of one pass.
#[derive(Debug, Clone, Default)]
pub struct ConcurrentEngine {
    config: EngineConfig,
}

impl ConcurrentEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Download every chunk list and report one outcome per tracked file.
    ///
    /// # Returns
    ///
    /// The pass report, or [`DownloadError::Timeout`] if the deadline expired.
    /// Outcomes are reported to `sink` in both cases.
    #[instrument(skip_all, fields(lists = lists.len()))]
    pub async fn execute(
        &self,
        ctx: &PassContext,
        sink: &dyn OutcomeSink,
        lists: Vec<IndexedChunkList>,
    ) -> DownloadResult<PassReport> {
        let started = Instant::now();
        let deadline = started + self.config.pass_timeout;
        let thread_count = self.config.thread_count.max(1);

        let fatal = Arc::new(FatalSignal::new());
        let halt = CancellationToken::new();
        let failures = ChunkFailures::default();
        let semaphore = Arc::new(Semaphore::new(thread_count));

        info!(threads = thread_count, "Starting download pass");

        // Start slots are handed out in permit order, so only the first
        // `thread_count` donkeys to run are staggered.
        let start_slots = Arc::new(AtomicUsize::new(0));
        let stagger_delay = self.config.stagger_delay;

        let mut donkeys = JoinSet::new();
        for list in lists {
            let donkey = Donkey::new(list, ctx.clone(), Arc::clone(&fatal), halt.clone())
                .with_retry_policy(self.config.retry.clone())
                .with_batch_size_min_bytes(self.config.batch_size_min_bytes)
                .with_failures(Arc::clone(&failures));
            let semaphore = Arc::clone(&semaphore);
            let start_slots = Arc::clone(&start_slots);
            let halt = halt.clone();

            donkeys.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return donkey.halted();
                };
                let slot = start_slots.fetch_add(1, Ordering::SeqCst);
                if slot < thread_count && !stagger_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(stagger_delay * slot as u32) => {}
                        _ = halt.cancelled() => {}
                    }
                }
                donkey.run().await
            });
        }

        let mut reports = Vec::new();
        let mut timed_out = false;
        loop {
            tokio::select! {
                biased;

                result = donkeys.join_next() => match result {
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(e)) => warn!(error = %e, "Donkey task failed"),
                    None => break,
                },

                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            halt.cancel();
            warn!(
                outstanding = donkeys.len(),
                timeout_secs = self.config.pass_timeout.as_secs(),
                "Download pass timed out, detaching remaining chunk lists"
            );
            donkeys.detach_all();
        }

        let outcomes = derive_outcomes(ctx, &reports, &failures, timed_out);
        sink.report(&outcomes);

        let elapsed = started.elapsed();
        let succeeded = outcomes.values().filter(|o| o.is_success()).count();
        info!(
            succeeded,
            failed = outcomes.len() - succeeded,
            elapsed_ms = elapsed.as_millis() as u64,
            timed_out,
            "Download pass finished"
        );

        if timed_out {
            return Err(DownloadError::Timeout { elapsed });
        }

        Ok(PassReport {
            outcomes,
            donkeys: reports,
            fatal_cause: fatal.cause().map(str::to_string),
            elapsed,
        })
    }
}

/// Classify every tracked file.
///
/// Precedence: written, write rejected, a chunk failed to decrypt, an owning
/// chunk list failed on the network, the pass timed out, otherwise abandoned.
fn derive_outcomes(
    ctx: &PassContext,
    reports: &[DonkeyReport],
    failures: &ChunkFailures,
    timed_out: bool,
) -> OutcomeMap {
    let failed_lists: HashSet<ChunkListId> = reports
        .iter()
        .filter(|r| r.aborted_on_network())
        .map(|r| r.list)
        .collect();
    let completed = ctx.tracker.completed();
    let write_failures = ctx.tracker.write_failures();

    let classify = |file: &FileRecord| -> Outcome {
        if completed.contains(file) {
            return Outcome::Success;
        }
        if write_failures.contains(file) {
            return Outcome::Failed(FailureKind::Output);
        }
        let dependencies = file
            .signature
            .as_ref()
            .and_then(|s| ctx.store.dependencies(s))
            .unwrap_or(&[]);
        if dependencies.iter().any(|k| failures.contains_key(k)) {
            Outcome::Failed(FailureKind::Decrypt)
        } else if dependencies.iter().any(|k| failed_lists.contains(&k.list)) {
            Outcome::Failed(FailureKind::Network)
        } else if timed_out {
            Outcome::Failed(FailureKind::Timeout)
        } else {
            Outcome::Failed(FailureKind::Abandoned)
        }
    };

    let outcomes: OutcomeMap = ctx
        .tracker
        .tracked_files()
        .into_iter()
        .map(|file| {
            let outcome = classify(&file);
            (file, outcome)
        })
        .collect();

    debug!(files = outcomes.len(), "Outcomes derived");
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughDecrypter;
    use crate::error::TransportError;
    use crate::outcome::OutcomeLedger;
    use crate::testutil::{pass_context, GroupBuilder, ScriptedTransport};

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_stagger_delay(Duration::ZERO)
            .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(1)))
            .with_batch_size_min_bytes(0)
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.stagger_delay, Duration::from_secs(1));
        assert_eq!(config.batch_size_min_bytes, 4_194_304);
        assert_eq!(config.pass_timeout, Duration::from_secs(1800));
        assert!(config.verify_checksums);
    }

    #[tokio::test]
    async fn test_pass_materializes_shared_signature_once() {
        // X = "A" (list 0) + "A" (list 1), shared by two files; Y = "B".
        let mut group = GroupBuilder::new();
        let first = group.list("L0", &[b"A", b"B"]);
        let second = group.list("L1", &[b"A"]);
        group.file(b'X', &[(first, 0), (second, 0)]);
        group.file(b'Y', &[(first, 1)]);
        let transport = ScriptedTransport::new(vec![group.build()]);

        let ctx = pass_context(transport, &[b'X', b'X', b'Y'], PassthroughDecrypter);
        let ledger = OutcomeLedger::new();
        let report = ConcurrentEngine::new(fast_config())
            .execute(&ctx.pass, &ledger, ctx.lists())
            .await
            .unwrap();

        assert_eq!(report.success_count(), 3);
        assert_eq!(ledger.report_count(), 1);
        assert!(ctx.pass.tracker.remaining_files().is_empty());
        for (_, data) in ctx.sink.writes() {
            assert!(&data[..] == b"AA" || &data[..] == b"B");
        }
        assert_eq!(ctx.sink.writes().len(), 3);
    }

    #[tokio::test]
    async fn test_outcome_attribution() {
        let mut group = GroupBuilder::new();
        let good = group.list("good", &[b"ok"]);
        let broken = group.list("broken", &[b"no"]);
        group.file(1, &[(good, 0)]);
        group.file(2, &[(broken, 0)]);
        let transport = ScriptedTransport::new(vec![group.build()]);
        transport.fail_next(
            "broken",
            TransportError::Http {
                status: 404,
                message: "gone".to_string(),
            },
        );

        let ctx = pass_context(transport, &[1, 2], PassthroughDecrypter);
        let ledger = OutcomeLedger::new();
        let report = ConcurrentEngine::new(fast_config())
            .execute(&ctx.pass, &ledger, ctx.lists())
            .await
            .unwrap();

        let by_path = |path: &str| {
            report
                .outcomes
                .iter()
                .find(|(f, _)| f.relative_path == path)
                .map(|(_, o)| *o)
        };
        assert_eq!(by_path("f1"), Some(Outcome::Success));
        assert_eq!(by_path("f2"), Some(Outcome::Failed(FailureKind::Network)));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut group = GroupBuilder::new();
        for i in 0..8u8 {
            let list = group.list(&format!("L{}", i), &[b"z"]);
            group.file(i + 1, &[(list, 0)]);
        }
        let transport = ScriptedTransport::new(vec![group.build()]);
        transport.delay_all(Duration::from_millis(20));

        let ids: Vec<u8> = (1..=8).collect();
        let ctx = pass_context(transport.clone(), &ids, PassthroughDecrypter);
        let report = ConcurrentEngine::new(fast_config().with_thread_count(2))
            .execute(&ctx.pass, &|_: &OutcomeMap| {}, ctx.lists())
            .await
            .unwrap();

        assert_eq!(report.success_count(), 8);
        assert!(transport.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_first_workers_start_staggered() {
        let mut group = GroupBuilder::new();
        for i in 0..4u8 {
            let list = group.list(&format!("L{}", i), &[b"z"]);
            group.file(i + 1, &[(list, 0)]);
        }
        let transport = ScriptedTransport::new(vec![group.build()]);
        transport.delay_all(Duration::from_millis(50));

        let ctx = pass_context(transport.clone(), &[1, 2, 3, 4], PassthroughDecrypter);
        let config = fast_config()
            .with_thread_count(2)
            .with_stagger_delay(Duration::from_millis(500));
        let started = Instant::now();
        let report = ConcurrentEngine::new(config)
            .execute(&ctx.pass, &|_: &OutcomeMap| {}, ctx.lists())
            .await
            .unwrap();

        // The second slot waits out the stagger while the first slot's permit
        // serves the remaining lists one at a time.
        assert_eq!(report.success_count(), 4);
        assert_eq!(transport.max_in_flight(), 1);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_timeout_reports_and_errors() {
        let mut group = GroupBuilder::new();
        let fast = group.list("fast", &[b"f"]);
        let slow = group.list("slow", &[b"s"]);
        group.file(1, &[(fast, 0)]);
        group.file(2, &[(slow, 0)]);
        let transport = ScriptedTransport::new(vec![group.build()]);
        transport.delay("slow", Duration::from_secs(30));

        let ctx = pass_context(transport, &[1, 2], PassthroughDecrypter);
        let ledger = OutcomeLedger::new();
        let config = fast_config().with_pass_timeout(Duration::from_millis(200));
        let result = ConcurrentEngine::new(config)
            .execute(&ctx.pass, &ledger, ctx.lists())
            .await;

        assert!(matches!(result, Err(DownloadError::Timeout { .. })));
        assert_eq!(ledger.report_count(), 1);
        let outcomes = ledger.latest();
        let slow_outcome = outcomes
            .iter()
            .find(|(f, _)| f.relative_path == "f2")
            .map(|(_, o)| *o);
        assert_eq!(slow_outcome, Some(Outcome::Failed(FailureKind::Timeout)));
        assert_eq!(ledger.success_count(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_stops_pass() {
        let mut group = GroupBuilder::new();
        let list = group.list("L", &[b"a", b"b", b"c"]);
        group.file(1, &[(list, 0), (list, 1), (list, 2)]);
        let transport = ScriptedTransport::new(vec![group.build()]);
        transport.revoke_after(1);

        let ctx = pass_context(transport.clone(), &[1], PassthroughDecrypter);
        let report = ConcurrentEngine::new(fast_config())
            .execute(&ctx.pass, &|_: &OutcomeMap| {}, ctx.lists())
            .await
            .unwrap();

        assert!(report.fatal_cause.is_some());
        assert_eq!(report.failure_count(), 1);
        // One successful fetch, one rejected, then no more.
        assert_eq!(transport.fetch_count("L"), 2);
    }
}
