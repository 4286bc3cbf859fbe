//! Per-file outcomes of an engine pass.
//!
//! Every pass reports exactly one [`OutcomeMap`] to an [`OutcomeSink`]. Any
//! `Fn(&OutcomeMap)` closure is a sink; [`OutcomeLedger`] collects the
//! mappings of every pass for later inspection.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::model::FileRecord;

/// Why a file was not materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The owning chunk list exhausted its retries or hit a permanent error.
    Network,
    /// One of the file's chunks could not be decrypted.
    Decrypt,
    /// The pass deadline expired before the file completed.
    Timeout,
    /// The pass ended without the file completing for any other reason.
    Abandoned,
    /// The output sink rejected the write.
    Output,
    /// The server offered no chunks for the file's signature.
    Unavailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Decrypt => "decrypt",
            Self::Timeout => "timeout",
            Self::Abandoned => "abandoned",
            Self::Output => "output",
            Self::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Terminal classification of one file in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failed(FailureKind),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Outcomes of one pass, keyed by file.
pub type OutcomeMap = HashMap<FileRecord, Outcome>;

/// Receives the outcome mapping of each pass.
///
/// Called exactly once for every pass that resolved its chunk lists. Files
/// dropped before the pass started (no chunks offered) appear in that pass's
/// mapping as `Failed(Unavailable)`.
pub trait OutcomeSink: Send + Sync {
    fn report(&self, outcomes: &OutcomeMap);
}

impl<F> OutcomeSink for F
where
    F: Fn(&OutcomeMap) + Send + Sync,
{
    fn report(&self, outcomes: &OutcomeMap) {
        self(outcomes)
    }
}

/// Outcome sink that keeps every reported mapping.
#[derive(Debug, Default)]
pub struct OutcomeLedger {
    passes: Mutex<Vec<OutcomeMap>>,
}

impl OutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mappings reported so far.
    pub fn report_count(&self) -> usize {
        self.passes.lock().len()
    }

    /// All reported mappings, in report order.
    pub fn passes(&self) -> Vec<OutcomeMap> {
        self.passes.lock().clone()
    }

    /// Latest outcome of every file seen in any report.
    pub fn latest(&self) -> OutcomeMap {
        let passes = self.passes.lock();
        let mut latest = OutcomeMap::new();
        for pass in passes.iter() {
            latest.extend(pass.iter().map(|(file, outcome)| (file.clone(), *outcome)));
        }
        latest
    }

    /// Files whose latest outcome is success.
    pub fn success_count(&self) -> usize {
        self.latest().values().filter(|o| o.is_success()).count()
    }

    /// Files whose latest outcome is a failure.
    pub fn failure_count(&self) -> usize {
        self.latest().values().filter(|o| !o.is_success()).count()
    }
}

impl OutcomeSink for OutcomeLedger {
    fn report(&self, outcomes: &OutcomeMap) {
        self.passes.lock().push(outcomes.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Signature;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn file(path: &str) -> FileRecord {
        FileRecord::regular("HomeDomain", path, 1, Signature::new(path.as_bytes().to_vec()))
    }

    #[test]
    fn test_closure_is_a_sink() {
        let seen = AtomicUsize::new(0);
        let sink = |outcomes: &OutcomeMap| {
            seen.fetch_add(outcomes.len(), Ordering::SeqCst);
        };

        let mut outcomes = OutcomeMap::new();
        outcomes.insert(file("a"), Outcome::Success);
        outcomes.insert(file("b"), Outcome::Failed(FailureKind::Network));
        sink.report(&outcomes);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ledger_keeps_latest_outcome() {
        let ledger = OutcomeLedger::new();

        let mut first = OutcomeMap::new();
        first.insert(file("a"), Outcome::Failed(FailureKind::Timeout));
        first.insert(file("b"), Outcome::Success);
        ledger.report(&first);

        let mut second = OutcomeMap::new();
        second.insert(file("a"), Outcome::Success);
        ledger.report(&second);

        assert_eq!(ledger.report_count(), 2);
        assert_eq!(ledger.success_count(), 2);
        assert_eq!(ledger.failure_count(), 0);
        assert_eq!(ledger.latest()[&file("a")], Outcome::Success);
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Unavailable.to_string(), "unavailable");
        assert_eq!(FailureKind::Decrypt.to_string(), "decrypt");
    }
}
