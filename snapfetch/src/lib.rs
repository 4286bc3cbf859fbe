//! snapfetch - restores encrypted, chunk-addressed backup snapshots
//!
//! A snapshot is a list of file records. Each record points at a content
//! signature, and each signature is assembled from chunks served by storage
//! hosts. Identical content is downloaded once and written to every record
//! that shares it.
//!
//! # Architecture
//!
//! ```text
//! BackupDownloader
//!   └── SnapshotDownloader      repeat passes until nothing is left
//!         └── ConcurrentEngine  one pass: bounded donkeys + deadline
//!               └── Donkey      per chunk list: fetch ⇄ write
//!                     ├── ChunkStore         chunks → signature payloads
//!                     └── CompletionTracker  payloads → output files
//! ```
//!
//! The wire protocol, authentication handshake and cipher primitives are
//! supplied by the caller through [`agent::Transport`],
//! [`agent::Authenticator`] and [`crypto::ChunkDecrypter`].

pub mod agent;
pub mod config;
pub mod crypto;
pub mod donkey;
pub mod download;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod outcome;
pub mod output;
pub mod retry;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod testutil;

pub use agent::{AuthToken, Authenticator, HttpAgent, Transport};
pub use config::ConfigFile;
pub use download::{BackupDownloader, SnapshotDownloader, SnapshotSummary, StopReason};
pub use engine::{ConcurrentEngine, EngineConfig, PassContext, PassReport};
pub use error::{DecryptError, DownloadError, DownloadResult, TransportError};
pub use outcome::{FailureKind, Outcome, OutcomeLedger, OutcomeMap, OutcomeSink};
pub use output::{DirectorySink, OutputSink};
