//! Snapshot and backup download loops.
//!
//! - [`SnapshotDownloader`] repeats engine passes over one snapshot until
//!   every requested file is written, no progress is made, or authentication
//!   is lost.
//! - [`BackupDownloader`] runs the snapshot loop over a backup's snapshots.

mod backup;
mod snapshot;

pub use backup::BackupDownloader;
pub use snapshot::{SnapshotDownloader, SnapshotSummary, StopReason};
