//! Keybag acquisition and per-backup download.

use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::HttpAgent;
use crate::error::{DownloadError, DownloadResult};
use crate::model::{Backup, Snapshot};
use crate::outcome::OutcomeSink;

use super::snapshot::{SnapshotDownloader, SnapshotSummary};

impl Backup {
    /// Fetch the keybag of backup `udid` and build the backup.
    pub async fn acquire(
        agent: &HttpAgent,
        udid: impl Into<String>,
        snapshots: Vec<u32>,
    ) -> DownloadResult<Backup> {
        let udid = udid.into();
        let keybag = agent
            .execute(|transport, token| {
                let udid = udid.as_str();
                async move { transport.keybag(&token, udid).await }
            })
            .await
            .map_err(|source| DownloadError::KeyBag {
                udid: udid.clone(),
                source,
            })?;

        info!(udid = %udid, keybag = keybag.uuid(), snapshots = snapshots.len(), "Keybag acquired");
        Ok(Backup::new(udid, keybag, snapshots))
    }
}

/// Downloads the snapshots of one backup in order.
pub struct BackupDownloader {
    snapshots: SnapshotDownloader,
}

impl BackupDownloader {
    pub fn new(snapshots: SnapshotDownloader) -> Self {
        Self { snapshots }
    }

    /// Download `snapshots` in the order the backup lists their ids.
    ///
    /// Ids with no supplied snapshot are skipped, as are snapshots the backup
    /// does not list. Stops early once authentication is lost.
    pub async fn download(
        &self,
        agent: &Arc<HttpAgent>,
        backup: &Backup,
        mut snapshots: Vec<Snapshot>,
        outcomes: &dyn OutcomeSink,
    ) -> DownloadResult<Vec<SnapshotSummary>> {
        for snapshot in &snapshots {
            if !backup.snapshots().contains(&snapshot.snapshot_id()) {
                warn!(
                    udid = backup.udid(),
                    snapshot = snapshot.snapshot_id(),
                    "Snapshot not listed by backup, skipping"
                );
            }
        }

        let mut summaries = Vec::new();
        for id in backup.snapshots() {
            if agent.authenticator_is_invalid() {
                warn!(udid = backup.udid(), "Authentication lost, stopping backup download");
                break;
            }
            let Some(index) = snapshots.iter().position(|s| s.snapshot_id() == *id) else {
                continue;
            };
            let snapshot = snapshots.swap_remove(index);
            summaries.push(self.snapshots.download(agent, backup, snapshot, outcomes).await?);
        }

        Ok(summaries)
    }
}
