//! Backup, snapshot and file record types.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Content hash identifying a unique plaintext payload.
///
/// Two file records with equal signatures have byte-identical content, so one
/// reconstruction satisfies both.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(Bytes);

impl Signature {
    /// Create a signature from raw hash bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering, used in logs.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Key material used to decrypt a backup's chunk ciphertext.
///
/// The bytes are opaque to the download core; only the decryption capability
/// interprets them.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBag {
    uuid: String,
    data: Bytes,
}

impl KeyBag {
    /// Create a keybag.
    pub fn new(uuid: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            data: data.into(),
        }
    }

    /// Keybag identifier.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Raw keybag bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl fmt::Debug for KeyBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBag")
            .field("uuid", &self.uuid)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A remote backup: identity, keybag and the snapshots it holds.
#[derive(Debug, Clone)]
pub struct Backup {
    udid: String,
    keybag: Arc<KeyBag>,
    snapshots: Vec<u32>,
}

impl Backup {
    /// Create a backup from already-acquired parts.
    pub fn new(udid: impl Into<String>, keybag: KeyBag, snapshots: Vec<u32>) -> Self {
        Self {
            udid: udid.into(),
            keybag: Arc::new(keybag),
            snapshots,
        }
    }

    /// Device UDID string identifying the backup.
    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Keybag shared with the decryption capability.
    pub fn keybag(&self) -> &Arc<KeyBag> {
        &self.keybag
    }

    /// Snapshot ids in download order.
    pub fn snapshots(&self) -> &[u32] {
        &self.snapshots
    }
}

/// Kind of filesystem entry a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// One file entry of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRecord {
    /// Backup domain the file belongs to (e.g. `HomeDomain`).
    pub domain: String,
    /// Path relative to the domain root.
    pub relative_path: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Content signature; absent for entries without content.
    pub signature: Option<Signature>,
    pub kind: FileKind,
    /// Unix permission bits, when known.
    pub mode: Option<u32>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Create a regular file record.
    pub fn regular(
        domain: impl Into<String>,
        relative_path: impl Into<String>,
        size: u64,
        signature: Signature,
    ) -> Self {
        Self {
            domain: domain.into(),
            relative_path: relative_path.into(),
            size,
            signature: Some(signature),
            kind: FileKind::Regular,
            mode: None,
            last_modified: None,
        }
    }

    /// Set the modification timestamp.
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Whether the record has content that must be fetched from the server.
    ///
    /// Directories, symlinks, zero-byte files and records without a
    /// signature are never requested.
    pub fn is_downloadable(&self) -> bool {
        self.kind == FileKind::Regular && self.size > 0 && self.signature.is_some()
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.relative_path)
    }
}

/// A snapshot of a backup restricted to a set of file records.
///
/// Snapshots are values: [`Snapshot::filter`] and [`Snapshot::retain_files`]
/// return new snapshots and leave `self` untouched.
#[derive(Debug, Clone)]
pub struct Snapshot {
    backup_udid: String,
    snapshot_id: u32,
    account_id: String,
    files: Arc<[FileRecord]>,
}

impl Snapshot {
    /// Create a snapshot.
    pub fn new(
        backup_udid: impl Into<String>,
        snapshot_id: u32,
        account_id: impl Into<String>,
        files: Vec<FileRecord>,
    ) -> Self {
        Self {
            backup_udid: backup_udid.into(),
            snapshot_id,
            account_id: account_id.into(),
            files: files.into(),
        }
    }

    pub fn backup_udid(&self) -> &str {
        &self.backup_udid
    }

    pub fn snapshot_id(&self) -> u32 {
        self.snapshot_id
    }

    /// Owning account identifier.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Distinct signatures of the downloadable files.
    pub fn signatures(&self) -> HashSet<Signature> {
        self.files
            .iter()
            .filter(|f| f.is_downloadable())
            .filter_map(|f| f.signature.clone())
            .collect()
    }

    /// Derive a snapshot holding only the files matching `predicate`.
    pub fn filter(&self, predicate: impl Fn(&FileRecord) -> bool) -> Snapshot {
        let files: Vec<FileRecord> = self.files.iter().filter(|f| predicate(f)).cloned().collect();
        Snapshot {
            backup_udid: self.backup_udid.clone(),
            snapshot_id: self.snapshot_id,
            account_id: self.account_id.clone(),
            files: files.into(),
        }
    }

    /// Derive a snapshot holding only the files present in `keep`.
    pub fn retain_files(&self, keep: &HashSet<FileRecord>) -> Snapshot {
        self.filter(|f| keep.contains(f))
    }
}
