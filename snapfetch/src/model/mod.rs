//! Data model for backups, snapshots and the chunk layout served for them.
//!
//! The types here are plain values. A [`Snapshot`] is never mutated once
//! built: each download pass derives a new snapshot by filtering the files of
//! the previous one.
//!
//! ```text
//! Backup ──► Snapshot ──► FileRecord ──► Signature
//!                                            │
//!                       ChunkListGroup ──────┘
//!                         ├── ChunkList (one storage host, ordered chunks)
//!                         └── FileChunks (signature → chunk references)
//! ```

mod chunks;
mod snapshot;

pub use chunks::{
    ChunkDescriptor, ChunkKey, ChunkList, ChunkListGroup, ChunkListId, ChunkReference,
    FileChunks, IndexedChunkList, StorageHost,
};
pub use snapshot::{Backup, FileKind, FileRecord, KeyBag, Signature, Snapshot};
