//! Content-addressed chunk store.
//!
//! The [`ChunkStore`] assembles signature payloads from decrypted chunks. It
//! is built from the chunk-list groups of one resolution and lives for one
//! engine pass.
//!
//! # Concurrency
//!
//! The set of signatures is fixed at construction, so the outer map is never
//! written after `new` and needs no lock. Each signature owns its own mutex:
//! writers targeting different signatures never contend, writers targeting
//! the same signature are serialized.
//!
//! ```text
//! apply(key, bytes)
//!     │
//!     ▼
//! chunk index: key ──► [(signature, position), ...]
//!     │
//!     ▼ per signature (locked)
//! Assembling { parts, outstanding } ──(last part)──► Resolved { payload }
//! ```

use std::collections::{HashMap, HashSet};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::model::{ChunkKey, ChunkListGroup, Signature};

/// Result of writing one chunk to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkWrite {
    /// No signature was completed by this write. Also returned for chunks
    /// that are not outstanding (unknown or already written).
    Incomplete,
    /// These signatures received their last missing chunk.
    Resolved(Vec<Signature>),
}

#[derive(Debug)]
enum EntryState {
    Assembling {
        parts: Vec<Option<Bytes>>,
        outstanding: usize,
    },
    Resolved {
        payload: Option<Bytes>,
    },
}

#[derive(Debug)]
struct SignatureEntry {
    references: Vec<ChunkKey>,
    state: Mutex<EntryState>,
}

impl SignatureEntry {
    fn new(references: Vec<ChunkKey>) -> Self {
        let outstanding = references.len();
        Self {
            state: Mutex::new(EntryState::Assembling {
                parts: vec![None; outstanding],
                outstanding,
            }),
            references,
        }
    }

    /// Write `data` at the given positions. Returns true if this write
    /// completed the signature.
    fn write(&self, positions: &[usize], data: &Bytes) -> bool {
        let mut state = self.state.lock();
        let EntryState::Assembling { parts, outstanding } = &mut *state else {
            return false;
        };

        for &position in positions {
            if parts[position].is_none() {
                parts[position] = Some(data.clone());
                *outstanding -= 1;
            }
        }

        if *outstanding > 0 {
            return false;
        }

        let total = parts.iter().flatten().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total);
        for part in parts.iter().flatten() {
            payload.extend_from_slice(part);
        }
        *state = EntryState::Resolved {
            payload: Some(payload.freeze()),
        };
        true
    }

    fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), EntryState::Resolved { .. })
    }
}

/// Content-addressed buffer manager for one engine pass.
#[derive(Debug)]
pub struct ChunkStore {
    entries: HashMap<Signature, SignatureEntry>,
    /// For every chunk, the signatures and positions it fills.
    index: HashMap<ChunkKey, Vec<(Signature, usize)>>,
}

impl ChunkStore {
    /// Build a store covering every signature of `groups`.
    ///
    /// Signatures without chunk references are skipped. A signature listed
    /// by more than one group keeps its first definition.
    pub fn new(groups: &[ChunkListGroup]) -> Self {
        let mut entries = HashMap::new();
        let mut index: HashMap<ChunkKey, Vec<(Signature, usize)>> = HashMap::new();

        for (group_index, group) in groups.iter().enumerate() {
            for file in &group.files {
                if file.chunks.is_empty() {
                    warn!(signature = %file.signature, "Signature has no chunks, skipping");
                    continue;
                }
                if entries.contains_key(&file.signature) {
                    warn!(signature = %file.signature, "Signature listed twice, keeping first");
                    continue;
                }

                let references: Vec<ChunkKey> = file
                    .chunks
                    .iter()
                    .map(|r| ChunkKey::new(group_index, r.container_index, r.chunk_index))
                    .collect();

                for (position, key) in references.iter().enumerate() {
                    index
                        .entry(*key)
                        .or_default()
                        .push((file.signature.clone(), position));
                }

                entries.insert(file.signature.clone(), SignatureEntry::new(references));
            }
        }

        Self { entries, index }
    }

    /// Signatures whose payload is not yet complete.
    pub fn remaining_signatures(&self) -> HashSet<Signature> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_resolved())
            .map(|(signature, _)| signature.clone())
            .collect()
    }

    /// Whether the store tracks `signature` at all.
    pub fn contains(&self, signature: &Signature) -> bool {
        self.entries.contains_key(signature)
    }

    /// Chunks composing `signature`, in payload order.
    pub fn dependencies(&self, signature: &Signature) -> Option<&[ChunkKey]> {
        self.entries.get(signature).map(|e| e.references.as_slice())
    }

    /// Write one decrypted chunk.
    ///
    /// Writing a chunk that no signature is waiting for is a no-op, so late
    /// or duplicate deliveries after a retry are harmless.
    pub fn apply(&self, key: ChunkKey, data: Bytes) -> ChunkWrite {
        let Some(targets) = self.index.get(&key) else {
            trace!(?key, "Chunk not referenced by any signature");
            return ChunkWrite::Incomplete;
        };

        // Group positions per signature so each entry is locked once.
        let mut per_signature: Vec<(&Signature, Vec<usize>)> = Vec::new();
        for (signature, position) in targets {
            match per_signature.iter_mut().find(|(s, _)| *s == signature) {
                Some((_, positions)) => positions.push(*position),
                None => per_signature.push((signature, vec![*position])),
            }
        }

        let mut resolved = Vec::new();
        for (signature, positions) in per_signature {
            let Some(entry) = self.entries.get(signature) else {
                continue;
            };
            if entry.write(&positions, &data) {
                resolved.push(signature.clone());
            }
        }

        if resolved.is_empty() {
            ChunkWrite::Incomplete
        } else {
            ChunkWrite::Resolved(resolved)
        }
    }

    /// Take the payload of a resolved signature.
    ///
    /// The payload is handed out once; later calls return `None`. The
    /// signature stays resolved.
    pub fn take_payload(&self, signature: &Signature) -> Option<Bytes> {
        let entry = self.entries.get(signature)?;
        let mut state = entry.state.lock();
        match &mut *state {
            EntryState::Resolved { payload } => payload.take(),
            EntryState::Assembling { .. } => None,
        }
    }
}
