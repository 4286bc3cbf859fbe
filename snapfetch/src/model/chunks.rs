//! Chunk layout types returned by chunk-list resolution.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;

use super::Signature;

/// Storage host serving one chunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHost {
    pub hostname: String,
    pub port: u16,
    pub scheme: String,
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl StorageHost {
    /// Host with an HTTPS GET on the given uri and no extra headers.
    pub fn new(hostname: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: 443,
            scheme: "https".to_string(),
            method: "GET".to_string(),
            uri: uri.into(),
            headers: Vec::new(),
        }
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.hostname, self.port, self.uri)
    }
}

/// One chunk within a chunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Checksum of the plaintext chunk, prefixed with an algorithm tag byte.
    pub checksum: Bytes,
    /// Per-chunk encryption key, when the chunk is encrypted.
    pub encryption_key: Option<Bytes>,
    /// Length of the chunk as served by the storage host.
    pub length: u32,
}

/// Ordered sequence of chunks served by one storage host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkList {
    pub host: StorageHost,
    pub chunks: Vec<ChunkDescriptor>,
}

impl ChunkList {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total served length of the chunks in `range`.
    pub fn range_length(&self, range: Range<usize>) -> u64 {
        self.chunks[range].iter().map(|c| u64::from(c.length)).sum()
    }

    /// Chunk range starting at `start` whose served length reaches at least
    /// `minimum_bytes`, or runs to the end of the list.
    ///
    /// Always holds at least one chunk when `start` is in bounds.
    pub fn batch_from(&self, start: usize, minimum_bytes: u64) -> Range<usize> {
        let mut end = start;
        let mut total = 0u64;
        while end < self.chunks.len() {
            total += u64::from(self.chunks[end].length);
            end += 1;
            if total >= minimum_bytes {
                break;
            }
        }
        start..end
    }
}

/// Reference from a signature to one chunk of its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkReference {
    /// Index of the chunk list within the group.
    pub container_index: usize,
    /// Index of the chunk within that list.
    pub chunk_index: usize,
}

impl ChunkReference {
    pub fn new(container_index: usize, chunk_index: usize) -> Self {
        Self {
            container_index,
            chunk_index,
        }
    }
}

/// The ordered chunks composing one signature's plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunks {
    pub signature: Signature,
    pub chunks: Vec<ChunkReference>,
}

/// Server-assigned grouping of chunk lists that together satisfy a subset
/// of the requested signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkListGroup {
    pub chunk_lists: Vec<ChunkList>,
    pub files: Vec<FileChunks>,
}

/// Identifies a chunk list within one resolution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkListId {
    pub group: usize,
    pub container: usize,
}

impl fmt::Display for ChunkListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.container)
    }
}

/// Identifies one chunk within one resolution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub list: ChunkListId,
    pub index: usize,
}

impl ChunkKey {
    pub fn new(group: usize, container: usize, index: usize) -> Self {
        Self {
            list: ChunkListId { group, container },
            index,
        }
    }
}

/// A chunk list paired with its id, ready to hand to a donkey.
#[derive(Debug, Clone)]
pub struct IndexedChunkList {
    pub id: ChunkListId,
    pub list: Arc<ChunkList>,
}

impl IndexedChunkList {
    /// Flatten the chunk lists of all groups, in group order.
    pub fn flatten(groups: &[ChunkListGroup]) -> Vec<IndexedChunkList> {
        groups
            .iter()
            .enumerate()
            .flat_map(|(group, g)| {
                g.chunk_lists
                    .iter()
                    .enumerate()
                    .map(move |(container, list)| IndexedChunkList {
                        id: ChunkListId { group, container },
                        list: Arc::new(list.clone()),
                    })
            })
            .collect()
    }

    /// Key of the chunk at `index` in this list.
    pub fn key(&self, index: usize) -> ChunkKey {
        ChunkKey {
            list: self.id,
            index,
        }
    }
}
