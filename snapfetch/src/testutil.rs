//! Scripted collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::agent::{AuthToken, Authenticator, BoxFuture, HttpAgent, Transport};
use crate::crypto::{chunk_checksum, ChunkDecrypter};
use crate::engine::PassContext;
use crate::error::TransportError;
use crate::model::{
    Backup, ChunkDescriptor, ChunkList, ChunkListGroup, ChunkReference, FileChunks, FileRecord,
    IndexedChunkList, KeyBag, Signature, Snapshot, StorageHost,
};
use crate::output::OutputSink;
use crate::store::ChunkStore;
use crate::tracker::CompletionTracker;

pub(crate) fn sig(id: u8) -> Signature {
    Signature::new(vec![id; 20])
}

/// File records for signature ids; repeated ids get distinct paths.
pub(crate) fn records(ids: &[u8], content_len: u64) -> Vec<FileRecord> {
    let mut seen: HashMap<u8, usize> = HashMap::new();
    ids.iter()
        .map(|id| {
            let n = seen.entry(*id).or_default();
            let path = if *n == 0 {
                format!("f{}", id)
            } else {
                format!("f{}.{}", id, n)
            };
            *n += 1;
            FileRecord::regular("HomeDomain", path, content_len, sig(*id))
        })
        .collect()
}

// =============================================================================
// Chunk layout
// =============================================================================

/// Builds a chunk-list group together with the bytes its lists serve.
#[derive(Default)]
pub(crate) struct GroupBuilder {
    lists: Vec<(String, Vec<Bytes>)>,
    files: Vec<FileChunks>,
}

pub(crate) struct ScriptedGroup {
    group: ChunkListGroup,
    content: Vec<(String, Vec<Bytes>)>,
}

impl GroupBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a chunk list served at `uri`; returns its container index.
    pub(crate) fn list(&mut self, uri: &str, chunks: &[&[u8]]) -> usize {
        let chunks = chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect();
        self.lists.push((uri.to_string(), chunks));
        self.lists.len() - 1
    }

    /// Add signature `id` made of `(container, chunk)` references.
    pub(crate) fn file(&mut self, id: u8, chunks: &[(usize, usize)]) {
        self.files.push(FileChunks {
            signature: sig(id),
            chunks: chunks
                .iter()
                .map(|(container, chunk)| ChunkReference::new(*container, *chunk))
                .collect(),
        });
    }

    pub(crate) fn build(self) -> ScriptedGroup {
        let chunk_lists = self
            .lists
            .iter()
            .map(|(uri, chunks)| ChunkList {
                host: StorageHost::new("storage.test", uri.clone()),
                chunks: chunks
                    .iter()
                    .map(|c| ChunkDescriptor {
                        checksum: chunk_checksum(c).into(),
                        encryption_key: None,
                        length: c.len() as u32,
                    })
                    .collect(),
            })
            .collect();
        ScriptedGroup {
            group: ChunkListGroup {
                chunk_lists,
                files: self.files,
            },
            content: self.lists,
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// In-memory service with scriptable failures.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    groups: Vec<ChunkListGroup>,
    content: HashMap<String, Vec<Bytes>>,
    /// Per uri: `Some(err)` fails one call, `None` lets one call through.
    script: Mutex<HashMap<String, VecDeque<Option<TransportError>>>>,
    corrupted: Mutex<HashSet<(String, usize)>>,
    delays: Mutex<HashMap<String, Duration>>,
    delay_all: Mutex<Option<Duration>>,
    fetches: Mutex<HashMap<String, usize>>,
    total_fetches: AtomicUsize,
    revoke_after: Mutex<Option<usize>>,
    resolution_failures: Mutex<VecDeque<TransportError>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(groups: Vec<ScriptedGroup>) -> Arc<Self> {
        let mut transport = Self::default();
        for scripted in groups {
            transport.content.extend(scripted.content);
            transport.groups.push(scripted.group);
        }
        Arc::new(transport)
    }

    pub(crate) fn groups(&self) -> Vec<ChunkListGroup> {
        self.groups.clone()
    }

    pub(crate) fn fail_next(&self, uri: &str, error: TransportError) {
        self.script
            .lock()
            .entry(uri.to_string())
            .or_default()
            .push_back(Some(error));
    }

    pub(crate) fn fail_resolution(&self, error: TransportError) {
        self.resolution_failures.lock().push_back(error);
    }

    /// Script the next calls: `true` fails with a timeout, `false` succeeds.
    pub(crate) fn fail_pattern(&self, uri: &str, pattern: &[bool]) {
        let mut script = self.script.lock();
        let queue = script.entry(uri.to_string()).or_default();
        for fail in pattern {
            queue.push_back(fail.then_some(TransportError::Timeout));
        }
    }

    /// Serve chunk `index` of `uri` with flipped bits.
    pub(crate) fn corrupt(&self, uri: &str, index: usize) {
        self.corrupted.lock().insert((uri.to_string(), index));
    }

    pub(crate) fn delay(&self, uri: &str, delay: Duration) {
        self.delays.lock().insert(uri.to_string(), delay);
    }

    pub(crate) fn delay_all(&self, delay: Duration) {
        *self.delay_all.lock() = Some(delay);
    }

    /// Reject every call once `fetches` chunk fetches have been made.
    pub(crate) fn revoke_after(&self, fetches: usize) {
        *self.revoke_after.lock() = Some(fetches);
    }

    pub(crate) fn fetch_count(&self, uri: &str) -> usize {
        self.fetches.lock().get(uri).copied().unwrap_or(0)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn revoked(&self) -> bool {
        let limit = *self.revoke_after.lock();
        limit.is_some_and(|n| self.total_fetches.load(Ordering::SeqCst) >= n)
    }
}

impl Transport for ScriptedTransport {
    fn keybag<'a>(
        &'a self,
        _token: &'a AuthToken,
        udid: &'a str,
    ) -> BoxFuture<'a, Result<KeyBag, TransportError>> {
        Box::pin(async move {
            if self.revoked() {
                return Err(TransportError::Unauthorized);
            }
            Ok(KeyBag::new(udid, vec![0u8; 4]))
        })
    }

    fn file_groups<'a>(
        &'a self,
        _token: &'a AuthToken,
        _backup: &'a Backup,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<Vec<ChunkListGroup>, TransportError>> {
        Box::pin(async move {
            if self.revoked() {
                return Err(TransportError::Unauthorized);
            }
            let scripted = self.resolution_failures.lock().pop_front();
            if let Some(error) = scripted {
                return Err(error);
            }
            let wanted = snapshot.signatures();
            Ok(self
                .groups
                .iter()
                .map(|g| ChunkListGroup {
                    chunk_lists: g.chunk_lists.clone(),
                    files: g
                        .files
                        .iter()
                        .filter(|f| wanted.contains(&f.signature))
                        .cloned()
                        .collect(),
                })
                .collect())
        })
    }

    fn fetch_chunks<'a>(
        &'a self,
        _token: &'a AuthToken,
        list: &'a ChunkList,
        range: Range<usize>,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>> {
        Box::pin(async move {
            let uri = list.host.uri.clone();
            let revoked = self.revoked();
            *self.fetches.lock().entry(uri.clone()).or_default() += 1;
            self.total_fetches.fetch_add(1, Ordering::SeqCst);
            if revoked {
                return Err(TransportError::Unauthorized);
            }

            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            let delay = self
                .delays
                .lock()
                .get(&uri)
                .copied()
                .or(*self.delay_all.lock());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let scripted = self
                .script
                .lock()
                .get_mut(&uri)
                .and_then(|queue| queue.pop_front());
            if let Some(Some(error)) = scripted {
                return Err(error);
            }

            let chunks = self.content.get(&uri).ok_or_else(|| TransportError::Http {
                status: 404,
                message: format!("no such list {}", uri),
            })?;
            let corrupted = self.corrupted.lock();
            let mut body = BytesMut::new();
            for index in range {
                let chunk = &chunks[index];
                if corrupted.contains(&(uri.clone(), index)) {
                    body.extend(chunk.iter().map(|b| b ^ 0xff));
                } else {
                    body.extend_from_slice(chunk);
                }
            }
            Ok(body.freeze())
        })
    }
}

/// Authenticator that always fails, invalidating the agent on first use.
pub(crate) struct RejectingAuthenticator;

impl Authenticator for RejectingAuthenticator {
    fn authenticate<'a>(
        &'a self,
        _stale: &'a AuthToken,
    ) -> BoxFuture<'a, Result<AuthToken, TransportError>> {
        Box::pin(async {
            Err(TransportError::Http {
                status: 401,
                message: "credentials revoked".to_string(),
            })
        })
    }
}

pub(crate) fn agent(transport: Arc<ScriptedTransport>) -> Arc<HttpAgent> {
    Arc::new(HttpAgent::new(
        transport,
        Arc::new(RejectingAuthenticator),
        AuthToken::new("token"),
    ))
}

// =============================================================================
// Output
// =============================================================================

/// Sink keeping written files in memory.
#[derive(Default)]
pub(crate) struct MemorySink {
    writes: Mutex<Vec<(FileRecord, Bytes)>>,
}

impl MemorySink {
    pub(crate) fn writes(&self) -> Vec<(FileRecord, Bytes)> {
        self.writes.lock().clone()
    }
}

impl OutputSink for MemorySink {
    fn write<'a>(&'a self, file: &'a FileRecord, data: Bytes) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.writes.lock().push((file.clone(), data));
            Ok(())
        })
    }
}

// =============================================================================
// Pass fixture
// =============================================================================

pub(crate) struct TestPass {
    pub(crate) pass: PassContext,
    pub(crate) sink: Arc<MemorySink>,
    groups: Vec<ChunkListGroup>,
}

impl TestPass {
    pub(crate) fn lists(&self) -> Vec<IndexedChunkList> {
        IndexedChunkList::flatten(&self.groups)
    }
}

/// Pass over every group of `transport`, tracking files for `ids`.
pub(crate) fn pass_context(
    transport: Arc<ScriptedTransport>,
    ids: &[u8],
    decrypter: impl ChunkDecrypter,
) -> TestPass {
    let groups = transport.groups();
    let snapshot = Snapshot::new("udid", 1, "account", records(ids, 1));
    let sink = Arc::new(MemorySink::default());

    TestPass {
        pass: PassContext {
            agent: agent(transport),
            store: Arc::new(ChunkStore::new(&groups)),
            tracker: Arc::new(CompletionTracker::new(&snapshot, sink.clone())),
            decrypter: Arc::new(decrypter),
            keybag: Arc::new(KeyBag::new("udid", Vec::new())),
        },
        sink,
        groups,
    }
}
