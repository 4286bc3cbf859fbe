//! Per-chunk-list fetch/write worker.
//!
//! A [`Donkey`] walks one chunk list from start to end. It alternates between
//! fetching a batch of chunks over the network and writing the decrypted
//! chunks into the chunk store:
//!
//! ```text
//!            ┌──────────── transient error, retries left ────────────┐
//!            ▼                                                        │
//!   ┌──► Fetching{pos} ──── ok ────► Writing{range} ──── more ────┐   │
//!   │        │  │                        │                        │   │
//!   │        │  └──── fatal / exhausted ─┼──► Aborted(cause)      │   │
//!   │        └───────────────────────────┴──► (signal observed)   │   │
//!   │                                    │                        │   │
//!   │                                    └──── end of list ──► Done   │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The retry counter is reset for every new fetch position; the error log is
//! kept for the whole chunk list. Before each `Fetching` and `Writing` step the
//! donkey checks the pass-wide [`FatalSignal`] and the pass halt token; once
//! either is set it never starts another fetch.

use std::ops::Range;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use crate::engine::PassContext;
use crate::error::TransportError;
use crate::model::{ChunkKey, ChunkListId, IndexedChunkList};
use crate::outcome::FailureKind;
use crate::retry::RetryPolicy;
use crate::store::ChunkWrite;

/// Chunks that failed permanently during a pass, shared by all donkeys.
pub type ChunkFailures = Arc<DashMap<ChunkKey, FailureKind>>;

// =============================================================================
// Fatal Signal
// =============================================================================

/// Pass-wide abort flag.
///
/// The first [`trip`](Self::trip) records its cause; later trips keep the
/// original cause. Every donkey observes the flag before each state step.
#[derive(Debug, Default)]
pub struct FatalSignal {
    cause: OnceLock<String>,
    token: CancellationToken,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns true if this call recorded the cause.
    pub fn trip(&self, cause: impl Into<String>) -> bool {
        let recorded = self.cause.set(cause.into()).is_ok();
        self.token.cancel();
        recorded
    }

    pub fn is_set(&self) -> bool {
        self.cause.get().is_some()
    }

    /// Cause recorded by the first trip.
    pub fn cause(&self) -> Option<&str> {
        self.cause.get().map(String::as_str)
    }

    /// Completes once the signal is set.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

// =============================================================================
// State
// =============================================================================

/// Retry bookkeeping of one chunk list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Retries spent on the current fetch position.
    pub count: u32,
    /// Every error seen on this chunk list, oldest first.
    pub errors: Vec<String>,
}

impl RetryState {
    /// State for the next fetch position: fresh counter, same error log.
    fn next_position(self) -> Self {
        Self {
            count: 0,
            errors: self.errors,
        }
    }
}

/// Why a donkey stopped before the end of its chunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    /// The pass-wide fatal signal was set, by this donkey or another one.
    Fatal(String),
    /// The fetch failed permanently or ran out of retries.
    Network(String),
    /// The pass was halted (deadline expired).
    Halted,
}

/// Position of a donkey in its state machine.
#[derive(Debug, Clone)]
pub enum DonkeyState {
    Fetching {
        position: usize,
        retry: RetryState,
    },
    Writing {
        range: Range<usize>,
        data: Bytes,
        retry: RetryState,
    },
    Done,
    Aborted(AbortCause),
}

impl DonkeyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted(_))
    }
}

/// Summary of one donkey run.
#[derive(Debug, Clone)]
pub struct DonkeyReport {
    pub list: ChunkListId,
    /// Always [`DonkeyState::Done`] or [`DonkeyState::Aborted`].
    pub final_state: DonkeyState,
    /// Retries across all fetch positions.
    pub retries: u32,
    pub errors: Vec<String>,
    pub decrypt_failures: u32,
}

impl DonkeyReport {
    pub fn is_done(&self) -> bool {
        matches!(self.final_state, DonkeyState::Done)
    }

    /// Whether the list stopped on a network or authentication failure.
    pub fn aborted_on_network(&self) -> bool {
        matches!(
            self.final_state,
            DonkeyState::Aborted(AbortCause::Network(_) | AbortCause::Fatal(_))
        )
    }
}

// =============================================================================
// Donkey
// =============================================================================

/// Worker for one chunk list.
pub struct Donkey {
    list: IndexedChunkList,
    ctx: PassContext,
    fatal: Arc<FatalSignal>,
    halt: CancellationToken,
    retry_policy: RetryPolicy,
    batch_size_min_bytes: u64,
    failures: ChunkFailures,
}

impl Donkey {
    /// Create a donkey with the default retry policy and one chunk per fetch.
    pub fn new(
        list: IndexedChunkList,
        ctx: PassContext,
        fatal: Arc<FatalSignal>,
        halt: CancellationToken,
    ) -> Self {
        Self {
            list,
            ctx,
            fatal,
            halt,
            retry_policy: RetryPolicy::default(),
            batch_size_min_bytes: 0,
            failures: ChunkFailures::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Minimum served bytes per fetch; chunks are added until reached.
    pub fn with_batch_size_min_bytes(mut self, bytes: u64) -> Self {
        self.batch_size_min_bytes = bytes;
        self
    }

    /// Registry receiving decrypt failures.
    pub fn with_failures(mut self, failures: ChunkFailures) -> Self {
        self.failures = failures;
        self
    }

    pub fn id(&self) -> ChunkListId {
        self.list.id
    }

    /// Report for a donkey that never got to run.
    pub fn halted(self) -> DonkeyReport {
        DonkeyReport {
            list: self.list.id,
            final_state: DonkeyState::Aborted(AbortCause::Halted),
            retries: 0,
            errors: Vec::new(),
            decrypt_failures: 0,
        }
    }

    /// Run the state machine to a terminal state.
    pub async fn run(self) -> DonkeyReport {
        let mut state = DonkeyState::Fetching {
            position: 0,
            retry: RetryState::default(),
        };
        let mut retries = 0u32;
        let mut decrypt_failures = 0u32;
        let mut errors = Vec::new();

        let final_state = loop {
            state = match state {
                DonkeyState::Fetching {
                    position,
                    mut retry,
                } => {
                    let next = match self.interruption() {
                        Some(cause) => DonkeyState::Aborted(cause),
                        None => self.fetch(position, &mut retry, &mut retries).await,
                    };
                    if next.is_terminal() {
                        errors = std::mem::take(&mut retry.errors);
                    }
                    next
                }
                DonkeyState::Writing { range, data, retry } => {
                    if let Some(cause) = self.interruption() {
                        errors = retry.errors;
                        DonkeyState::Aborted(cause)
                    } else {
                        decrypt_failures += self.write(range.clone(), data).await;
                        if range.end >= self.list.list.len() {
                            errors = retry.errors;
                            DonkeyState::Done
                        } else {
                            DonkeyState::Fetching {
                                position: range.end,
                                retry: retry.next_position(),
                            }
                        }
                    }
                }
                terminal @ (DonkeyState::Done | DonkeyState::Aborted(_)) => break terminal,
            };
        };

        debug!(
            list = %self.list.id,
            state = ?final_state,
            retries,
            decrypt_failures,
            "Chunk list finished"
        );

        DonkeyReport {
            list: self.list.id,
            final_state,
            retries,
            errors,
            decrypt_failures,
        }
    }

    fn interruption(&self) -> Option<AbortCause> {
        if let Some(cause) = self.fatal.cause() {
            return Some(AbortCause::Fatal(cause.to_string()));
        }
        if self.halt.is_cancelled() {
            return Some(AbortCause::Halted);
        }
        None
    }

    async fn fetch(
        &self,
        position: usize,
        retry: &mut RetryState,
        total_retries: &mut u32,
    ) -> DonkeyState {
        let list = &self.list.list;
        if position >= list.len() {
            return DonkeyState::Done;
        }

        let range = list.batch_from(position, self.batch_size_min_bytes);
        let expected = list.range_length(range.clone());

        let result = self
            .ctx
            .agent
            .execute(|transport, token| {
                let list = Arc::clone(list);
                let range = range.clone();
                async move { transport.fetch_chunks(&token, &list, range).await }
            })
            .await
            .and_then(|data| {
                let actual = data.len() as u64;
                if actual == expected {
                    Ok(data)
                } else {
                    Err(TransportError::Truncated { expected, actual })
                }
            });

        match result {
            Ok(data) => {
                trace!(list = %self.list.id, ?range, bytes = data.len(), "Fetched chunks");
                DonkeyState::Writing {
                    range,
                    data,
                    retry: std::mem::take(retry),
                }
            }
            Err(e) if e.is_fatal() => {
                let cause = e.to_string();
                retry.errors.push(cause.clone());
                if self.fatal.trip(cause.clone()) {
                    warn!(
                        list = %self.list.id,
                        error = %e,
                        "Fatal error, stopping all chunk lists"
                    );
                }
                DonkeyState::Aborted(AbortCause::Fatal(cause))
            }
            Err(e) if e.is_transient() && retry.count < self.retry_policy.max_retries() => {
                retry.count += 1;
                *total_retries += 1;
                retry.errors.push(e.to_string());

                let delay = self
                    .retry_policy
                    .delay_for_retry(retry.count)
                    .unwrap_or_default();
                warn!(
                    list = %self.list.id,
                    position,
                    retry = retry.count,
                    max_retries = self.retry_policy.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Chunk fetch failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.fatal.cancelled() => {}
                    _ = self.halt.cancelled() => {}
                }

                DonkeyState::Fetching {
                    position,
                    retry: std::mem::take(retry),
                }
            }
            Err(e) => {
                retry.errors.push(e.to_string());
                warn!(
                    list = %self.list.id,
                    position,
                    retries = retry.count,
                    error = %e,
                    "Chunk fetch failed, giving up on chunk list"
                );
                DonkeyState::Aborted(AbortCause::Network(e.to_string()))
            }
        }
    }

    /// Decrypt and store every chunk of `range`. Returns the number of
    /// chunks that failed to decrypt.
    async fn write(&self, range: Range<usize>, data: Bytes) -> u32 {
        let mut decrypt_failures = 0;
        let mut offset = 0usize;

        for index in range {
            let descriptor = &self.list.list.chunks[index];
            let length = descriptor.length as usize;
            let ciphertext = data.slice(offset..offset + length);
            offset += length;
            let key = self.list.key(index);

            let decrypted = self
                .ctx
                .decrypter
                .decrypt(&self.ctx.keybag, descriptor, ciphertext);
            let plaintext = match decrypted {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(
                        list = %self.list.id,
                        chunk = index,
                        error = %e,
                        "Chunk decryption failed"
                    );
                    self.failures.insert(key, FailureKind::Decrypt);
                    decrypt_failures += 1;
                    continue;
                }
            };

            if let ChunkWrite::Resolved(signatures) = self.ctx.store.apply(key, plaintext) {
                for signature in signatures {
                    if let Some(payload) = self.ctx.store.take_payload(&signature) {
                        self.ctx.tracker.materialize(&signature, payload).await;
                    }
                }
            }
        }

        decrypt_failures
    }
}
