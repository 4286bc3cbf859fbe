//! Authenticated access to the backup service.
//!
//! The download core never speaks the wire protocol itself. It calls
//! [`HttpAgent::execute`] with a closure that receives the [`Transport`] and
//! the current [`AuthToken`]. The agent owns session handling:
//!
//! ```text
//! execute(op) ──► op(transport, token)
//!                     │
//!                     ├── Ok / other error ──► returned as is
//!                     │
//!                     └── Unauthorized ──► Authenticator::authenticate
//!                                             │
//!                                             ├── Ok(token) ──► op(transport, token)
//!                                             └── Err ──► authenticator invalid,
//!                                                         AuthInvalidated
//! ```
//!
//! Once invalid, every later call fails fast with
//! [`TransportError::AuthInvalidated`].

use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::model::{Backup, ChunkList, ChunkListGroup, KeyBag, Snapshot};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Session token presented with every service call.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(Arc<str>);

impl AuthToken {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(Arc::from(token.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Raw service calls used by the download core.
///
/// Implementations speak the actual protocol; the core only relies on the
/// shapes below.
pub trait Transport: Send + Sync + 'static {
    /// Fetch the keybag of a backup.
    fn keybag<'a>(
        &'a self,
        token: &'a AuthToken,
        udid: &'a str,
    ) -> BoxFuture<'a, Result<KeyBag, TransportError>>;

    /// Resolve the signatures of a snapshot's files into chunk-list groups.
    fn file_groups<'a>(
        &'a self,
        token: &'a AuthToken,
        backup: &'a Backup,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<Vec<ChunkListGroup>, TransportError>>;

    /// Fetch the served bytes of the chunks in `range`, concatenated.
    fn fetch_chunks<'a>(
        &'a self,
        token: &'a AuthToken,
        list: &'a ChunkList,
        range: Range<usize>,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>>;
}

/// Source of fresh auth tokens.
pub trait Authenticator: Send + Sync + 'static {
    /// Obtain a new token to replace `stale`.
    fn authenticate<'a>(
        &'a self,
        stale: &'a AuthToken,
    ) -> BoxFuture<'a, Result<AuthToken, TransportError>>;
}

/// Agent performing authenticated calls through a [`Transport`].
pub struct HttpAgent {
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    token: RwLock<AuthToken>,
    /// Serializes re-authentication among concurrent callers.
    reauth: tokio::sync::Mutex<()>,
    invalid: AtomicBool,
}

impl fmt::Debug for HttpAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAgent")
            .field("invalid", &self.invalid.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl HttpAgent {
    /// Create an agent holding an initial token.
    pub fn new(
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        token: AuthToken,
    ) -> Self {
        Self {
            transport,
            authenticator,
            token: RwLock::new(token),
            reauth: tokio::sync::Mutex::new(()),
            invalid: AtomicBool::new(false),
        }
    }

    /// Whether authentication failed permanently.
    pub fn authenticator_is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Run `op` with the transport and the current token.
    ///
    /// On [`TransportError::Unauthorized`] the agent re-authenticates once and
    /// replays `op` with the new token. If re-authentication fails, or the
    /// replay is rejected again, the authenticator is marked invalid and
    /// [`TransportError::AuthInvalidated`] is returned.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, TransportError>
    where
        F: Fn(Arc<dyn Transport>, AuthToken) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if self.authenticator_is_invalid() {
            return Err(TransportError::AuthInvalidated);
        }

        let token = self.token.read().clone();
        match op(Arc::clone(&self.transport), token.clone()).await {
            Err(TransportError::Unauthorized) => {}
            other => return other,
        }

        let fresh = self.reauthenticate(&token).await?;
        match op(Arc::clone(&self.transport), fresh).await {
            Err(TransportError::Unauthorized) => {
                warn!("Token rejected right after re-authentication");
                self.invalidate();
                Err(TransportError::AuthInvalidated)
            }
            other => other,
        }
    }

    async fn reauthenticate(&self, stale: &AuthToken) -> Result<AuthToken, TransportError> {
        let _guard = self.reauth.lock().await;

        if self.authenticator_is_invalid() {
            return Err(TransportError::AuthInvalidated);
        }

        // Another caller may have refreshed while we waited.
        let current = self.token.read().clone();
        if &current != stale {
            return Ok(current);
        }

        match self.authenticator.authenticate(stale).await {
            Ok(fresh) => {
                debug!("Re-authenticated");
                *self.token.write() = fresh.clone();
                Ok(fresh)
            }
            Err(e) => {
                warn!(error = %e, "Re-authentication failed");
                self.invalidate();
                Err(TransportError::AuthInvalidated)
            }
        }
    }

    fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
    }
}
