//! Cache of other users' public keys, filled on demand from the chat server.
//!
//! A lookup sends `get-public-key:<user>` over the chat connection and waits
//! for the matching `public-key:` or `public-key-not-found:` reply, which the
//! session feeds back through [`PublicKeyManager::handle_response`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::chat::client::{ChatClientError, ChatSender};
use crate::chat::proto::{ControlMessage, ProtoError};
use crate::crypto::PublicKey;
use crate::retry::with_timeout;

/// How long a lookup waits for the server before giving up.
pub const DEFAULT_KEY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum KeyLookupError {
    #[error("timed out waiting for public key of {0}")]
    Timeout(String),

    #[error("failed to send key request: {0}")]
    Send(#[from] ChatClientError),

    #[error("lookup for {0} was cancelled")]
    Cancelled(String),

    #[error("invalid public key response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Result of feeding a server reply into the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyResponse {
    Found {
        username: String,
        key: PublicKey,
        waiters: usize,
    },
    NotFound {
        username: String,
        waiters: usize,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyCacheStats {
    pub cached: usize,
    pub pending: usize,
}

type Waiter = oneshot::Sender<Option<PublicKey>>;

#[derive(Default)]
struct KeyState {
    cache: HashMap<String, PublicKey>,
    pending: HashMap<String, Vec<Waiter>>,
}

/// Shared public key cache. Clones share state.
#[derive(Clone)]
pub struct PublicKeyManager {
    state: Arc<Mutex<KeyState>>,
    sender: ChatSender,
    username: String,
    timeout: Duration,
}

enum Lookup {
    Cached(PublicKey),
    Waiting {
        rx: oneshot::Receiver<Option<PublicKey>>,
        send_request: bool,
    },
}

impl PublicKeyManager {
    pub fn new(sender: ChatSender, username: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(KeyState::default())),
            sender,
            username: username.into(),
            timeout: DEFAULT_KEY_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the key for `username`, asking the server when it is not cached.
    ///
    /// Concurrent lookups for the same user share one server request.
    /// `Ok(None)` means the server does not know the user.
    pub async fn get_public_key(&self, username: &str) -> Result<Option<PublicKey>, KeyLookupError> {
        let (rx, send_request) = match self.begin_lookup(username) {
            Lookup::Cached(key) => {
                debug!(event = "public_key_cache_hit", username);
                return Ok(Some(key));
            }
            Lookup::Waiting { rx, send_request } => (rx, send_request),
        };

        if send_request {
            debug!(event = "public_key_requested", username);
            if let Err(err) = self.sender.request_public_key(&self.username, username) {
                self.lock().pending.remove(username);
                return Err(err.into());
            }
        } else {
            debug!(event = "public_key_request_joined", username);
        }

        let outcome = with_timeout(self.timeout, rx).await;
        match outcome {
            Ok(Ok(key)) => Ok(key),
            Ok(Err(_)) => Err(KeyLookupError::Cancelled(username.to_string())),
            Err(_) => {
                self.drop_stale_pending(username);
                warn!(event = "public_key_timeout", username);
                Err(KeyLookupError::Timeout(username.to_string()))
            }
        }
    }

    fn begin_lookup(&self, username: &str) -> Lookup {
        let mut state = self.lock();
        if let Some(key) = state.cache.get(username) {
            return Lookup::Cached(key.clone());
        }
        let (tx, rx) = oneshot::channel();
        let waiters = state.pending.entry(username.to_string()).or_default();
        let send_request = waiters.is_empty();
        waiters.push(tx);
        Lookup::Waiting { rx, send_request }
    }

    /// Removes the pending entry once nobody is waiting on it anymore, so the
    /// next lookup sends a fresh request.
    fn drop_stale_pending(&self, username: &str) {
        let mut state = self.lock();
        if let Some(waiters) = state.pending.get_mut(username) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                state.pending.remove(username);
            }
        }
    }

    /// Applies a `public-key:` or `public-key-not-found:` reply.
    pub fn handle_response(&self, content: &str) -> Result<KeyResponse, KeyLookupError> {
        match ControlMessage::parse(content) {
            Some(Ok(ControlMessage::PublicKey { username, key })) => {
                Ok(self.complete_found(username, key))
            }
            Some(Ok(ControlMessage::PublicKeyNotFound { username })) => {
                Ok(self.complete_not_found(username))
            }
            Some(Err(err)) => Err(err.into()),
            Some(Ok(_)) | None => Err(KeyLookupError::InvalidResponse(content.to_string())),
        }
    }

    /// Whether a lookup for `username` is waiting on a server reply.
    pub(crate) fn is_pending(&self, username: &str) -> bool {
        self.lock().pending.contains_key(username)
    }

    pub(crate) fn complete_found(&self, username: String, key: PublicKey) -> KeyResponse {
        let waiters = {
            let mut state = self.lock();
            state.cache.insert(username.clone(), key.clone());
            state.pending.remove(&username).unwrap_or_default()
        };
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Some(key.clone()));
        }
        info!(event = "public_key_cached", username = %username, waiters = count);
        KeyResponse::Found {
            username,
            key,
            waiters: count,
        }
    }

    pub(crate) fn complete_not_found(&self, username: String) -> KeyResponse {
        let waiters = self.lock().pending.remove(&username).unwrap_or_default();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(None);
        }
        warn!(event = "public_key_not_found", username = %username);
        KeyResponse::NotFound {
            username,
            waiters: count,
        }
    }

    pub fn cached_public_key(&self, username: &str) -> Option<PublicKey> {
        self.lock().cache.get(username).cloned()
    }

    pub fn has_public_key(&self, username: &str) -> bool {
        self.lock().cache.contains_key(username)
    }

    /// Starts a background lookup when the key is not cached yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn preload(&self, username: &str) {
        if self.has_public_key(username) {
            return;
        }
        let manager = self.clone();
        let username = username.to_string();
        tokio::spawn(async move {
            match manager.get_public_key(&username).await {
                Ok(Some(_)) => info!(event = "public_key_preloaded", username = %username),
                Ok(None) => warn!(event = "public_key_preload_missing", username = %username),
                Err(err) => warn!(event = "public_key_preload_failed", username = %username, error = %err),
            }
        });
    }

    /// Drops every cached key and cancels pending lookups.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.cache.clear();
        state.pending.clear();
        info!(event = "public_key_cache_cleared");
    }

    pub fn stats(&self) -> KeyCacheStats {
        let state = self.lock();
        KeyCacheStats {
            cached: state.cache.len(),
            pending: state.pending.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyState> {
        // Each mutation is a single map operation, so poisoned state is intact.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for PublicKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKeyManager")
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}
