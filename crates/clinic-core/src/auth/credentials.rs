//! The credential store and the single-flight refresh operation.
//!
//! `CredentialStore` owns the one "current" credential, mirrors it into the
//! persisted slots, and coordinates token refresh so that any number of
//! callers noticing an expired credential at the same time share a single
//! refresh call.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::storage::{KeyValueStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, USER_KEY};
use crate::api::TransportError;

/// Bearer token plus the refresh token used to mint the next one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

// Tokens must never end up in logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Minimal identity kept alongside the credential so the UI can render
/// without re-fetching the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub name: String,
    pub role: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh rejected by server (status {status})")]
    Rejected { status: u16 },

    #[error("Refresh request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Session ended while the refresh was in flight")]
    SessionEnded,

    /// The refresh task panicked or was aborted by runtime shutdown.
    #[error("Refresh interrupted: {0}")]
    Interrupted(String),
}

/// The backend call that trades a refresh token for a new credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, RefreshError>;
}

/// Handle on the in-flight refresh. Cloning it does not start another call.
pub type RefreshHandle = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

#[derive(Debug, Clone)]
enum SessionState {
    Anonymous,
    Active {
        credential: Credential,
        user: Option<SessionUser>,
    },
    /// Torn down by a failed refresh; nothing is readable, but the user has
    /// not been sent to the login route yet.
    Expired,
}

struct Inner {
    state: SessionState,
    /// Bumped whenever a session starts or ends, so a refresh that finishes
    /// after logout/login cannot write into the wrong session.
    epoch: u64,
}

pub struct CredentialStore {
    inner: RwLock<Inner>,
    in_flight: Mutex<Option<RefreshHandle>>,
    storage: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    /// Empty store; does not read the persisted slots.
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: SessionState::Anonymous,
                epoch: 0,
            }),
            in_flight: Mutex::new(None),
            storage,
        }
    }

    /// Restore the session persisted by a previous run.
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Result<Self> {
        let store = Self::new(storage);

        let access = store.storage.get(ACCESS_TOKEN_KEY)?;
        let refresh = store.storage.get(REFRESH_TOKEN_KEY)?;
        let user = store.storage.get(USER_KEY)?;

        match access {
            Some(access_token) => {
                let user = user.and_then(|raw| match serde_json::from_str::<SessionUser>(&raw) {
                    Ok(user) => Some(user),
                    Err(e) => {
                        warn!(error = %e, "Ignoring unreadable persisted user");
                        None
                    }
                });
                debug!(has_refresh = refresh.is_some(), has_user = user.is_some(), "Session restored");
                store.write().state = SessionState::Active {
                    credential: Credential::new(access_token, refresh),
                    user,
                };
            }
            None if refresh.is_some() || user.is_some() => {
                debug!("Removing orphaned session slots");
                store.remove_slots();
            }
            None => debug!("No persisted session"),
        }

        Ok(store)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current credential, if a session is active.
    pub fn get(&self) -> Option<Credential> {
        match &self.read().state {
            SessionState::Active { credential, .. } => Some(credential.clone()),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<SessionUser> {
        match &self.read().state {
            SessionState::Active { user, .. } => user.clone(),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.read().state, SessionState::Active { .. })
    }

    /// True between a failed refresh and the session terminator running.
    pub fn is_expired(&self) -> bool {
        matches!(self.read().state, SessionState::Expired)
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start a new session (login).
    pub fn set_session(&self, credential: Credential, user: SessionUser) {
        {
            let mut inner = self.write();
            inner.state = SessionState::Active {
                credential: credential.clone(),
                user: Some(user.clone()),
            };
            inner.epoch += 1;
        }
        self.persist_credential(&credential);
        match serde_json::to_string(&user) {
            Ok(raw) => self.persist(USER_KEY, &raw),
            Err(e) => warn!(error = %e, "Failed to serialize session user"),
        }
    }

    /// Replace the credential, keeping the current user.
    pub fn set(&self, credential: Credential) {
        {
            let mut inner = self.write();
            let current_user = match &inner.state {
                SessionState::Active { user, .. } => Some(user.clone()),
                _ => None,
            };
            if current_user.is_none() {
                inner.epoch += 1;
            }
            inner.state = SessionState::Active {
                credential: credential.clone(),
                user: current_user.flatten(),
            };
        }
        self.persist_credential(&credential);
    }

    /// Drop the session and every persisted slot. Returns whether there was a
    /// session (active or expired) to drop.
    pub fn clear(&self) -> bool {
        let had_session = {
            let mut inner = self.write();
            let had = !matches!(inner.state, SessionState::Anonymous);
            inner.state = SessionState::Anonymous;
            inner.epoch += 1;
            had
        };
        self.remove_slots();
        had_session
    }

    /// Get a handle on the refresh operation, starting one only if none is in
    /// flight. Every caller that asks while a refresh is running shares its
    /// outcome.
    ///
    /// The refresh runs on its own task: a caller dropping its handle does not
    /// stop it, and the result still lands in the store. Must be called from
    /// within a tokio runtime.
    pub fn refresh(self: &Arc<Self>, refresher: Arc<dyn TokenRefresher>) -> RefreshHandle {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            debug!("Joining in-flight token refresh");
            return existing.clone();
        }

        // The refresh belongs to the session that asked for it
        let (epoch, refresh_token) = {
            let inner = self.read();
            let token = match &inner.state {
                SessionState::Active { credential, .. } => credential.refresh_token.clone(),
                _ => None,
            };
            (inner.epoch, token)
        };

        debug!("Starting token refresh");
        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = store.run_refresh(epoch, refresh_token, refresher).await;
            store.finish_refresh();
            outcome
        });

        let handle = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(RefreshError::Interrupted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        *slot = Some(handle.clone());
        handle
    }

    async fn run_refresh(
        &self,
        epoch: u64,
        refresh_token: Option<String>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Credential, RefreshError> {
        let result = match refresh_token.as_deref() {
            Some(token) => refresher.refresh(token).await,
            None => Err(RefreshError::MissingRefreshToken),
        };

        // Apply the outcome only to the session that asked for it
        let mut inner = self.write();
        if inner.epoch != epoch {
            return match &inner.state {
                SessionState::Active { credential, .. } => {
                    debug!("Session replaced during refresh, using the newer credential");
                    Ok(credential.clone())
                }
                _ => Err(RefreshError::SessionEnded),
            };
        }

        match result {
            Ok(mut credential) => {
                if credential.refresh_token.is_none() {
                    credential.refresh_token = refresh_token;
                }
                let user = match &inner.state {
                    SessionState::Active { user, .. } => user.clone(),
                    _ => None,
                };
                inner.state = SessionState::Active {
                    credential: credential.clone(),
                    user,
                };
                drop(inner);
                self.persist_credential(&credential);
                info!("Access token refreshed");
                Ok(credential)
            }
            Err(e) => {
                inner.state = SessionState::Expired;
                drop(inner);
                self.remove_slots();
                warn!(error = %e, "Token refresh failed, session expired");
                Err(e)
            }
        }
    }

    fn finish_refresh(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    // ===== Persisted slots =====

    fn persist_credential(&self, credential: &Credential) {
        self.persist(ACCESS_TOKEN_KEY, &credential.access_token);
        match &credential.refresh_token {
            Some(token) => self.persist(REFRESH_TOKEN_KEY, token),
            None => self.unpersist(REFRESH_TOKEN_KEY),
        }
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.storage.set(key, value) {
            warn!(key, error = %e, "Failed to persist session slot");
        }
    }

    fn unpersist(&self, key: &str) {
        if let Err(e) = self.storage.remove(key) {
            warn!(key, error = %e, "Failed to remove session slot");
        }
    }

    fn remove_slots(&self) {
        for key in SESSION_KEYS {
            self.unpersist(key);
        }
    }
}
