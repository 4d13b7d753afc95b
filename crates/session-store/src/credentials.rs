//! Typed access to the session's bearer token pair
//!
//! `SessionStore` is the only writer of the credential keys. It wraps any
//! `SessionStorage` backend and exposes both the raw key-value operations
//! and typed helpers for the access/refresh token pair.

use std::sync::Arc;

use common::Secret;
use tracing::{debug, warn};

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::Result;
use crate::storage::{MemoryStorage, SessionStorage};

/// Bearer token pair issued by the login endpoint.
///
/// Either token may be empty when the API omitted it. Values are opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
        }
    }
}

/// Handle to the current session's credential.
///
/// Cheap to clone; clones share the same backend.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self { storage }
    }

    /// Store backed by process memory (the session-scoped default).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Read a raw value. Absent is a normal outcome.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.storage.get(key).await
    }

    /// Write a raw value, replacing any previous one.
    pub async fn set(&self, key: &str, value: String) -> Result<()> {
        self.storage.set(key, value).await
    }

    /// Delete a raw value. Removing an absent key succeeds.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.storage.remove(key).await
    }

    pub async fn access_token(&self) -> Option<Secret<String>> {
        self.get(ACCESS_TOKEN_KEY).await.map(Secret::new)
    }

    pub async fn refresh_token(&self) -> Option<Secret<String>> {
        self.get(REFRESH_TOKEN_KEY).await.map(Secret::new)
    }

    /// The stored token pair, if an access token exists.
    ///
    /// A missing refresh token reads as empty, matching how `store` writes
    /// a login response that omitted it.
    pub async fn credential(&self) -> Option<Credential> {
        let access_token = self.access_token().await?;
        let refresh_token = self
            .refresh_token()
            .await
            .unwrap_or_else(|| Secret::new(String::new()));
        Some(Credential {
            access_token,
            refresh_token,
        })
    }

    /// Persist both tokens. Each write has completed when this returns.
    pub async fn store(&self, credential: &Credential) -> Result<()> {
        self.set(ACCESS_TOKEN_KEY, credential.access_token.expose().clone())
            .await?;
        self.set(REFRESH_TOKEN_KEY, credential.refresh_token.expose().clone())
            .await?;
        debug!("stored session credential");
        Ok(())
    }

    /// Persist both tokens, or leave the previous pair in place.
    ///
    /// If either write fails, both keys are put back to what they held
    /// before (best effort) and the write error is returned.
    pub async fn replace(&self, credential: &Credential) -> Result<()> {
        let previous = [
            (ACCESS_TOKEN_KEY, self.get(ACCESS_TOKEN_KEY).await),
            (REFRESH_TOKEN_KEY, self.get(REFRESH_TOKEN_KEY).await),
        ];
        let Err(e) = self.store(credential).await else {
            return Ok(());
        };

        for (key, value) in previous {
            let restored = match value {
                Some(value) => self.set(key, value).await,
                None => self.remove(key).await,
            };
            if let Err(restore_err) = restored {
                warn!(key, error = %restore_err, "failed to restore previous session value");
            }
        }
        Err(e)
    }

    /// Remove both tokens.
    ///
    /// Attempts both removals even if the first fails, then reports the
    /// first error.
    pub async fn clear(&self) -> Result<()> {
        let access = self.remove(ACCESS_TOKEN_KEY).await;
        let refresh = self.remove(REFRESH_TOKEN_KEY).await;
        access?;
        refresh?;
        debug!("cleared session credential");
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}
