//! Async key-value storage capability and the in-memory backend

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Boxed future returned by `SessionStorage` methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Scoped async string storage keyed by name.
///
/// Uses `Pin<Box<dyn Future>>` return types so the store can be held as
/// `Arc<dyn SessionStorage>`.
///
/// Contract:
/// - `get` never fails; an absent key is a normal outcome
/// - `set` overwrites any prior value and has completed (or failed) by the
///   time its future resolves
/// - `remove` is idempotent
pub trait SessionStorage: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, Result<()>>;

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Result<()>>;
}

/// Process-lifetime storage, the equivalent of a browser tab's session
/// storage: everything is gone once the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl SessionStorage for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move { self.entries.lock().await.get(key).cloned() })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.insert(key.to_owned(), value);
            debug!(key, "stored session value");
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.entries.lock().await.remove(key).is_some() {
                debug!(key, "removed session value");
            }
            Ok(())
        })
    }
}
