//! File-backed session storage
//!
//! Keeps the session map as a flat JSON object (`{"accessToken": "...",
//! "refreshToken": "..."}`) so a CLI session survives between invocations.
//! The file is loaded lazily on first access. All writes use atomic
//! temp-file + rename, and a tokio Mutex serializes writers.
//!
//! An unparseable file reads as empty and rejects `set`, but `remove`
//! replaces it with an empty map so logging out recovers the session file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage::{SessionStorage, StorageFuture};

type Entries = HashMap<String, String>;

/// Session storage persisted to a single JSON file.
///
/// `None` in the state slot means the file has not been read yet.
pub struct FileStorage {
    path: PathBuf,
    state: Mutex<Option<Entries>>,
}

impl FileStorage {
    /// Create a storage handle. Does not touch the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the state, reading the file first if this is the first access.
    async fn loaded(&self) -> Result<MutexGuard<'_, Option<Entries>>> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(read_entries(&self.path).await?);
        }
        Ok(state)
    }

    /// Like `loaded`, but an unparseable file is discarded as an empty map.
    ///
    /// Returns true alongside the guard when the file was discarded and
    /// must be rewritten.
    async fn loaded_or_reset(&self) -> Result<(MutexGuard<'_, Option<Entries>>, bool)> {
        let mut state = self.state.lock().await;
        let mut reset = false;
        if state.is_none() {
            let entries = match read_entries(&self.path).await {
                Ok(entries) => entries,
                Err(Error::Parse(e)) => {
                    warn!(path = %self.path.display(), error = %e, "discarding unparseable session file");
                    reset = true;
                    HashMap::new()
                }
                Err(e) => return Err(e),
            };
            *state = Some(entries);
        }
        Ok((state, reset))
    }
}

impl SessionStorage for FileStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move {
            match self.loaded().await {
                Ok(state) => state.as_ref().and_then(|entries| entries.get(key).cloned()),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "session file unreadable, treating as empty");
                    None
                }
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.loaded().await?;
            let entries = state.get_or_insert_with(HashMap::new);
            entries.insert(key.to_owned(), value);
            debug!(key, "stored session value");
            write_atomic(&self.path, entries).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Result<()>> {
        Box::pin(async move {
            let (mut state, reset) = self.loaded_or_reset().await?;
            let entries = state.get_or_insert_with(HashMap::new);
            let removed = entries.remove(key).is_some();
            if removed {
                debug!(key, "removed session value");
            }
            if removed || reset {
                write_atomic(&self.path, entries).await?;
            }
            Ok(())
        })
    }
}

/// Read the session map, treating a missing file as an empty session.
async fn read_entries(path: &Path) -> Result<Entries> {
    if !tokio::fs::try_exists(path)
        .await
        .map_err(|e| Error::Io(format!("checking session file: {e}")))?
    {
        debug!(path = %path.display(), "session file not found, starting with empty session");
        return Ok(HashMap::new());
    }

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
    let entries: Entries = serde_json::from_str(&contents)
        .map_err(|e| Error::Parse(format!("parsing session file: {e}")))?;
    info!(path = %path.display(), keys = entries.len(), "loaded session file");
    Ok(entries)
}

/// Write the session map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 on unix since the file holds bearer
/// tokens.
async fn write_atomic(path: &Path, data: &Entries) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing session: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session");
    Ok(())
}
