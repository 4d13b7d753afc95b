//! Session-scoped credential storage for the measurement client
//!
//! Holds the bearer token pair issued by the measurement API's `login`
//! endpoint. Storage is a pluggable async key-value capability
//! (`SessionStorage`) so the same `SessionStore` runs against process
//! memory or a file that outlives a single CLI invocation.
//!
//! Credential lifecycle:
//! 1. `login` succeeds → `SessionStore::replace()` writes both tokens
//! 2. Every state derivation reads `SessionStore::access_token()`
//! 3. `logout` → `SessionStore::clear()` removes both keys
//!
//! Tokens are opaque. Nothing in this crate inspects, validates or expires
//! them.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod file;
pub mod storage;

pub use constants::*;
pub use credentials::{Credential, SessionStore};
pub use error::{Error, Result};
pub use file::FileStorage;
pub use storage::{MemoryStorage, SessionStorage, StorageFuture};
