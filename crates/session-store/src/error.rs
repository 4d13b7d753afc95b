//! Error types for session storage backends

/// Errors from writing or loading session storage.
///
/// Reads never produce these: a backend that cannot load its state reports
/// every key as absent, which the session layer already handles as
/// "no session".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("session file parse error: {0}")]
    Parse(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
