//! Error types for authentication state operations

use crate::constants::{CONNECTION_ERROR_MESSAGE, WRONG_CREDENTIALS_MESSAGE};

/// Failure categories on the session paths.
///
/// None of these reach callers of `get_current_state` or `logout`; `login`
/// maps them onto a `LoginFailure`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no session token stored")]
    NoSession,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("credentials rejected with status {0}")]
    RejectedCredentials(u16),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("session storage error: {0}")]
    Storage(#[from] session_store::Error),
}

/// Result alias for auth state operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a login attempt failed, as shown to the user.
///
/// Carries no server detail. `Display` renders the fixed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LoginFailure {
    #[error("{}", WRONG_CREDENTIALS_MESSAGE)]
    WrongCredentials,

    #[error("{}", CONNECTION_ERROR_MESSAGE)]
    ConnectionError,
}

impl LoginFailure {
    pub fn message(&self) -> &'static str {
        match self {
            LoginFailure::WrongCredentials => WRONG_CREDENTIALS_MESSAGE,
            LoginFailure::ConnectionError => CONNECTION_ERROR_MESSAGE,
        }
    }
}

impl From<Error> for LoginFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::RejectedCredentials(_) => LoginFailure::WrongCredentials,
            // Unreadable success bodies and failed token writes surface the
            // same way as a dropped connection.
            Error::NoSession
            | Error::Transport(_)
            | Error::MalformedResponse(_)
            | Error::Storage(_) => LoginFailure::ConnectionError,
        }
    }
}
