//! Measurement API endpoint paths and user-facing login messages
//!
//! Paths are relative to the configured API base URL.

/// Returns the caller's profile for the bearer token presented
pub const PROFILE_ENDPOINT: &str = "profile";

/// Exchanges `{username, password}` for a token pair
pub const LOGIN_ENDPOINT: &str = "login";

/// Invalidates the bearer token server-side
pub const LOGOUT_ENDPOINT: &str = "logout";

/// Shown for any non-success login response. Fixed so server error
/// details never reach the user.
pub const WRONG_CREDENTIALS_MESSAGE: &str = "Wrong email or password";

/// Shown when the login request could not complete
pub const CONNECTION_ERROR_MESSAGE: &str = "Connection error";
