//! Storage keys shared with the browser client's session storage layout

/// Key holding the bearer token attached to API requests
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Key holding the refresh token issued alongside the access token.
/// Stored for parity with the API's login response; never exchanged.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
