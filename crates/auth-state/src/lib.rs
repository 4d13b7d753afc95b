//! Authentication state for the measurement API client
//!
//! `AuthStateManager` answers "who is the current user" by combining the
//! token held in `session_store::SessionStore` with a round-trip to the
//! API's `profile` endpoint. Every failure on that path degrades to
//! `Identity::Anonymous`; callers never handle errors to learn whether they
//! are logged in.
//!
//! State transitions:
//! 1. `login()` → tokens persisted, default bearer set, subscribers notified
//! 2. `get_current_state()` → re-derived on each call (optionally memoized)
//! 3. `logout()` → server logout fired, bearer cleared, tokens removed,
//!    subscribers notified
//!
//! Notifications carry no payload. Subscribers call `get_current_state()`
//! to read the new value.

pub mod constants;
pub mod error;
pub mod identity;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod transport;

pub use constants::*;
pub use error::{Error, LoginFailure, Result};
pub use identity::{Identity, LoginForm, SessionState};
pub use manager::AuthStateManager;
pub use notify::{Subscribers, SubscriptionId};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, TransportFuture};
