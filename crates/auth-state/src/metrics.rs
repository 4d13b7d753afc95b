//! Session metrics
//!
//! Emitted through the `metrics` facade; they are no-ops until the host
//! application installs a recorder.
//!
//! - `session_state_derivations_total` (counter): label `identity`
//! - `session_login_total` (counter): label `outcome`
//! - `session_logout_total` (counter)

use crate::identity::Identity;

/// Record one `get_current_state` result.
pub fn record_derivation(identity: &Identity) {
    let label = match identity {
        Identity::Anonymous => "anonymous",
        Identity::Authenticated { .. } => "authenticated",
    };
    metrics::counter!("session_state_derivations_total", "identity" => label).increment(1);
}

/// Record a login attempt. `outcome` is "success", "rejected" or "error".
pub fn record_login(outcome: &'static str) {
    metrics::counter!("session_login_total", "outcome" => outcome).increment(1);
}

pub fn record_logout() {
    metrics::counter!("session_logout_total").increment(1);
}
