//! Identity values derived from the profile endpoint

use serde::Deserialize;

/// Who the current user is.
///
/// `Authenticated` is only produced by `AuthStateManager` from a successful
/// profile response; it is never rebuilt from stored data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Identity {
    #[default]
    Anonymous,
    Authenticated {
        username: String,
        display_name: String,
        role: String,
    },
}

/// Body of a successful `GET profile`. All three fields are required strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProfileResponse {
    pub username: String,
    pub display_name: String,
    pub role: String,
}

impl From<ProfileResponse> for Identity {
    fn from(profile: ProfileResponse) -> Self {
        Identity::Authenticated {
            username: profile.username,
            display_name: profile.display_name,
            role: profile.role,
        }
    }
}

/// Snapshot of the authentication state handed to subscribers.
///
/// A fresh value per derivation; holding one does not keep it current.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    identity: Identity,
}

impl SessionState {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn into_identity(self) -> Identity {
        self.identity
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.identity, Identity::Authenticated { .. })
    }

    pub fn username(&self) -> Option<&str> {
        match &self.identity {
            Identity::Authenticated { username, .. } => Some(username),
            Identity::Anonymous => None,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match &self.identity {
            Identity::Authenticated { display_name, .. } => Some(display_name),
            Identity::Anonymous => None,
        }
    }

    pub fn role(&self) -> Option<&str> {
        match &self.identity {
            Identity::Authenticated { role, .. } => Some(role),
            Identity::Anonymous => None,
        }
    }

    /// Whether the current user holds `role`. Anonymous holds none.
    pub fn is_in_role(&self, role: &str) -> bool {
        self.role() == Some(role)
    }
}

/// Username/password pair collected from the user before calling
/// `AuthStateManager::login`.
#[derive(Clone, Default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginForm")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl LoginForm {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Reject blank fields before any request is made.
    ///
    /// Returns every problem found, in field order.
    pub fn validate(&self) -> std::result::Result<(), Vec<&'static str>> {
        let mut errors = Vec::new();
        if self.username.trim().is_empty() {
            errors.push("Username is required");
        }
        if self.password.trim().is_empty() {
            errors.push("Password is required");
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
