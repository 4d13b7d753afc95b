//! Authentication state machine
//!
//! Derives the current identity on demand from the stored access token and
//! the profile endpoint, and drives the login/logout transitions:
//!
//! | From          | Trigger               | To            | Side effects                          |
//! |---------------|-----------------------|---------------|---------------------------------------|
//! | Anonymous     | login succeeds        | Authenticated | tokens stored, bearer set, notify     |
//! | Anonymous     | login fails           | Anonymous     | none                                  |
//! | Authenticated | logout                | Anonymous     | tokens removed, bearer cleared, notify|
//! | Authenticated | profile fetch fails   | Anonymous     | none (derived, not stored)            |
//! | any           | get_current_state     | same          | one storage read, at most one request |
//!
//! Derivation never returns an error. Anything that goes wrong between the
//! storage read and the parsed profile yields `Identity::Anonymous`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use common::Secret;
use serde::Deserialize;
use session_store::{Credential, SessionStore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{LOGIN_ENDPOINT, LOGOUT_ENDPOINT, PROFILE_ENDPOINT};
use crate::error::{Error, LoginFailure, Result};
use crate::identity::{Identity, ProfileResponse, SessionState};
use crate::notify::{Subscribers, SubscriptionId};
use crate::transport::{ApiRequest, Transport};

/// Body of a successful `POST login`. Missing tokens read as empty.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Last derived state, reused while younger than the memo window.
///
/// `generation` is bumped on every login/logout so a derivation that began
/// before the transition cannot store its stale result or restore a stale
/// default bearer afterwards. Bumps and the guarded writes both happen
/// under the `entry` lock.
#[derive(Default)]
struct Memo {
    generation: AtomicU64,
    entry: Mutex<Option<(u64, Instant, SessionState)>>,
}

impl Memo {
    fn lookup(&self, window: Duration) -> Option<SessionState> {
        let generation = self.generation.load(Ordering::Acquire);
        let entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        match entry.as_ref() {
            Some((g, at, state)) if *g == generation && at.elapsed() < window => {
                Some(state.clone())
            }
            _ => None,
        }
    }

    fn store(&self, generation: u64, state: &SessionState) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) == generation {
            *entry = Some((generation, Instant::now(), state.clone()));
        }
    }

    /// Run `f` only if no login/logout began since `generation` was read.
    fn if_current(&self, generation: u64, f: impl FnOnce()) -> bool {
        let _entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.generation.load(Ordering::Acquire) == generation;
        if current {
            f();
        }
        current
    }

    /// Start a new generation, drop the memoized state and run `f` before
    /// any derivation can observe the new generation.
    fn invalidate_with(&self, f: impl FnOnce()) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *entry = None;
        f();
    }
}

/// Single source of truth for the current user.
///
/// Holds no identity of its own: each `get_current_state` call re-derives
/// it unless a memo window is configured.
pub struct AuthStateManager {
    store: SessionStore,
    transport: Arc<dyn Transport>,
    subscribers: Subscribers,
    memo_window: Option<Duration>,
    memo: Memo,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl AuthStateManager {
    pub fn new(store: SessionStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            subscribers: Subscribers::new(),
            memo_window: None,
            memo: Memo::default(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Reuse a derived state for up to `window`. A zero window disables
    /// memoization. Login and logout always discard the memoized value.
    pub fn with_memo_window(mut self, window: Duration) -> Self {
        self.memo_window = (!window.is_zero()).then_some(window);
        self
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register a callback fired after every login and logout.
    ///
    /// The callback receives nothing; it should call `get_current_state`.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Derive the current authentication state.
    ///
    /// Returns `Anonymous` without any request when no access token is
    /// stored, and `Anonymous` on every transport, status or parse failure.
    /// Never modifies the session store.
    pub async fn get_current_state(&self) -> SessionState {
        if let Some(window) = self.memo_window {
            if let Some(state) = self.memo.lookup(window) {
                debug!("session state served from memo");
                return state;
            }
        }

        let generation = self.memo.generation.load(Ordering::Acquire);
        let identity = match self.derive_identity(generation).await {
            Ok(identity) => identity,
            Err(Error::NoSession) => {
                debug!("no access token stored, anonymous");
                Identity::Anonymous
            }
            Err(e) => {
                warn!(error = %e, "profile lookup failed, treating session as anonymous");
                Identity::Anonymous
            }
        };
        crate::metrics::record_derivation(&identity);

        let state = SessionState::new(identity);
        if self.memo_window.is_some() {
            self.memo.store(generation, &state);
        }
        state
    }

    async fn derive_identity(&self, generation: u64) -> Result<Identity> {
        let token = self
            .store
            .access_token()
            .await
            .filter(|t| !t.is_empty())
            .ok_or(Error::NoSession)?;

        // Restore the ambient bearer for other requests made through the
        // shared transport, unless a login or logout overtook the read.
        let restored = self
            .memo
            .if_current(generation, || self.transport.set_default_bearer(&token));
        if !restored {
            debug!("session changed during derivation, default bearer left alone");
        }

        let response = self
            .transport
            .send(ApiRequest::get(PROFILE_ENDPOINT).bearer(token))
            .await?;
        if !response.is_success() {
            return Err(Error::RejectedCredentials(response.status.as_u16()));
        }

        let profile: ProfileResponse = serde_json::from_str(&response.body)
            .map_err(|e| Error::MalformedResponse(format!("profile body: {e}")))?;
        debug!(username = %profile.username, "profile resolved");
        Ok(profile.into())
    }

    /// Exchange a username and password for a session.
    ///
    /// On success the token pair is stored, becomes the default bearer and
    /// subscribers are notified once. On failure nothing is stored, nobody
    /// is notified, and the error carries only a fixed message.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<(), LoginFailure> {
        match self.try_login(username, password).await {
            Ok(()) => {
                crate::metrics::record_login("success");
                info!(username, "login succeeded");
                self.subscribers.notify();
                Ok(())
            }
            Err(e) => {
                let failure = LoginFailure::from(e);
                let outcome = match failure {
                    LoginFailure::WrongCredentials => "rejected",
                    LoginFailure::ConnectionError => "error",
                };
                crate::metrics::record_login(outcome);
                Err(failure)
            }
        }
    }

    async fn try_login(&self, username: &str, password: &str) -> Result<()> {
        let body = serde_json::json!({
            "username": username,
            "password": password,
        });
        let response = self
            .transport
            .send(ApiRequest::post(LOGIN_ENDPOINT).json(body))
            .await
            .inspect_err(|e| warn!(username, error = %e, "login request failed"))?;

        if !response.is_success() {
            warn!(username, status = %response.status, "login rejected");
            return Err(Error::RejectedCredentials(response.status.as_u16()));
        }

        let tokens: LoginResponse = serde_json::from_str(&response.body).map_err(|e| {
            warn!(username, error = %e, "login response unreadable");
            Error::MalformedResponse(format!("login body: {e}"))
        })?;
        let credential = Credential::new(
            tokens.access_token.unwrap_or_default(),
            tokens.refresh_token.unwrap_or_default(),
        );

        self.store
            .replace(&credential)
            .await
            .inspect_err(|e| warn!(error = %e, "failed to persist session"))?;

        self.memo
            .invalidate_with(|| self.transport.set_default_bearer(&credential.access_token));
        Ok(())
    }

    /// End the session. Never fails.
    ///
    /// The server-side logout is spawned and its result discarded; the
    /// local session ends whether or not it reaches the server.
    pub async fn logout(&self) {
        let bearer = match self.transport.default_bearer() {
            Some(token) => Some(token),
            None => self.store.access_token().await,
        };
        self.spawn_server_logout(bearer);

        self.memo
            .invalidate_with(|| self.transport.clear_default_bearer());
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to remove stored tokens on logout");
        }
        // A derivation that read the token before it was removed may have
        // restored the bearer in the meantime.
        self.memo
            .invalidate_with(|| self.transport.clear_default_bearer());

        crate::metrics::record_logout();
        info!("logged out");
        self.subscribers.notify();
    }

    fn spawn_server_logout(&self, bearer: Option<Secret<String>>) {
        let transport = self.transport.clone();
        let mut request = ApiRequest::post(LOGOUT_ENDPOINT);
        request.bearer = bearer;
        let handle = tokio::spawn(async move {
            match transport.send(request).await {
                Ok(response) if response.is_success() => debug!("server logout acknowledged"),
                Ok(response) => debug!(status = %response.status, "server logout refused"),
                Err(e) => debug!(error = %e, "server logout unreachable"),
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait up to `timeout` for spawned server logouts to finish.
    ///
    /// Only needed by short-lived hosts (a CLI) that would otherwise exit
    /// before the request is sent. Returns false if the timeout elapsed;
    /// unfinished requests keep running detached.
    pub async fn finish_pending(&self, timeout: Duration) -> bool {
        let handles =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = tokio::time::timeout(timeout, async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "server logout task failed");
                }
            }
        })
        .await;
        drained.is_ok()
    }
}

impl std::fmt::Debug for AuthStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStateManager")
            .field("subscribers", &self.subscribers)
            .field("memo_window", &self.memo_window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ApiResponse, TransportFuture};
    use reqwest::{Method, StatusCode};
    use session_store::{
        ACCESS_TOKEN_KEY, MemoryStorage, REFRESH_TOKEN_KEY, SessionStorage, StorageFuture,
    };
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    enum Reply {
        Status(u16, String),
        Unreachable,
    }

    #[derive(Debug, Clone)]
    struct Call {
        method: Method,
        path: String,
        bearer: Option<String>,
        json: Option<serde_json::Value>,
    }

    /// Scripted transport: one reply per path, every request recorded.
    #[derive(Default)]
    struct StubTransport {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<Call>>,
        default_bearer: Mutex<Option<Secret<String>>>,
    }

    impl StubTransport {
        fn reply(&self, path: &str, status: u16, body: &str) {
            self.replies
                .lock()
                .unwrap()
                .insert(path.into(), Reply::Status(status, body.into()));
        }

        fn unreachable(&self, path: &str) {
            self.replies
                .lock()
                .unwrap()
                .insert(path.into(), Reply::Unreachable);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_to(&self, path: &str) -> usize {
            self.calls().iter().filter(|c| c.path == path).count()
        }
    }

    impl Transport for StubTransport {
        fn send(&self, request: ApiRequest) -> TransportFuture<'_> {
            let bearer = request
                .bearer
                .clone()
                .or_else(|| self.default_bearer())
                .map(|t| t.expose().clone());
            self.calls.lock().unwrap().push(Call {
                method: request.method.clone(),
                path: request.path.clone(),
                bearer,
                json: request.json.clone(),
            });
            let reply = self.replies.lock().unwrap().get(&request.path).cloned();
            Box::pin(async move {
                match reply {
                    Some(Reply::Status(status, body)) => Ok(ApiResponse::new(
                        StatusCode::from_u16(status).unwrap(),
                        body,
                    )),
                    Some(Reply::Unreachable) | None => {
                        Err(Error::Transport("connection refused".into()))
                    }
                }
            })
        }

        fn set_default_bearer(&self, token: &Secret<String>) {
            *self.default_bearer.lock().unwrap() = Some(token.clone());
        }

        fn clear_default_bearer(&self) {
            *self.default_bearer.lock().unwrap() = None;
        }

        fn default_bearer(&self) -> Option<Secret<String>> {
            self.default_bearer.lock().unwrap().clone()
        }
    }

    const ALICE_PROFILE: &str = r#"{"username":"alice","displayName":"Alice A.","role":"admin"}"#;
    const TOKENS: &str = r#"{"accessToken":"T1","refreshToken":"T2"}"#;

    fn alice() -> Identity {
        Identity::Authenticated {
            username: "alice".into(),
            display_name: "Alice A.".into(),
            role: "admin".into(),
        }
    }

    fn manager() -> (AuthStateManager, Arc<StubTransport>) {
        let transport = Arc::new(StubTransport::default());
        let manager = AuthStateManager::new(SessionStore::in_memory(), transport.clone());
        (manager, transport)
    }

    /// Memory storage whose reads yield after taking their value, so a
    /// concurrent transition can run between the read and its use. Writes to
    /// `refuse` fail.
    #[derive(Default)]
    struct ScriptedStorage {
        inner: MemoryStorage,
        yield_on_get: bool,
        refuse: Option<&'static str>,
    }

    impl SessionStorage for ScriptedStorage {
        fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
            Box::pin(async move {
                let value = self.inner.get(key).await;
                if self.yield_on_get {
                    tokio::task::yield_now().await;
                }
                value
            })
        }

        fn set<'a>(
            &'a self,
            key: &'a str,
            value: String,
        ) -> StorageFuture<'a, session_store::Result<()>> {
            if self.refuse == Some(key) {
                return Box::pin(async {
                    Err(session_store::Error::Io("disk full".into()))
                });
            }
            self.inner.set(key, value)
        }

        fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, session_store::Result<()>> {
            self.inner.remove(key)
        }
    }

    fn manager_over(storage: ScriptedStorage) -> (AuthStateManager, Arc<StubTransport>) {
        let transport = Arc::new(StubTransport::default());
        let store = SessionStore::new(Arc::new(storage));
        let manager = AuthStateManager::new(store, transport.clone());
        (manager, transport)
    }

    fn notification_counter(manager: &AuthStateManager) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        manager.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn no_token_returns_anonymous_without_request() {
        let (manager, transport) = manager();
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);

        let state = manager.get_current_state().await;

        assert_eq!(state.identity(), &Identity::Anonymous);
        assert!(transport.calls().is_empty(), "no request may be issued");
    }

    #[tokio::test]
    async fn empty_token_is_treated_as_no_session() {
        let (manager, transport) = manager();
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        manager
            .session_store()
            .set(ACCESS_TOKEN_KEY, String::new())
            .await
            .unwrap();

        assert!(!manager.get_current_state().await.is_authenticated());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn stored_token_is_sent_as_bearer_to_profile() {
        let (manager, transport) = manager();
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        manager
            .session_store()
            .store(&Credential::new("T1", "T2"))
            .await
            .unwrap();

        let state = manager.get_current_state().await;

        assert_eq!(state.into_identity(), alice());
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, Method::GET);
        assert_eq!(calls[0].path, "profile");
        assert_eq!(calls[0].bearer.as_deref(), Some("T1"));
        assert_eq!(
            transport.default_bearer().unwrap().expose(),
            "T1",
            "restoring a session sets the default bearer"
        );
    }

    #[tokio::test]
    async fn profile_401_is_anonymous_and_leaves_store_untouched() {
        let (manager, transport) = manager();
        transport.reply(PROFILE_ENDPOINT, 401, "Unauthorized");
        let store = manager.session_store();
        store.store(&Credential::new("T1", "T2")).await.unwrap();

        let state = manager.get_current_state().await;

        assert!(!state.is_authenticated());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).await.as_deref(), Some("T1"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await.as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn profile_failures_fold_into_anonymous() {
        let cases: [(&str, Option<(u16, &str)>); 5] = [
            ("unreachable", None),
            ("server error", Some((500, "boom"))),
            ("not json", Some((200, "<html>oops</html>"))),
            ("missing role", Some((200, r#"{"username":"alice","displayName":"A"}"#))),
            ("json array", Some((200, "[]"))),
        ];

        for (name, reply) in cases {
            let (manager, transport) = manager();
            match reply {
                Some((status, body)) => transport.reply(PROFILE_ENDPOINT, status, body),
                None => transport.unreachable(PROFILE_ENDPOINT),
            }
            manager
                .session_store()
                .store(&Credential::new("T1", "T2"))
                .await
                .unwrap();

            let state = manager.get_current_state().await;
            assert_eq!(state.identity(), &Identity::Anonymous, "case: {name}");
            assert!(
                manager.session_store().access_token().await.is_some(),
                "case {name}: failed derivation must not clear the session"
            );
        }
    }

    #[tokio::test]
    async fn derivation_is_repeatable() {
        let (manager, transport) = manager();
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        manager
            .session_store()
            .store(&Credential::new("T1", "T2"))
            .await
            .unwrap();

        let first = manager.get_current_state().await;
        let second = manager.get_current_state().await;
        assert_eq!(first, second);
        assert_eq!(transport.calls_to(PROFILE_ENDPOINT), 2, "no memo by default");
    }

    #[tokio::test]
    async fn login_then_state_is_authenticated() {
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);

        manager.login("alice", "secret").await.unwrap();
        let state = manager.get_current_state().await;

        assert_eq!(state.into_identity(), alice());
        let login_call = &transport.calls()[0];
        assert_eq!(login_call.method, Method::POST);
        assert_eq!(
            login_call.json,
            Some(serde_json::json!({"username": "alice", "password": "secret"}))
        );
        let store = manager.session_store();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).await.as_deref(), Some("T1"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await.as_deref(), Some("T2"));
        assert_eq!(transport.default_bearer().unwrap().expose(), "T1");
    }

    #[tokio::test]
    async fn rejected_login_reports_wrong_credentials_and_stores_nothing() {
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 401, "Invalid username or password");

        let err = manager.login("alice", "wrong").await.unwrap_err();

        assert_eq!(err, LoginFailure::WrongCredentials);
        assert_eq!(err.to_string(), "Wrong email or password");
        let store = manager.session_store();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).await, None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await, None);
        assert!(transport.default_bearer().is_none());
    }

    #[tokio::test]
    async fn unreachable_login_reports_connection_error() {
        let (manager, transport) = manager();
        transport.unreachable(LOGIN_ENDPOINT);

        let err = manager.login("alice", "secret").await.unwrap_err();

        assert_eq!(err.to_string(), "Connection error");
        assert!(manager.session_store().access_token().await.is_none());
    }

    #[tokio::test]
    async fn unreadable_login_body_stores_nothing() {
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 200, "User logged in");

        let err = manager.login("alice", "secret").await.unwrap_err();

        assert_eq!(err, LoginFailure::ConnectionError);
        assert!(manager.session_store().access_token().await.is_none());
    }

    #[tokio::test]
    async fn login_tolerates_missing_tokens() {
        let (manager, transport) = manager();
        transport.reply(
            LOGIN_ENDPOINT,
            200,
            r#"{"accessToken":"T1","tokenExpiryDate":"1735500000"}"#,
        );

        manager.login("alice", "secret").await.unwrap();

        let cred = manager.session_store().credential().await.unwrap();
        assert_eq!(cred.access_token.expose(), "T1");
        assert!(cred.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn login_then_logout_clears_tokens_and_bearer() {
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(LOGOUT_ENDPOINT, 200, "User logged out successfully");
        manager.login("alice", "secret").await.unwrap();

        manager.logout().await;

        let store = manager.session_store();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).await, None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await, None);
        assert!(transport.default_bearer().is_none());
    }

    #[tokio::test]
    async fn logout_notifies_server_with_the_ending_token() {
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(LOGOUT_ENDPOINT, 200, "User logged out successfully");
        manager.login("alice", "secret").await.unwrap();

        manager.logout().await;
        assert!(manager.finish_pending(Duration::from_secs(1)).await);

        let logout_call = transport
            .calls()
            .into_iter()
            .find(|c| c.path == LOGOUT_ENDPOINT)
            .expect("server logout must be attempted");
        assert_eq!(logout_call.method, Method::POST);
        assert_eq!(logout_call.bearer.as_deref(), Some("T1"));
        assert!(logout_call.json.is_none());
    }

    #[tokio::test]
    async fn logout_succeeds_when_server_is_unreachable() {
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        transport.unreachable(LOGOUT_ENDPOINT);
        manager.login("alice", "secret").await.unwrap();
        assert!(manager.get_current_state().await.is_authenticated());

        manager.logout().await;
        assert!(manager.finish_pending(Duration::from_secs(1)).await);

        assert!(manager.session_store().access_token().await.is_none());
        assert_eq!(
            manager.get_current_state().await.identity(),
            &Identity::Anonymous
        );
    }

    #[tokio::test]
    async fn state_after_logout_is_always_anonymous() {
        // Whatever happened before, logout ends in Anonymous even though the
        // profile endpoint would still answer for the old token.
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);

        manager.logout().await;
        assert!(!manager.get_current_state().await.is_authenticated());

        manager.login("alice", "secret").await.unwrap();
        manager.logout().await;
        manager.logout().await;
        assert!(!manager.get_current_state().await.is_authenticated());

        transport.reply(LOGIN_ENDPOINT, 401, "");
        let _ = manager.login("alice", "wrong").await;
        manager.logout().await;
        assert!(!manager.get_current_state().await.is_authenticated());
    }

    #[tokio::test]
    async fn notification_counts_per_operation() {
        let (manager, transport) = manager();
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        let count = notification_counter(&manager);

        transport.reply(LOGIN_ENDPOINT, 401, "");
        let _ = manager.login("alice", "wrong").await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "failed login");

        transport.unreachable(LOGIN_ENDPOINT);
        let _ = manager.login("alice", "secret").await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "unreachable login");

        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        manager.login("alice", "secret").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1, "successful login");

        manager.get_current_state().await;
        manager.get_current_state().await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "derivations never notify");

        manager.logout().await;
        assert_eq!(count.load(Ordering::SeqCst), 2, "logout");
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_new_state_on_requery() {
        let (manager, transport) = manager();
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        let manager = Arc::new(manager);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<usize>();
        for subscriber in 0..3 {
            let tx = tx.clone();
            manager.subscribe(move || {
                let _ = tx.send(subscriber);
            });
        }

        manager.login("alice", "secret").await.unwrap();

        let mut notified = Vec::new();
        while let Ok(subscriber) = rx.try_recv() {
            notified.push(subscriber);
            assert_eq!(manager.get_current_state().await.into_identity(), alice());
        }
        notified.sort();
        assert_eq!(notified, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unsubscribed_callbacks_are_not_notified() {
        let (manager, transport) = manager();
        transport.reply(LOGOUT_ENDPOINT, 200, "");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = manager.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(manager.subscriber_count(), 1);

        assert!(manager.unsubscribe(id));
        manager.logout().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(manager.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_derivations_are_independent() {
        let (manager, transport) = manager();
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        manager
            .session_store()
            .store(&Credential::new("T1", "T2"))
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            manager.get_current_state(),
            manager.get_current_state(),
            manager.get_current_state(),
        );

        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(transport.calls_to(PROFILE_ENDPOINT), 3);
    }

    #[tokio::test]
    async fn memo_window_reuses_recent_state() {
        let (manager, transport) = manager();
        let manager = manager.with_memo_window(Duration::from_secs(60));
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        manager
            .session_store()
            .store(&Credential::new("T1", "T2"))
            .await
            .unwrap();

        let first = manager.get_current_state().await;
        let second = manager.get_current_state().await;

        assert_eq!(first, second);
        assert_eq!(transport.calls_to(PROFILE_ENDPOINT), 1);
    }

    #[tokio::test]
    async fn login_and_logout_invalidate_the_memo() {
        let (manager, transport) = manager();
        let manager = manager.with_memo_window(Duration::from_secs(60));
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);

        assert!(!manager.get_current_state().await.is_authenticated());

        manager.login("alice", "secret").await.unwrap();
        assert!(
            manager.get_current_state().await.is_authenticated(),
            "login must discard the memoized anonymous state"
        );

        manager.logout().await;
        assert!(
            !manager.get_current_state().await.is_authenticated(),
            "logout must discard the memoized authenticated state"
        );
    }

    #[tokio::test]
    async fn zero_memo_window_disables_memoization() {
        let (manager, transport) = manager();
        let manager = manager.with_memo_window(Duration::ZERO);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        manager
            .session_store()
            .store(&Credential::new("T1", "T2"))
            .await
            .unwrap();

        manager.get_current_state().await;
        manager.get_current_state().await;
        assert_eq!(transport.calls_to(PROFILE_ENDPOINT), 2);
    }

    #[tokio::test]
    async fn derivation_overlapping_logout_does_not_restore_bearer() {
        let (manager, transport) = manager_over(ScriptedStorage {
            yield_on_get: true,
            ..Default::default()
        });
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        transport.reply(LOGOUT_ENDPOINT, 200, "User logged out successfully");
        manager.login("alice", "secret").await.unwrap();

        tokio::join!(manager.get_current_state(), manager.logout());

        assert_eq!(manager.session_store().access_token().await, None);
        assert!(
            transport.default_bearer().is_none(),
            "default bearer must stay cleared after logout"
        );
        assert!(!manager.get_current_state().await.is_authenticated());
    }

    #[tokio::test]
    async fn derivation_overlapping_login_keeps_the_new_bearer() {
        let (manager, transport) = manager_over(ScriptedStorage {
            yield_on_get: true,
            ..Default::default()
        });
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        transport.reply(PROFILE_ENDPOINT, 200, ALICE_PROFILE);
        manager
            .session_store()
            .store(&Credential::new("T0", "R0"))
            .await
            .unwrap();

        let (_, login) = tokio::join!(
            manager.get_current_state(),
            manager.login("alice", "secret")
        );

        login.unwrap();
        assert_eq!(transport.default_bearer().unwrap().expose(), "T1");
    }

    #[tokio::test]
    async fn login_storage_failure_keeps_previous_session() {
        let storage = ScriptedStorage {
            refuse: Some(REFRESH_TOKEN_KEY),
            ..Default::default()
        };
        storage.inner.set(ACCESS_TOKEN_KEY, "T0".into()).await.unwrap();
        storage.inner.set(REFRESH_TOKEN_KEY, "R0".into()).await.unwrap();
        let (manager, transport) = manager_over(storage);
        transport.reply(LOGIN_ENDPOINT, 200, TOKENS);
        let count = notification_counter(&manager);

        let result = manager.login("alice", "secret").await;

        assert_eq!(result, Err(LoginFailure::ConnectionError));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(transport.default_bearer().is_none());
        let store = manager.session_store();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).await.as_deref(), Some("T0"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await.as_deref(), Some("R0"));
    }

    #[test]
    fn memo_drops_results_from_before_invalidation() {
        let memo = Memo::default();
        let stale_generation = memo.generation.load(Ordering::Acquire);
        memo.invalidate_with(|| {});

        memo.store(stale_generation, &SessionState::new(alice()));
        assert!(memo.lookup(Duration::from_secs(60)).is_none());
    }

    /// End-to-end against a loopback API using the real HTTP transport.
    #[tokio::test]
    async fn http_login_profile_logout_roundtrip() {
        use axum::http::{HeaderMap, StatusCode as AxumStatus};
        use axum::routing::{get, post};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    "/login",
                    post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                        if body["username"] == "alice" && body["password"] == "secret" {
                            (AxumStatus::OK, TOKENS.to_string())
                        } else {
                            (AxumStatus::UNAUTHORIZED, "Invalid username or password".into())
                        }
                    }),
                )
                .route(
                    "/profile",
                    get(|headers: HeaderMap| async move {
                        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                            Some("Bearer T1") => (AxumStatus::OK, ALICE_PROFILE.to_string()),
                            _ => (AxumStatus::UNAUTHORIZED, "Unauthorized".to_string()),
                        }
                    }),
                )
                .route("/logout", post(|| async { "User logged out successfully" }));
            axum::serve(listener, app).await.unwrap();
        });

        let transport = Arc::new(crate::transport::HttpTransport::new(
            reqwest::Client::new(),
            format!("http://{addr}/"),
            Duration::from_secs(5),
        ));
        let manager = AuthStateManager::new(SessionStore::in_memory(), transport.clone());

        assert_eq!(
            manager.login("alice", "wrong").await,
            Err(LoginFailure::WrongCredentials)
        );
        assert!(!manager.get_current_state().await.is_authenticated());

        manager.login("alice", "secret").await.unwrap();
        assert_eq!(manager.get_current_state().await.into_identity(), alice());

        manager.logout().await;
        assert!(transport.default_bearer().is_none());
        assert!(!manager.get_current_state().await.is_authenticated());
    }
}
