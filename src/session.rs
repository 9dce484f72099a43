//! Session lifecycle: bootstrap, login, refresh, logout.
//!
//! [`SessionController`] is the only writer of the session store and the only
//! authority on whether a user is logged in. Consumers read its state through
//! [`SessionController::state`] or a [`watch`] subscription.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};

use crate::client::AuthApi;
use crate::error::Error;
use crate::guard::RouteGuard;
use crate::store::SessionStore;
use crate::types::{AccessToken, Credentials, PasswordChange, Profile, Registration, SessionRecord};

/// Authentication state published by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Bootstrap has not finished; no authorization decision may be made.
    Initializing,
    /// No session.
    Unauthenticated,
    /// No session, reached because a stored session could not be restored or refreshed.
    Failed,
    /// The server has confirmed the access token by returning this user's profile.
    Authenticated(SessionRecord),
}

impl SessionState {
    /// `true` until bootstrap completes.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Initializing)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// The in-memory user, when authenticated.
    #[must_use]
    pub fn user(&self) -> Option<&SessionRecord> {
        match self {
            Self::Authenticated(record) => Some(record),
            _ => None,
        }
    }
}

/// Owns the authentication state machine for one application run.
pub struct SessionController<A, S> {
    api: A,
    store: S,
    state: watch::Sender<SessionState>,
    bootstrapped: AtomicBool,
    /// Serializes token refreshes so concurrent 401s spend one refresh token.
    refreshing: Mutex<()>,
}

impl<A: AuthApi, S: SessionStore> SessionController<A, S> {
    /// Create a controller in the [`SessionState::Initializing`] state.
    ///
    /// Call [`bootstrap`](Self::bootstrap) once to restore any stored session.
    #[must_use]
    pub fn new(api: A, store: S) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self {
            api,
            store,
            state,
            bootstrapped: AtomicBool::new(false),
            refreshing: Mutex::new(()),
        }
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receive every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// A route guard following this controller.
    #[must_use]
    pub fn guard(&self) -> RouteGuard {
        RouteGuard::new(self.subscribe())
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading()
    }

    /// The in-memory user, when authenticated.
    #[must_use]
    pub fn current_user(&self) -> Option<SessionRecord> {
        self.state.borrow().user().cloned()
    }

    /// The auth service this controller talks to.
    #[must_use]
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Restore the stored session, validating its access token against the
    /// profile endpoint and refreshing it once if the server rejects it.
    ///
    /// Never fails: an unrestorable session is cleared and the controller
    /// ends in [`SessionState::Failed`]. Only the first call does any work;
    /// later calls return the current state.
    pub async fn bootstrap(&self) -> SessionState {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return self.state();
        }

        let next = match self.restore().await {
            Ok(Some(record)) => {
                tracing::info!(
                    username = record.profile.username().unwrap_or("<unknown>"),
                    "Session restored"
                );
                SessionState::Authenticated(record)
            }
            Ok(None) => SessionState::Unauthenticated,
            Err(e) => {
                tracing::warn!(error = %e, "Stored session could not be restored");
                self.clear_store();
                SessionState::Failed
            }
        };

        self.publish(next.clone());
        next
    }

    async fn restore(&self) -> Result<Option<SessionRecord>, Error> {
        let Some(record) = self.store.read()? else {
            return Ok(None);
        };

        match self.api.fetch_profile(&record.access).await {
            Ok(profile) => Ok(Some(record.hydrated(profile))),
            Err(e) if e.is_unauthorized() && !record.refresh.is_empty() => {
                tracing::info!("Access token rejected, refreshing once");
                let record = self.exchange(record).await?;
                self.store.write(&record)?;
                let profile = self.api.fetch_profile(&record.access).await?;
                Ok(Some(record.hydrated(profile)))
            }
            Err(e) => Err(e),
        }
    }

    /// Log in and hydrate the profile. Nothing is persisted unless both the
    /// login and the profile fetch succeed.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error. The store is left untouched, an
    /// authenticated session is kept and a controller still bootstrapping stays
    /// [`SessionState::Initializing`].
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionRecord, Error> {
        let result = async {
            let tokens = self.api.login(credentials).await?;
            let profile = self.api.fetch_profile(&tokens.access).await?;
            let record = SessionRecord::new(tokens).hydrated(profile);
            self.store.write(&record)?;
            Ok::<_, Error>(record)
        }
        .await;

        match result {
            Ok(record) => {
                tracing::info!(username = %credentials.username, "Login successful");
                self.publish(SessionState::Authenticated(record.clone()));
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(username = %credentials.username, error = %e, "Login failed");
                let settled = !matches!(
                    *self.state.borrow(),
                    SessionState::Initializing | SessionState::Authenticated(_)
                );
                if settled {
                    self.publish(SessionState::Unauthenticated);
                }
                Err(e)
            }
        }
    }

    /// Create an account. The session state is not affected.
    ///
    /// # Errors
    ///
    /// Propagates the auth service error.
    pub async fn register(&self, registration: &Registration) -> Result<Profile, Error> {
        match self.api.register(registration).await {
            Ok(profile) => {
                tracing::info!(username = %registration.username, "Registration successful");
                Ok(profile)
            }
            Err(e) => {
                tracing::warn!(
                    username = %registration.username,
                    error = %e,
                    "Registration failed"
                );
                Err(e)
            }
        }
    }

    /// Clear the stored and in-memory session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the slot could not be cleared. The
    /// in-memory state is [`SessionState::Unauthenticated`] either way.
    pub fn logout(&self) -> Result<(), Error> {
        // Publish before clearing: a refresh committing concurrently either
        // lands first and is cleared here, or sees the logout and backs off.
        if self.publish(SessionState::Unauthenticated) {
            tracing::info!("Logged out");
        }
        self.store.clear()
    }

    /// Run `op` with the current access token. If the service answers
    /// `Unauthorized`, refresh once and retry once.
    ///
    /// Concurrent callers rejected with the same token share a single refresh.
    /// A failed refresh, or a refreshed token that is rejected too, ends the
    /// session in [`SessionState::Failed`]. A session that was logged out or
    /// replaced while `op` ran is never brought back.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] when there is no session, otherwise the error of
    /// `op` or of the refresh.
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T, Error>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let Some(record) = self.current_user() else {
            return Err(no_session());
        };

        let rejected = record.access;
        match op(rejected.clone()).await {
            Err(e) if e.is_unauthorized() => {
                tracing::info!(error = %e, "Request rejected, refreshing access token");
            }
            other => return other,
        }

        let access = self.renew(&rejected).await?;

        let result = op(access.clone()).await;
        if matches!(&result, Err(e) if e.is_unauthorized()) {
            tracing::warn!("Refreshed access token rejected");
            self.end_session(&access);
        }
        result
    }

    /// Change the current user's password.
    ///
    /// # Errors
    ///
    /// See [`authorized`](Self::authorized) and [`AuthApi::change_password`].
    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), Error> {
        change.validate()?;
        let api = &self.api;
        self.authorized(|access| async move { api.change_password(&access, change).await })
            .await
    }

    /// Replace the `rejected` access token, refreshing only if no other
    /// caller already has.
    async fn renew(&self, rejected: &AccessToken) -> Result<AccessToken, Error> {
        let _refreshing = self.refreshing.lock().await;

        let Some(current) = self.current_user() else {
            return Err(no_session());
        };
        if current.access != *rejected {
            tracing::debug!("Access token already refreshed");
            return Ok(current.access);
        }
        if current.refresh.is_empty() {
            self.end_session(rejected);
            return Err(Error::Unauthorized {
                operation: "token refresh",
            });
        }

        let refreshed = match self.exchange(current).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed");
                self.end_session(rejected);
                return Err(e);
            }
        };
        let access = refreshed.access.clone();
        self.commit(rejected, refreshed)?;
        Ok(access)
    }

    /// Exchange the refresh token for a new access token. The refresh token is
    /// kept unless the server rotated it.
    async fn exchange(&self, mut record: SessionRecord) -> Result<SessionRecord, Error> {
        let refreshed = self.api.refresh_access_token(&record.refresh).await?;
        record.access = refreshed.access;
        if let Some(rotated) = refreshed.refresh {
            record.refresh = rotated;
        }
        tracing::debug!("Access token refreshed");
        Ok(record)
    }

    /// Persist and publish `record` if the session still holds `replaced`.
    fn commit(&self, replaced: &AccessToken, record: SessionRecord) -> Result<(), Error> {
        let mut outcome = Err(no_session());
        self.state.send_if_modified(|current| {
            if !holds(current, replaced) {
                return false;
            }
            if let Err(e) = self.store.write(&record) {
                outcome = Err(e);
                return false;
            }
            *current = SessionState::Authenticated(record);
            outcome = Ok(());
            true
        });
        if outcome.is_err() {
            tracing::info!("Session changed during refresh, discarding new token");
        }
        outcome
    }

    /// Logout reached through a failure, unless the session holding `access`
    /// is already gone.
    fn end_session(&self, access: &AccessToken) {
        self.state.send_if_modified(|current| {
            if !holds(current, access) {
                return false;
            }
            self.clear_store();
            *current = SessionState::Failed;
            true
        });
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            tracing::error!(error = %e, "Failed to clear session store");
        }
    }

    /// Replace the state, notifying subscribers only on an actual change.
    fn publish(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

fn holds(state: &SessionState, access: &AccessToken) -> bool {
    matches!(state, SessionState::Authenticated(record) if record.access == *access)
}

fn no_session() -> Error {
    Error::Unauthorized {
        operation: "session",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tokio::sync::{Barrier, Notify};

    use super::*;
    use crate::error::ErrorKind;
    use crate::guard::{Decision, Route};
    use crate::store::MemorySessionStore;
    use crate::types::{RefreshToken, RefreshedToken, TokenPair};

    /// Canned reply for one scripted call.
    #[derive(Debug, Clone)]
    pub(crate) enum Reply<T> {
        Ok(T),
        Unauthorized,
        InvalidCredentials,
        ServerError,
    }

    impl<T> Reply<T> {
        fn into_result(self, operation: &'static str) -> Result<T, Error> {
            match self {
                Self::Ok(value) => Ok(value),
                Self::Unauthorized => Err(Error::Unauthorized { operation }),
                Self::InvalidCredentials => Err(Error::InvalidCredentials),
                Self::ServerError => Err(Error::Api {
                    operation,
                    status: 500,
                    detail: "scripted failure".into(),
                }),
            }
        }
    }

    /// Scripted auth service recording every call as `"<op>:<token>"`.
    #[derive(Debug)]
    pub(crate) struct ScriptedApi {
        login: Reply<TokenPair>,
        register: Reply<Profile>,
        profiles: HashMap<String, Reply<Profile>>,
        refresh: Reply<RefreshedToken>,
        passwords: HashMap<String, Reply<()>>,
        refresh_gate: Option<Arc<Notify>>,
        calls: Mutex<Vec<String>>,
    }

    impl Default for ScriptedApi {
        fn default() -> Self {
            Self {
                login: Reply::InvalidCredentials,
                register: Reply::ServerError,
                profiles: HashMap::new(),
                refresh: Reply::Unauthorized,
                passwords: HashMap::new(),
                refresh_gate: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScriptedApi {
        pub(crate) fn on_login(mut self, reply: Reply<TokenPair>) -> Self {
            self.login = reply;
            self
        }

        pub(crate) fn on_register(mut self, reply: Reply<Profile>) -> Self {
            self.register = reply;
            self
        }

        /// Profile reply for one access token; unknown tokens are `Unauthorized`.
        pub(crate) fn on_profile(mut self, access: &str, reply: Reply<Profile>) -> Self {
            self.profiles.insert(access.into(), reply);
            self
        }

        pub(crate) fn on_refresh(mut self, reply: Reply<RefreshedToken>) -> Self {
            self.refresh = reply;
            self
        }

        pub(crate) fn on_password(mut self, access: &str, reply: Reply<()>) -> Self {
            self.passwords.insert(access.into(), reply);
            self
        }

        /// Hold every refresh request open until `gate` is notified.
        pub(crate) fn gate_refresh(mut self, gate: Arc<Notify>) -> Self {
            self.refresh_gate = Some(gate);
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl AuthApi for ScriptedApi {
        async fn register(&self, registration: &Registration) -> Result<Profile, Error> {
            self.record(format!("register:{}", registration.username));
            self.register.clone().into_result("register")
        }

        async fn login(&self, credentials: &Credentials) -> Result<TokenPair, Error> {
            self.record(format!("login:{}", credentials.username));
            self.login.clone().into_result("login")
        }

        async fn fetch_profile(&self, access: &AccessToken) -> Result<Profile, Error> {
            self.record(format!("profile:{}", access.as_str()));
            self.profiles
                .get(access.as_str())
                .cloned()
                .unwrap_or(Reply::Unauthorized)
                .into_result("profile")
        }

        async fn refresh_access_token(
            &self,
            refresh: &RefreshToken,
        ) -> Result<RefreshedToken, Error> {
            self.record(format!("refresh:{}", refresh.as_str()));
            if let Some(gate) = &self.refresh_gate {
                gate.notified().await;
            }
            self.refresh.clone().into_result("token refresh")
        }

        async fn change_password(
            &self,
            access: &AccessToken,
            _change: &PasswordChange,
        ) -> Result<(), Error> {
            self.record(format!("password:{}", access.as_str()));
            self.passwords
                .get(access.as_str())
                .cloned()
                .unwrap_or(Reply::Unauthorized)
                .into_result("change password")
        }
    }

    pub(crate) fn stored(access: &str, refresh: &str) -> SessionRecord {
        SessionRecord::new(TokenPair {
            access: access.into(),
            refresh: refresh.into(),
        })
    }

    fn named(name: &str) -> Profile {
        Profile::new().with("name", name)
    }

    fn pair(access: &str, refresh: &str) -> TokenPair {
        TokenPair {
            access: access.into(),
            refresh: refresh.into(),
        }
    }

    fn rotated(access: &str) -> RefreshedToken {
        RefreshedToken {
            access: access.into(),
            refresh: None,
        }
    }

    type Controller = SessionController<ScriptedApi, Arc<MemorySessionStore>>;

    fn controller(api: ScriptedApi, store: &Arc<MemorySessionStore>) -> Controller {
        SessionController::new(api, Arc::clone(store))
    }

    #[tokio::test]
    async fn empty_store_bootstraps_unauthenticated_without_network() {
        let store = Arc::new(MemorySessionStore::new());
        let ctl = controller(ScriptedApi::default(), &store);
        assert!(ctl.is_loading());

        let state = ctl.bootstrap().await;

        assert_eq!(state, SessionState::Unauthenticated);
        assert!(!ctl.is_loading());
        assert!(ctl.api().calls().is_empty());
    }

    #[tokio::test]
    async fn valid_token_bootstraps_authenticated() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default().on_profile("T1", Reply::Ok(named("Alice")));
        let ctl = controller(api, &store);

        ctl.bootstrap().await;

        let user = ctl.current_user().unwrap();
        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            json!({"access": "T1", "refresh": "R1", "name": "Alice"})
        );
        assert_eq!(ctl.api().calls(), vec!["profile:T1"]);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_profile_retried() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Unauthorized)
            .on_refresh(Reply::Ok(rotated("T2")))
            .on_profile("T2", Reply::Ok(named("Bob")));
        let ctl = controller(api, &store);

        let state = ctl.bootstrap().await;

        assert!(state.is_authenticated());
        assert_eq!(
            state.user().unwrap().profile.get("name"),
            Some(&json!("Bob"))
        );
        let persisted = store.read().unwrap().unwrap();
        assert_eq!(persisted.access.as_str(), "T2");
        assert_eq!(persisted.refresh.as_str(), "R1");
        assert_eq!(
            ctl.api().calls(),
            vec!["profile:T1", "refresh:R1", "profile:T2"]
        );
    }

    #[tokio::test]
    async fn failed_refresh_is_attempted_once_then_logs_out() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Unauthorized)
            .on_refresh(Reply::Unauthorized);
        let ctl = controller(api, &store);

        let state = ctl.bootstrap().await;

        assert_eq!(state, SessionState::Failed);
        assert!(!state.is_authenticated());
        assert!(store.read().unwrap().is_none());
        let refreshes = ctl
            .api()
            .calls()
            .iter()
            .filter(|c| c.starts_with("refresh:"))
            .count();
        assert_eq!(refreshes, 1);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_persisted() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_refresh(Reply::Ok(RefreshedToken {
                access: "T2".into(),
                refresh: Some("R2".into()),
            }))
            .on_profile("T2", Reply::Ok(named("Bob")));
        let ctl = controller(api, &store);

        assert!(ctl.bootstrap().await.is_authenticated());

        let persisted = store.read().unwrap().unwrap();
        assert_eq!(persisted.access.as_str(), "T2");
        assert_eq!(persisted.refresh.as_str(), "R2");
        assert_eq!(ctl.current_user().unwrap().refresh.as_str(), "R2");
    }

    #[tokio::test]
    async fn refreshed_token_rejected_again_logs_out() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Unauthorized)
            .on_refresh(Reply::Ok(rotated("T2")))
            .on_profile("T2", Reply::Unauthorized);
        let ctl = controller(api, &store);

        assert_eq!(ctl.bootstrap().await, SessionState::Failed);
        assert!(store.read().unwrap().is_none());
        assert_eq!(
            ctl.api().calls(),
            vec!["profile:T1", "refresh:R1", "profile:T2"]
        );
    }

    #[tokio::test]
    async fn server_error_during_bootstrap_logs_out_without_refresh() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default().on_profile("T1", Reply::ServerError);
        let ctl = controller(api, &store);

        assert_eq!(ctl.bootstrap().await, SessionState::Failed);
        assert!(store.read().unwrap().is_none());
        assert_eq!(ctl.api().calls(), vec!["profile:T1"]);
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_refresh() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "")));
        let ctl = controller(ScriptedApi::default(), &store);

        assert_eq!(ctl.bootstrap().await, SessionState::Failed);
        assert_eq!(ctl.api().calls(), vec!["profile:T1"]);
    }

    #[tokio::test]
    async fn bootstrap_runs_once() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default().on_profile("T1", Reply::Ok(named("Alice")));
        let ctl = controller(api, &store);

        ctl.bootstrap().await;
        ctl.logout().unwrap();
        let second = ctl.bootstrap().await;

        assert_eq!(second, SessionState::Unauthenticated);
        assert_eq!(ctl.api().calls(), vec!["profile:T1"]);
    }

    #[tokio::test]
    async fn login_persists_merged_record() {
        let store = Arc::new(MemorySessionStore::new());
        let api = ScriptedApi::default()
            .on_login(Reply::Ok(pair("T1", "R1")))
            .on_profile("T1", Reply::Ok(named("Alice")));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        let record = ctl.login(&Credentials::new("alice", "pw")).await.unwrap();

        assert!(ctl.is_authenticated());
        assert_eq!(store.read().unwrap(), Some(record.clone()));
        assert_eq!(record.profile.get("name"), Some(&json!("Alice")));
    }

    #[tokio::test]
    async fn rejected_login_leaves_store_untouched() {
        let store = Arc::new(MemorySessionStore::new());
        let ctl = controller(ScriptedApi::default(), &store);
        ctl.bootstrap().await;

        let err = ctl.login(&Credentials::new("x", "y")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        assert_eq!(ctl.state(), SessionState::Unauthenticated);
        assert!(store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn login_with_failed_profile_persists_nothing() {
        let before = stored("OLD", "OLDR");
        let store = Arc::new(MemorySessionStore::with_record(before.clone()));
        let api = ScriptedApi::default()
            .on_login(Reply::Ok(pair("T1", "R1")))
            .on_profile("T1", Reply::ServerError);
        let ctl = controller(api, &store);

        assert!(ctl.login(&Credentials::new("x", "y")).await.is_err());

        assert_eq!(store.read().unwrap(), Some(before));
        assert!(ctl.is_loading());
    }

    #[tokio::test]
    async fn failed_login_during_bootstrap_keeps_loading() {
        let store = Arc::new(MemorySessionStore::new());
        let ctl = controller(ScriptedApi::default(), &store);
        let guard = ctl.guard();

        assert!(ctl.login(&Credentials::new("x", "y")).await.is_err());

        assert!(ctl.is_loading());
        assert_eq!(guard.decide(Route::Dashboard), Decision::Pending);

        ctl.bootstrap().await;
        assert_eq!(ctl.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default().on_profile("T1", Reply::Ok(named("Alice")));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        ctl.logout().unwrap();
        let once = (ctl.state(), store.read().unwrap());
        ctl.logout().unwrap();
        let twice = (ctl.state(), store.read().unwrap());

        assert_eq!(once, twice);
        assert_eq!(twice, (SessionState::Unauthenticated, None));
    }

    #[tokio::test]
    async fn register_does_not_touch_session() {
        let store = Arc::new(MemorySessionStore::new());
        let api = ScriptedApi::default().on_register(Reply::Ok(Profile::new().with("id", 9)));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        let profile = ctl
            .register(&Registration::new("eng", "hunter22"))
            .await
            .unwrap();

        assert_eq!(profile.id(), Some(9));
        assert_eq!(ctl.state(), SessionState::Unauthenticated);
        assert!(store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn subscribers_see_bootstrap_and_logout() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default().on_profile("T1", Reply::Ok(named("Alice")));
        let ctl = controller(api, &store);
        let mut rx = ctl.subscribe();

        ctl.bootstrap().await;
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_authenticated());

        ctl.logout().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Unauthenticated);

        // A redundant logout publishes nothing.
        ctl.logout().unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn authorized_refreshes_once_and_retries() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Ok(named("Alice")))
            .on_refresh(Reply::Ok(rotated("T2")))
            .on_password("T2", Reply::Ok(()));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        ctl.change_password(&PasswordChange::new("old", "new-secret", "new-secret"))
            .await
            .unwrap();

        assert_eq!(
            ctl.api().calls(),
            vec!["profile:T1", "password:T1", "refresh:R1", "password:T2"]
        );
        assert_eq!(ctl.current_user().unwrap().access.as_str(), "T2");
        assert_eq!(store.read().unwrap().unwrap().access.as_str(), "T2");
    }

    #[tokio::test]
    async fn authorized_logs_out_when_refresh_fails() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default().on_profile("T1", Reply::Ok(named("Alice")));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        let err = ctl
            .change_password(&PasswordChange::new("old", "new-secret", "new-secret"))
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(ctl.state(), SessionState::Failed);
        assert!(store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn authorized_passes_other_errors_through() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Ok(named("Alice")))
            .on_password("T1", Reply::InvalidCredentials);
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        let err = ctl
            .change_password(&PasswordChange::new("wrong", "new-secret", "new-secret"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        assert!(ctl.is_authenticated());
        assert!(!ctl.api().calls().iter().any(|c| c.starts_with("refresh:")));
    }

    #[tokio::test]
    async fn authorized_without_refresh_token_logs_out() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "")));
        let api = ScriptedApi::default().on_profile("T1", Reply::Ok(named("Alice")));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;
        assert!(ctl.is_authenticated());

        let err = ctl
            .change_password(&PasswordChange::new("old", "new-secret", "new-secret"))
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(ctl.state(), SessionState::Failed);
        assert!(store.read().unwrap().is_none());
        assert!(!ctl.api().calls().iter().any(|c| c.starts_with("refresh:")));
    }

    #[tokio::test]
    async fn logout_during_request_is_not_undone() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Ok(named("Alice")))
            .on_refresh(Reply::Ok(rotated("T2")));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        let gate = Notify::new();
        let attempts = AtomicUsize::new(0);
        let op = |_access: AccessToken| {
            let (attempts, gate) = (&attempts, &gate);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Err::<(), _>(no_session())
            }
        };

        let (result, ()) = tokio::join!(ctl.authorized(op), async {
            while attempts.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            ctl.logout().unwrap();
            gate.notify_one();
        });

        assert!(result.unwrap_err().is_unauthorized());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.state(), SessionState::Unauthenticated);
        assert!(store.read().unwrap().is_none());
        assert!(!ctl.api().calls().iter().any(|c| c.starts_with("refresh:")));
    }

    #[tokio::test]
    async fn logout_during_refresh_discards_new_token() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let gate = Arc::new(Notify::new());
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Ok(named("Alice")))
            .on_refresh(Reply::Ok(rotated("T2")))
            .on_password("T2", Reply::Ok(()))
            .gate_refresh(Arc::clone(&gate));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        let change = PasswordChange::new("old", "new-secret", "new-secret");
        let (result, ()) = tokio::join!(ctl.change_password(&change), async {
            while !ctl.api().calls().iter().any(|c| c == "refresh:R1") {
                tokio::task::yield_now().await;
            }
            ctl.logout().unwrap();
            gate.notify_one();
        });

        assert!(result.unwrap_err().is_unauthorized());
        assert_eq!(ctl.state(), SessionState::Unauthenticated);
        assert!(store.read().unwrap().is_none());
        assert!(!ctl.api().calls().iter().any(|c| c == "password:T2"));
    }

    #[tokio::test]
    async fn concurrent_rejections_share_one_refresh() {
        let store = Arc::new(MemorySessionStore::with_record(stored("T1", "R1")));
        let api = ScriptedApi::default()
            .on_profile("T1", Reply::Ok(named("Alice")))
            .on_refresh(Reply::Ok(rotated("T2")))
            .on_password("T2", Reply::Ok(()));
        let ctl = controller(api, &store);
        ctl.bootstrap().await;

        // Both first attempts are rejected before either caller refreshes.
        let barrier = Barrier::new(2);
        let change = PasswordChange::new("old", "new-secret", "new-secret");
        let op = |access: AccessToken| {
            let (barrier, api, change) = (&barrier, ctl.api(), &change);
            async move {
                let result = api.change_password(&access, change).await;
                if access.as_str() == "T1" {
                    barrier.wait().await;
                }
                result
            }
        };

        let (first, second) = tokio::join!(ctl.authorized(&op), ctl.authorized(&op));

        first.unwrap();
        second.unwrap();
        let refreshes = ctl
            .api()
            .calls()
            .iter()
            .filter(|c| c.starts_with("refresh:"))
            .count();
        assert_eq!(refreshes, 1);
        assert!(ctl.is_authenticated());
        assert_eq!(store.read().unwrap().unwrap().access.as_str(), "T2");
    }

    #[tokio::test]
    async fn authorized_without_session_is_unauthorized() {
        let store = Arc::new(MemorySessionStore::new());
        let ctl = controller(ScriptedApi::default(), &store);
        ctl.bootstrap().await;

        let err = ctl
            .authorized(|_access| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn corrupt_store_fails_bootstrap() {
        struct BrokenStore;

        impl SessionStore for BrokenStore {
            fn read(&self) -> Result<Option<SessionRecord>, Error> {
                Err(Error::Store("corrupt".into()))
            }
            fn write(&self, _record: &SessionRecord) -> Result<(), Error> {
                Ok(())
            }
            fn clear(&self) -> Result<(), Error> {
                Ok(())
            }
        }

        let ctl = SessionController::new(ScriptedApi::default(), BrokenStore);
        assert_eq!(ctl.bootstrap().await, SessionState::Failed);
        assert!(!ctl.is_loading());
    }
}
