//! Authentication state and the one-time work that follows a login.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use client_core::grpc::TokenSink;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::UserProfile;
use crate::services::{AuthTokenProvider, AuthUser, EntitlementProvider, PlannerBackend, Preferences};
use crate::store::DataStores;

/// Account data migration this client expects to have run.
pub const CURRENT_MIGRATION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Session restoration has not finished yet.
    #[default]
    Unknown,
    Authenticated(AuthUser),
    Unauthenticated,
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            AuthState::Authenticated(user) => Some(user),
            _ => None,
        }
    }
}

/// Push registration for this device.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistration {
    pub push_token: Option<String>,
    pub platform: String,
}

pub struct SessionController {
    tokens: Arc<dyn TokenSink>,
    auth: Arc<dyn AuthTokenProvider>,
    backend: Arc<dyn PlannerBackend>,
    stores: Arc<DataStores>,
    preferences: Preferences,
    device: DeviceRegistration,
    entitlements: Option<Arc<dyn EntitlementProvider>>,
    state_tx: watch::Sender<AuthState>,
    profile: RwLock<Option<UserProfile>>,
    /// Cancelled when the session that owns the running post-auth task ends.
    /// Held while that task commits anything, and while a session is torn down.
    session: Mutex<Option<CancellationToken>>,
}

impl SessionController {
    pub fn new(
        tokens: Arc<dyn TokenSink>,
        auth: Arc<dyn AuthTokenProvider>,
        backend: Arc<dyn PlannerBackend>,
        stores: Arc<DataStores>,
        preferences: Preferences,
        device: DeviceRegistration,
    ) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Unknown);
        Self {
            tokens,
            auth,
            backend,
            stores,
            preferences,
            device,
            entitlements: None,
            state_tx,
            profile: RwLock::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn with_entitlements(mut self, entitlements: Arc<dyn EntitlementProvider>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    pub fn state(&self) -> AuthState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    /// Profile fetched after the last login.
    pub fn current_user(&self) -> Option<UserProfile> {
        self.profile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait for the provider to finish restoring a persisted session, then
    /// leave the `Unknown` state.
    pub async fn restore(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let next = match self.auth.restored_user().await {
            Some(user) => AuthState::Authenticated(user),
            None => AuthState::Unauthenticated,
        };
        self.on_auth_state_changed(next)
    }

    /// Record a transition. Entering `Authenticated` (or switching users)
    /// starts the post-login steps and returns their task; leaving it clears
    /// the token and every cache. Repeating the current state does nothing.
    pub fn on_auth_state_changed(self: &Arc<Self>, next: AuthState) -> Option<JoinHandle<()>> {
        let previous = self.state_tx.send_replace(next.clone());

        match (&previous, &next) {
            (AuthState::Authenticated(before), AuthState::Authenticated(after)) if before.id == after.id => None,
            (AuthState::Authenticated(before), AuthState::Authenticated(after)) => {
                tracing::info!(from = %before.id, to = %after.id, "Signed-in user changed");
                self.end_session();
                Some(self.begin_session(after.clone()))
            }
            (_, AuthState::Authenticated(user)) => {
                tracing::info!(user_id = %user.id, "Signed in");
                Some(self.begin_session(user.clone()))
            }
            (AuthState::Authenticated(user), _) => {
                tracing::info!(user_id = %user.id, "Signed out");
                self.end_session();
                None
            }
            _ => None,
        }
    }

    /// A rotated token for the same user: pushed to the connection, no side effects.
    pub fn token_refreshed(&self, token: String) {
        self.tokens.set_token(Some(token));
    }

    pub fn logout(self: &Arc<Self>) {
        self.on_auth_state_changed(AuthState::Unauthenticated);
    }

    fn begin_session(self: &Arc<Self>, user: AuthUser) -> JoinHandle<()> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.lock_session().replace(cancel.clone()) {
            previous.cancel();
        }

        self.stores.set_feed_owner(Some(user.id.clone()));
        if let Some(entitlements) = &self.entitlements {
            entitlements.identify(Some(user.id.clone()));
        }

        let session = self.clone();
        tokio::spawn(async move { session.run_post_auth(user, cancel).await })
    }

    fn end_session(&self) {
        let mut current = self.lock_session();
        if let Some(cancel) = current.take() {
            cancel.cancel();
        }

        self.tokens.set_token(None);
        self.stores.set_feed_owner(None);
        self.stores.clear_all();
        *self.profile.write().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(entitlements) = &self.entitlements {
            entitlements.identify(None);
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `commit` only if `cancel` still belongs to a live session. Holds the
    /// session lock so `end_session` cannot interleave.
    fn commit_if_current(&self, cancel: &CancellationToken, commit: impl FnOnce()) -> bool {
        let _session = self.lock_session();
        if cancel.is_cancelled() {
            return false;
        }
        commit();
        true
    }

    /// Token, migration, profile, device registration, in that order. A failed
    /// step is logged and does not stop the ones after it. Ending the session
    /// stops the remaining steps and discards any result not yet committed.
    async fn run_post_auth(&self, user: AuthUser, cancel: CancellationToken) {
        let Some(token) = until_cancelled(&cancel, self.auth.current_token()).await else {
            return;
        };
        if token.is_none() {
            tracing::warn!(user_id = %user.id, "Signed in without a token");
        }
        if !self.commit_if_current(&cancel, || self.tokens.set_token(token)) {
            tracing::debug!(user_id = %user.id, "Session ended before token was applied");
            return;
        }

        if until_cancelled(&cancel, self.run_migration()).await.is_none() {
            return;
        }

        match until_cancelled(&cancel, self.backend.fetch_profile()).await {
            None => return,
            Some(Ok(profile)) => {
                let user_id = profile.id.clone();
                let stored = self.commit_if_current(&cancel, || {
                    *self.profile.write().unwrap_or_else(|e| e.into_inner()) = Some(profile);
                });
                if !stored {
                    return;
                }
                tracing::info!(user_id = %user_id, "Profile loaded");
            }
            Some(Err(err)) => tracing::warn!(error = %err, "Profile fetch failed"),
        }

        match &self.device.push_token {
            Some(push_token) => {
                let registration = self
                    .backend
                    .register_device(push_token, &self.device.platform);
                match until_cancelled(&cancel, registration).await {
                    None => return,
                    Some(Ok(())) => tracing::info!(platform = %self.device.platform, "Device registered"),
                    Some(Err(err)) => tracing::warn!(error = %err, "Device registration failed"),
                }
            }
            None => tracing::debug!("No push token, skipping device registration"),
        }

        if let Some(entitlements) = &self.entitlements {
            if let Some(Err(err)) = until_cancelled(&cancel, entitlements.status()).await {
                tracing::warn!(error = %err, "Entitlement status unavailable");
            }
        }
    }

    async fn run_migration(&self) {
        if self.preferences.is_migrated_to(CURRENT_MIGRATION_VERSION) {
            tracing::debug!("Account migration already complete");
            return;
        }

        let from_version = self.preferences.migration_version().unwrap_or(0);
        match self.backend.migrate_account(from_version).await {
            Ok(version) => {
                self.preferences.mark_migration_completed(version);
                tracing::info!(from_version, version, "Account migration complete");
            }
            Err(err) => tracing::warn!(error = %err, "Account migration failed, will retry next login"),
        }
    }
}

/// `None` if `cancel` fires first.
async fn until_cancelled<T>(cancel: &CancellationToken, step: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = step => Some(value),
    }
}
