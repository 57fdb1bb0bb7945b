//! Composition root: builds the connection, retry executor, stores, listener
//! and session from configuration and owns them for the process lifetime.

use crate::config::PlannerConfig;
use crate::invalidation::{InvalidationEvent, InvalidationListener};
use crate::services::{
    AuthTokenProvider, EntitlementProvider, GrpcPlannerBackend, HttpEntitlementProvider,
    PlannerBackend, Preferences, StaticTokenProvider,
};
use crate::session::{DeviceRegistration, SessionController};
use crate::store::DataStores;
use client_core::error::{AppError, RpcError};
use client_core::grpc::{ConnectionManager, RetryExecutor, RetryPolicy, StreamingLoader, TokenSink};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Queue depth between the push adapter and the invalidation listener.
const INVALIDATION_QUEUE_SIZE: usize = 64;

/// Application container for the client's long-lived components.
pub struct Application {
    connection: Arc<ConnectionManager>,
    stores: Arc<DataStores>,
    session: Arc<SessionController>,
    listener: Arc<InvalidationListener>,
    invalidation_tx: mpsc::Sender<InvalidationEvent>,
    invalidation_rx: mpsc::Receiver<InvalidationEvent>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration and connect.
    pub async fn build(config: PlannerConfig) -> Result<Self, AppError> {
        let auth: Arc<dyn AuthTokenProvider> = Arc::new(StaticTokenProvider::new(
            config.auth.static_token.clone(),
            config.auth.user_id.clone(),
        ));
        Self::build_with_auth(config, auth).await
    }

    /// Build with a caller-supplied token provider.
    pub async fn build_with_auth(
        config: PlannerConfig,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Result<Self, AppError> {
        let connection_config = config.common.connection.clone();
        connection_config
            .validate()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let connection = Arc::new(ConnectionManager::new());
        connection
            .connect(connection_config.clone())
            .await
            .map_err(|e| {
                tracing::error!(
                    "Failed to connect to {}: {}",
                    connection_config.endpoint_uri(),
                    e
                );
                e
            })?;

        let tokens: Arc<dyn TokenSink> = connection.clone();
        let retry = Arc::new(RetryExecutor::new(tokens.clone()));
        let refresher = auth.clone();
        retry.set_token_refresh_handler(move || {
            let auth = refresher.clone();
            async move { auth.force_refresh().await.map_err(RpcError::from) }
        });
        retry.set_on_retry_exhausted(|err, calls| {
            tracing::error!(error = %err, calls, "Giving up on remote call");
        });

        let streaming = StreamingLoader::new(connection.clone()).with_cancel_hook(Arc::new(|| {
            tracing::debug!("Stream abandoned before completion");
        }));
        let backend: Arc<dyn PlannerBackend> = Arc::new(GrpcPlannerBackend::new(
            connection.clone(),
            retry,
            streaming,
            RetryPolicy::from(&config.common.retry),
        ));

        let stores = Arc::new(DataStores::new(backend.clone()));
        let listener = Arc::new(InvalidationListener::new(stores.clone()));

        let device = DeviceRegistration {
            push_token: config.device.push_token.clone(),
            platform: config.device.platform.clone(),
        };
        let mut session = SessionController::new(
            tokens,
            auth,
            backend,
            stores.clone(),
            Preferences::in_memory(),
            device,
        );
        if let Some(entitlements) = config.entitlements.clone() {
            tracing::info!(base_url = %entitlements.base_url, "Entitlement checks enabled");
            let provider: Arc<dyn EntitlementProvider> =
                Arc::new(HttpEntitlementProvider::new(entitlements));
            session = session.with_entitlements(provider);
        }

        let (invalidation_tx, invalidation_rx) = mpsc::channel(INVALIDATION_QUEUE_SIZE);

        Ok(Self {
            connection,
            stores,
            session: Arc::new(session),
            listener,
            invalidation_tx,
            invalidation_rx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn stores(&self) -> &Arc<DataStores> {
        &self.stores
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    /// Handle for the push adapter to deliver invalidations.
    pub fn invalidation_sender(&self) -> mpsc::Sender<InvalidationEvent> {
        self.invalidation_tx.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Restore the session, warm the feed and process invalidations until
    /// `signal` resolves.
    pub async fn run_until_stopped<S>(self, signal: S) -> Result<(), AppError>
    where
        S: Future<Output = ()>,
    {
        let listener_task = tokio::spawn(
            self.listener
                .clone()
                .run(self.invalidation_rx, self.shutdown.clone()),
        );

        if let Some(post_auth) = self.session.restore().await {
            if let Err(e) = post_auth.await {
                tracing::error!("Post-login task failed: {}", e);
            }
        }

        if self.stores.feed_owner().is_some() {
            let outcome = self
                .stores
                .load_feed_progressive(|events| {
                    tracing::info!(loaded = events.len(), "Feed updated");
                })
                .await;
            tracing::info!(outcome = ?outcome, "Feed load finished");
        }

        signal.await;

        self.shutdown.cancel();
        if let Err(e) = listener_task.await {
            tracing::error!("Invalidation listener failed: {}", e);
        }
        self.connection.disconnect();
        Ok(())
    }
}
