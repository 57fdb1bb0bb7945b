//! The single long-lived connection to the backend.
//!
//! `ConnectionManager` owns the channel and the current bearer token. Calls are
//! addressed by service and method name and encoded with prost, so any message
//! type deriving `prost::Message` can go over the wire without generated stubs.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use http::uri::PathAndQuery;
use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tonic::Request;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::config::ConnectionConfig;
use crate::error::{ConnectError, RpcError};
use crate::grpc::interceptors::prepare_outgoing;

/// A server stream of decoded responses.
pub type RpcStream<T> = BoxStream<'static, Result<T, RpcError>>;

/// Narrow token interface handed to components that must replace the
/// credential but have no business touching the connection itself.
pub trait TokenSink: Send + Sync {
    /// Replace the token attached to outgoing calls; `None` sends calls unauthenticated.
    fn set_token(&self, token: Option<String>);

    /// Monotonic counter bumped on every `set_token`.
    fn token_epoch(&self) -> u64;
}

/// Narrow streaming interface: what a stream consumer needs from the
/// connection, without the lifecycle or token setters.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Open a server stream; `timeout` overrides the per-call default.
    async fn open_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<RpcStream<Resp>, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + Send + 'static;

    fn begin_exclusive_operation(&self) -> ExclusiveOperationGuard;

    /// Elevated timeout for long operations; `None` when not connected.
    fn long_operation_timeout(&self) -> Option<Duration>;
}

struct LiveConnection {
    channel: Channel,
    config: ConnectionConfig,
}

/// Owner of the process-wide backend connection.
pub struct ConnectionManager {
    live: RwLock<Option<LiveConnection>>,
    token: RwLock<Option<SecretString>>,
    token_epoch: AtomicU64,
    exclusive_operations: Arc<AtomicUsize>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(None),
            token: RwLock::new(None),
            token_epoch: AtomicU64::new(0),
            exclusive_operations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open the connection.
    ///
    /// Fails with `AlreadyConnected` if a connection is live; replacing one
    /// requires `disconnect` (or `reconnect`) first.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }

        let channel = build_endpoint(&config)?.connect().await?;

        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        if live.is_some() {
            // Lost a race with another connect; keep the winner.
            return Err(ConnectError::AlreadyConnected);
        }

        tracing::info!(
            endpoint = %config.endpoint_uri(),
            keepalive_interval_secs = config.keepalive_interval_secs,
            "Connected to backend"
        );
        *live = Some(LiveConnection { channel, config });
        Ok(())
    }

    /// Drop the connection. In-flight calls holding a channel clone finish on their own.
    pub fn disconnect(&self) {
        let previous = self
            .live
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(previous) = previous {
            tracing::info!(endpoint = %previous.config.endpoint_uri(), "Disconnected from backend");
        }
    }

    /// Disconnect and connect with a new configuration (e.g. host change).
    ///
    /// Refuses while an exclusive long operation is running unless `force` is set.
    pub async fn reconnect(&self, config: ConnectionConfig, force: bool) -> Result<(), ConnectError> {
        let active = self.exclusive_operations.load(Ordering::SeqCst);
        if active > 0 && !force {
            tracing::warn!(
                active_operations = active,
                "Reconnect refused: exclusive operation in progress"
            );
            return Err(ConnectError::ExclusiveOperationInProgress);
        }

        // Validate before tearing anything down.
        config.validate().map_err(ConnectError::InvalidConfig)?;

        self.disconnect();
        self.connect(config).await
    }

    pub fn is_connected(&self) -> bool {
        self.live
            .read()
            .map(|live| live.is_some())
            .unwrap_or(false)
    }

    pub fn config(&self) -> Option<ConnectionConfig> {
        self.live
            .read()
            .ok()
            .and_then(|live| live.as_ref().map(|l| l.config.clone()))
    }

    /// Mark the start of an operation a reconnect must not interrupt.
    /// The mark is released when the guard drops.
    pub fn begin_exclusive_operation(&self) -> ExclusiveOperationGuard {
        ExclusiveOperationGuard::acquire(self.exclusive_operations.clone())
    }

    pub fn has_exclusive_operation(&self) -> bool {
        self.exclusive_operations.load(Ordering::SeqCst) > 0
    }

    pub fn has_token(&self) -> bool {
        self.token
            .read()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Unary call under the configured per-call timeout.
    pub async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        self.unary(service, method, request, None).await
    }

    /// Unary call with the elevated long-operation timeout.
    pub async fn call_with_timeout<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        self.unary(service, method, request, Some(timeout)).await
    }

    /// Open a server-streaming call.
    pub async fn open_server_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
    ) -> Result<RpcStream<Resp>, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + Send + 'static,
    {
        self.server_stream(service, method, request, None).await
    }

    pub async fn open_server_stream_with_timeout<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Duration,
    ) -> Result<RpcStream<Resp>, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + Send + 'static,
    {
        self.server_stream(service, method, request, Some(timeout))
            .await
    }

    /// Long-operation timeout of the live connection, if connected.
    pub fn long_operation_timeout(&self) -> Option<Duration> {
        self.config().map(|c| c.long_operation_timeout())
    }

    async fn unary<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let (mut grpc, path, request) = self.prepare(service, method, request, timeout)?;
        metrics::counter!("rpc_calls_total", "kind" => "unary").increment(1);

        grpc.ready()
            .await
            .map_err(|e| RpcError::Transport(format!("Service was not ready: {}", e)))?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc.unary(request, path, codec).await?;
        Ok(response.into_inner())
    }

    async fn server_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<RpcStream<Resp>, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + Send + 'static,
    {
        let (mut grpc, path, request) = self.prepare(service, method, request, timeout)?;
        metrics::counter!("rpc_calls_total", "kind" => "server_stream").increment(1);

        grpc.ready()
            .await
            .map_err(|e| RpcError::Transport(format!("Service was not ready: {}", e)))?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let streaming = grpc.server_streaming(request, path, codec).await?.into_inner();
        Ok(streaming.map(|item| item.map_err(RpcError::from)).boxed())
    }

    /// Snapshot the channel and token at call-construction time. Every call
    /// carries a deadline: `timeout` if given, else the configured request timeout.
    fn prepare<Req>(
        &self,
        service: &str,
        method: &str,
        message: Req,
        timeout: Option<Duration>,
    ) -> Result<(Grpc<Channel>, PathAndQuery, Request<Req>), RpcError> {
        let (channel, default_timeout) = self
            .live
            .read()
            .ok()
            .and_then(|live| {
                live.as_ref()
                    .map(|l| (l.channel.clone(), l.config.request_timeout()))
            })
            .ok_or(RpcError::NotConnected)?;

        let path = method_path(service, method)?;

        let mut request = Request::new(message);
        request.set_timeout(timeout.unwrap_or(default_timeout));
        let token = self.token.read().ok().and_then(|t| t.as_ref().cloned());
        let request_id = prepare_outgoing(&mut request, token.as_ref());
        tracing::debug!(
            request_id = %request_id,
            path = %path,
            authenticated = token.is_some(),
            "Dispatching remote call"
        );

        Ok((Grpc::new(channel), path, request))
    }
}

#[async_trait]
impl StreamTransport for ConnectionManager {
    async fn open_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<RpcStream<Resp>, RpcError>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + Send + 'static,
    {
        match timeout {
            Some(timeout) => {
                self.open_server_stream_with_timeout(service, method, request, timeout)
                    .await
            }
            None => self.open_server_stream(service, method, request).await,
        }
    }

    fn begin_exclusive_operation(&self) -> ExclusiveOperationGuard {
        ConnectionManager::begin_exclusive_operation(self)
    }

    fn long_operation_timeout(&self) -> Option<Duration> {
        ConnectionManager::long_operation_timeout(self)
    }
}

impl TokenSink for ConnectionManager {
    fn set_token(&self, token: Option<String>) {
        let mut slot = self.token.write().unwrap_or_else(|e| e.into_inner());
        *slot = token.map(SecretString::new);
        let epoch = self.token_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(epoch, present = slot.is_some(), "Bearer token replaced");
    }

    fn token_epoch(&self) -> u64 {
        self.token_epoch.load(Ordering::SeqCst)
    }
}

/// Held for the duration of an operation that a reconnect must not kill.
#[derive(Debug)]
pub struct ExclusiveOperationGuard {
    counter: Arc<AtomicUsize>,
}

impl ExclusiveOperationGuard {
    /// Count one running operation on `counter` until the guard drops.
    pub fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ExclusiveOperationGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn build_endpoint(config: &ConnectionConfig) -> Result<Endpoint, ConnectError> {
    config.validate().map_err(ConnectError::InvalidConfig)?;

    let mut endpoint = Endpoint::from_shared(config.endpoint_uri())
        .map_err(|e| ConnectError::InvalidEndpoint(e.to_string()))?
        .connect_timeout(config.connect_timeout())
        // Pings run regardless of call activity so minutes-long streams
        // survive intermediaries that reap idle connections.
        .http2_keep_alive_interval(config.keepalive_interval())
        .keep_alive_timeout(config.keepalive_timeout())
        .keep_alive_while_idle(true)
        .tcp_keepalive(Some(config.keepalive_interval()));

    if config.use_tls {
        endpoint = endpoint.tls_config(
            ClientTlsConfig::new()
                .domain_name(config.host.clone())
                .with_native_roots(),
        )?;
    }

    Ok(endpoint)
}

fn method_path(service: &str, method: &str) -> Result<PathAndQuery, RpcError> {
    PathAndQuery::try_from(format!("/{}/{}", service, method)).map_err(|e| RpcError::Server {
        code: tonic::Code::InvalidArgument,
        message: format!("Invalid method path /{}/{}: {}", service, method, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        note: String,
    }

    #[tokio::test]
    async fn test_call_before_connect_fails_not_connected() {
        let manager = ConnectionManager::new();
        let result: Result<Ping, RpcError> = manager
            .call("planner.v1.Health", "Ping", Ping::default())
            .await;
        assert_eq!(result.unwrap_err(), RpcError::NotConnected);
    }

    #[tokio::test]
    async fn test_stream_before_connect_fails_not_connected() {
        let manager = ConnectionManager::new();
        let result = manager
            .open_server_stream::<Ping, Ping>("planner.v1.Health", "Watch", Ping::default())
            .await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
    }

    #[test]
    fn test_set_token_bumps_epoch() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.token_epoch(), 0);
        assert!(!manager.has_token());

        manager.set_token(Some("t1".to_string()));
        assert_eq!(manager.token_epoch(), 1);
        assert!(manager.has_token());

        manager.set_token(None);
        assert_eq!(manager.token_epoch(), 2);
        assert!(!manager.has_token());
    }

    #[tokio::test]
    async fn test_reconnect_refused_during_exclusive_operation() {
        let manager = ConnectionManager::new();
        let guard = manager.begin_exclusive_operation();
        assert!(manager.has_exclusive_operation());

        let result = manager.reconnect(ConnectionConfig::default(), false).await;
        assert!(matches!(
            result,
            Err(ConnectError::ExclusiveOperationInProgress)
        ));

        drop(guard);
        assert!(!manager.has_exclusive_operation());
    }

    #[tokio::test]
    async fn test_forced_reconnect_validates_config() {
        let manager = ConnectionManager::new();
        let _guard = manager.begin_exclusive_operation();
        let bad = ConnectionConfig {
            port: 0,
            ..Default::default()
        };

        let result = manager.reconnect(bad, true).await;
        assert!(matches!(result, Err(ConnectError::InvalidConfig(_))));
    }

    /// A manager holding a lazily connected channel; nothing is dialled
    /// until a call is actually sent.
    fn lazily_connected(config: ConnectionConfig) -> ConnectionManager {
        let channel = build_endpoint(&config).unwrap().connect_lazy();
        let manager = ConnectionManager::new();
        *manager.live.write().unwrap() = Some(LiveConnection { channel, config });
        manager
    }

    fn deadline<T>(request: &Request<T>) -> Option<String> {
        request
            .metadata()
            .get("grpc-timeout")
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_calls_carry_configured_deadline() {
        let manager = lazily_connected(ConnectionConfig {
            request_timeout_secs: 30,
            long_operation_timeout_secs: 600,
            ..Default::default()
        });

        let (_, _, request) = manager
            .prepare("planner.v1.EventService", "ListEvents", Ping::default(), None)
            .unwrap();
        assert_eq!(deadline(&request).as_deref(), Some("30000000u"));

        let long = manager.long_operation_timeout().unwrap();
        let (_, _, request) = manager
            .prepare("planner.v1.AccountService", "MigrateAccount", Ping::default(), Some(long))
            .unwrap();
        assert_eq!(deadline(&request).as_deref(), Some("600000m"));
    }

    #[tokio::test]
    async fn test_outgoing_call_attaches_current_token() {
        let manager = lazily_connected(ConnectionConfig::default());
        manager.set_token(Some("abc".to_string()));

        let (_, path, request) = manager
            .prepare("planner.v1.EventService", "GetEvent", Ping::default(), None)
            .unwrap();
        assert_eq!(path.as_str(), "/planner.v1.EventService/GetEvent");
        assert_eq!(
            request.metadata().get("authorization").unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_method_path() {
        let path = method_path("planner.v1.GuestService", "ListGuests").unwrap();
        assert_eq!(path.as_str(), "/planner.v1.GuestService/ListGuests");
    }
}
