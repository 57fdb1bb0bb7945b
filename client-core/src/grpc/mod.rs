//! Remote-call runtime shared by product clients.
//!
//! This module provides:
//! - `ConnectionManager`: the single backend connection, token and keepalive
//! - `RetryExecutor`: backoff retries and single-flight token refresh
//! - `StreamingLoader`: cancellable batch and generation streams over a `StreamTransport`
//! - Outgoing metadata (bearer token, trace context, request id)
//! - `tonic::Status` to `RpcError` conversion

pub mod connection;
pub mod error;
pub mod interceptors;
pub mod retry;
pub mod streaming;

pub use connection::{
    ConnectionManager, ExclusiveOperationGuard, RpcStream, StreamTransport, TokenSink,
};
pub use interceptors::{
    AUTHORIZATION_KEY, REQUEST_ID_KEY, TRACEPARENT_KEY, TRACESTATE_KEY, inject_bearer_token,
    inject_request_id, inject_trace_context, prepare_outgoing,
};
pub use retry::{
    RetryExecutor, RetryExhaustedObserver, RetryPolicy, RetryablePredicate, TokenRefreshHandler,
    is_retryable,
};
pub use streaming::{
    Batch, BatchPayload, BatchStream, CancelHook, CancellableStream, GenerationPayload,
    GenerationStream, GenerationUpdate, StreamingLoader, collect_generation,
};

// Re-export commonly used tonic types
pub use tonic::Code;
