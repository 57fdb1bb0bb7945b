//! Outgoing request metadata.
//!
//! Every call leaving the connection manager is decorated with:
//! - `authorization: Bearer <token>` when a token is set
//! - W3C `traceparent`/`tracestate` from the current span
//! - a fresh `x-request-id`

use opentelemetry::trace::TraceContextExt;
use secrecy::{ExposeSecret, SecretString};
use tonic::Request;
use tonic::metadata::MetadataValue;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

/// gRPC metadata key for the bearer credential.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// gRPC metadata key for W3C traceparent header.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// gRPC metadata key for W3C tracestate header.
pub const TRACESTATE_KEY: &str = "tracestate";

/// gRPC metadata key for request ID.
pub const REQUEST_ID_KEY: &str = "x-request-id";

/// Attach `authorization: Bearer <token>`.
///
/// Tokens that are not valid metadata are skipped and logged; the call then
/// goes out unauthenticated and the server decides.
pub fn inject_bearer_token<T>(request: &mut Request<T>, token: &SecretString) {
    let header = format!("Bearer {}", token.expose_secret());
    match MetadataValue::try_from(header) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.metadata_mut().insert(AUTHORIZATION_KEY, value);
        }
        Err(_) => {
            tracing::warn!("Bearer token contains invalid metadata characters, sending without it");
        }
    }
}

/// Inject current trace context into outgoing gRPC request metadata.
pub fn inject_trace_context<T>(request: &mut Request<T>) {
    let span = Span::current();
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if span_context.is_valid() {
        // Format: version-trace_id-span_id-trace_flags
        let traceparent = format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        );

        if let Ok(value) = traceparent.parse() {
            request.metadata_mut().insert(TRACEPARENT_KEY, value);
        }

        let trace_state = span_context.trace_state();
        let tracestate_str = trace_state.header();
        if !tracestate_str.is_empty()
            && let Ok(value) = tracestate_str.parse()
        {
            request.metadata_mut().insert(TRACESTATE_KEY, value);
        }
    }
}

/// Attach a freshly generated request ID and return it for logging.
pub fn inject_request_id<T>(request: &mut Request<T>) -> String {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = request_id.parse() {
        request.metadata_mut().insert(REQUEST_ID_KEY, value);
    }
    request_id
}

/// Decorate an outgoing request with all client metadata.
pub fn prepare_outgoing<T>(request: &mut Request<T>, token: Option<&SecretString>) -> String {
    if let Some(token) = token {
        inject_bearer_token(request, token);
    }
    inject_trace_context(request);
    inject_request_id(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<T>(request: &Request<T>, key: &str) -> Option<String> {
        request
            .metadata()
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    #[test]
    fn test_prepare_outgoing_with_token() {
        let mut request = Request::new(());
        let token = SecretString::new("abc.def.ghi".to_string());
        let request_id = prepare_outgoing(&mut request, Some(&token));

        assert_eq!(
            header(&request, AUTHORIZATION_KEY).as_deref(),
            Some("Bearer abc.def.ghi")
        );
        assert_eq!(header(&request, REQUEST_ID_KEY), Some(request_id));
    }

    #[test]
    fn test_prepare_outgoing_without_token() {
        let mut request = Request::new(());
        prepare_outgoing(&mut request, None);

        assert!(request.metadata().get(AUTHORIZATION_KEY).is_none());
        assert!(header(&request, REQUEST_ID_KEY).is_some());
    }

    #[test]
    fn test_invalid_token_is_skipped() {
        let mut request = Request::new(());
        let token = SecretString::new("bad\ntoken".to_string());
        inject_bearer_token(&mut request, &token);
        assert!(request.metadata().get(AUTHORIZATION_KEY).is_none());
    }

    #[test]
    fn test_inject_trace_context_without_span_is_noop() {
        let mut request = Request::new(());
        inject_trace_context(&mut request);
        assert!(request.metadata().get(TRACEPARENT_KEY).is_none());
    }
}
