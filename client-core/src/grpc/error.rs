//! Conversion from `tonic::Status` into the client error taxonomy.
//!
//! | gRPC Status | RpcError |
//! |-------------|----------|
//! | `UNAUTHENTICATED` | `AuthFailure` |
//! | `CANCELLED` | `Cancelled` |
//! | any other status raised by the transport layer | `Transport` |
//! | everything else | `Server { code, message }` |

use std::error::Error as _;
use tonic::{Code, Status};

use crate::error::RpcError;

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        if status.code() == Code::Unauthenticated {
            return RpcError::AuthFailure(status.message().to_string());
        }
        if status.code() == Code::Cancelled {
            return RpcError::Cancelled;
        }

        if let Some(source) = status.source()
            && is_transport_error(source)
        {
            return RpcError::Transport(format!("{}: {}", status.message(), source));
        }

        RpcError::Server {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(err: tonic::transport::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

fn is_transport_error(source: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(source);
    while let Some(err) = current {
        if err.downcast_ref::<tonic::transport::Error>().is_some()
            || err.downcast_ref::<std::io::Error>().is_some()
        {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthenticated_maps_to_auth_failure() {
        let err: RpcError = Status::unauthenticated("token expired").into();
        assert_eq!(err, RpcError::AuthFailure("token expired".to_string()));
    }

    #[test]
    fn test_server_status_keeps_code() {
        let err: RpcError = Status::not_found("event missing").into();
        assert_eq!(err.code(), Some(Code::NotFound));
        assert!(err.is_access_lost());
    }

    #[test]
    fn test_cancelled_status_maps_to_cancelled() {
        let err: RpcError = Status::cancelled("call dropped by client").into();
        assert_eq!(err, RpcError::Cancelled);
        assert!(!crate::grpc::is_retryable(&err));
    }

    #[test]
    fn test_status_with_io_source_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let status = Status::from_error(Box::new(io));
        let err: RpcError = status.into();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
