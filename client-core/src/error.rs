use thiserror::Error;
use tonic::Code;

/// Failure of a single remote call or stream.
///
/// Cheap to clone so that a single in-flight result can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error ({code:?}): {message}")]
    Server { code: Code, message: String },

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Operation completed without producing any results")]
    NoResultsProduced,

    #[error("Cancelled")]
    Cancelled,
}

impl RpcError {
    pub fn server(code: Code, message: impl Into<String>) -> Self {
        RpcError::Server {
            code,
            message: message.into(),
        }
    }

    /// Status code of a server rejection, if this is one.
    pub fn code(&self) -> Option<Code> {
        match self {
            RpcError::Server { code, .. } => Some(*code),
            RpcError::AuthFailure(_) => Some(Code::Unauthenticated),
            _ => None,
        }
    }

    /// Errors that may be cured by refreshing the bearer token.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            RpcError::AuthFailure(_)
                | RpcError::Server {
                    code: Code::PermissionDenied,
                    ..
                }
        )
    }

    /// The addressed resource no longer exists or is no longer visible to the caller.
    pub fn is_access_lost(&self) -> bool {
        matches!(
            self,
            RpcError::Server {
                code: Code::NotFound | Code::PermissionDenied,
                ..
            }
        )
    }
}

/// Failure to establish or replace the connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),

    #[error("Already connected; disconnect first")]
    AlreadyConnected,

    #[error("An exclusive long-running operation is in progress")]
    ExclusiveOperationInProgress,

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Application-level error for composition roots and binaries.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Remote call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Entitlement provider error: {0}")]
    Entitlement(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}
