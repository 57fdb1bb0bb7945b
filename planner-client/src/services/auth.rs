//! Bearer credential source.
//!
//! The identity provider itself lives outside this crate; all the client needs
//! is "give me the current token", "force a new one", and "tell me when the
//! persisted session has been restored".

use async_trait::async_trait;
use client_core::error::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No signed-in user")]
    NotSignedIn,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<AuthError> for RpcError {
    fn from(err: AuthError) -> Self {
        RpcError::AuthFailure(err.to_string())
    }
}

/// The identity the provider vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn current_token(&self) -> Option<String>;

    /// Obtain a new token even if the cached one has not expired.
    async fn force_refresh(&self) -> Result<String, AuthError>;

    /// Resolves once session restoration has finished, with the restored
    /// user or `None` if nobody is signed in.
    async fn restored_user(&self) -> Option<AuthUser>;
}

/// Provider backed by a pre-issued token, for development and service accounts.
pub struct StaticTokenProvider {
    token: Option<String>,
    user: Option<AuthUser>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>, user_id: Option<String>) -> Self {
        let user = match (&token, user_id) {
            (Some(_), Some(id)) => Some(AuthUser { id, email: None }),
            _ => None,
        };
        Self { token, user }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn current_token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn force_refresh(&self) -> Result<String, AuthError> {
        self.token.clone().ok_or(AuthError::NotSignedIn)
    }

    async fn restored_user(&self) -> Option<AuthUser> {
        self.user.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_without_token_is_signed_out() {
        let provider = StaticTokenProvider::new(None, Some("u1".to_string()));
        assert!(provider.restored_user().await.is_none());
        assert!(matches!(
            provider.force_refresh().await,
            Err(AuthError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn test_static_provider_restores_configured_user() {
        let provider = StaticTokenProvider::new(Some("tok".to_string()), Some("u1".to_string()));
        assert_eq!(provider.restored_user().await.unwrap().id, "u1");
        assert_eq!(provider.force_refresh().await.unwrap(), "tok");
    }

    #[test]
    fn test_auth_error_maps_to_auth_failure() {
        let err: RpcError = AuthError::RefreshFailed("revoked".to_string()).into();
        assert!(err.is_auth_failure());
    }
}
