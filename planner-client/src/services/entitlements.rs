//! Subscription entitlement status.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client_core::error::AppError;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::watch;

use crate::config::EntitlementConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitlementStatus {
    pub is_active: bool,
    pub expiration_date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    /// Associate subsequent lookups with a user; `None` on logout.
    fn identify(&self, app_user_id: Option<String>);

    /// Fetch the current status and publish it to subscribers.
    async fn status(&self) -> Result<EntitlementStatus, AppError>;

    fn subscribe(&self) -> watch::Receiver<EntitlementStatus>;
}

#[derive(Debug, Deserialize)]
struct SubscriberInfo {
    #[serde(default)]
    active_entitlements: Vec<EntitlementInfo>,
}

#[derive(Debug, Deserialize)]
struct EntitlementInfo {
    id: String,
    is_active: bool,
    #[serde(default)]
    expiration_date: Option<String>,
}

/// Entitlement provider backed by the subscription service's REST API.
pub struct HttpEntitlementProvider {
    client: Client,
    config: EntitlementConfig,
    app_user_id: RwLock<Option<String>>,
    status_tx: watch::Sender<EntitlementStatus>,
}

impl HttpEntitlementProvider {
    pub fn new(config: EntitlementConfig) -> Self {
        let (status_tx, _) = watch::channel(EntitlementStatus::default());
        Self {
            client: Client::new(),
            config,
            app_user_id: RwLock::new(None),
            status_tx,
        }
    }

    fn subscriber_url(&self, app_user_id: &str) -> Result<Url, AppError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| AppError::Entitlement(format!("Invalid base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Entitlement("Base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["v1", "subscribers", app_user_id]);
        Ok(url)
    }

    async fn fetch(&self, app_user_id: &str) -> Result<EntitlementStatus, AppError> {
        let url = self.subscriber_url(app_user_id)?;
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send GET request to {}: {}", url, e);
                AppError::Entitlement(format!("HTTP request failed: {}", e))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            // Never purchased anything.
            return Ok(EntitlementStatus::default());
        }
        if !response.status().is_success() {
            return Err(AppError::Entitlement(format!(
                "Subscription service returned {}",
                response.status()
            )));
        }

        let info: SubscriberInfo = response
            .json()
            .await
            .map_err(|e| AppError::Entitlement(format!("Malformed subscriber info: {}", e)))?;
        Ok(status_for(&info, &self.config.entitlement_id))
    }
}

#[async_trait]
impl EntitlementProvider for HttpEntitlementProvider {
    fn identify(&self, app_user_id: Option<String>) {
        let signed_out = app_user_id.is_none();
        *self.app_user_id.write().unwrap_or_else(|e| e.into_inner()) = app_user_id;
        if signed_out {
            self.status_tx.send_replace(EntitlementStatus::default());
        }
    }

    async fn status(&self) -> Result<EntitlementStatus, AppError> {
        let app_user_id = self
            .app_user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let status = match app_user_id {
            Some(id) => self.fetch(&id).await?,
            None => EntitlementStatus::default(),
        };

        tracing::debug!(is_active = status.is_active, "Entitlement status fetched");
        self.status_tx.send_replace(status.clone());
        Ok(status)
    }

    fn subscribe(&self) -> watch::Receiver<EntitlementStatus> {
        self.status_tx.subscribe()
    }
}

fn status_for(info: &SubscriberInfo, entitlement_id: &str) -> EntitlementStatus {
    let Some(entitlement) = info
        .active_entitlements
        .iter()
        .find(|e| e.id == entitlement_id)
    else {
        return EntitlementStatus::default();
    };

    let expiration_date = entitlement
        .expiration_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc));

    EntitlementStatus {
        is_active: entitlement.is_active,
        expiration_date,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> SubscriberInfo {
        serde_json::from_str(json).unwrap()
    }

    fn config(base_url: &str) -> EntitlementConfig {
        EntitlementConfig {
            base_url: base_url.to_string(),
            api_key: "key".to_string(),
            entitlement_id: "pro".to_string(),
        }
    }

    #[test]
    fn test_status_for_matching_entitlement() {
        let info = parse(
            r#"{
                "subscriber": {"id": "s1", "app_id": "a1", "app_user_id": "u1", "created_at": "2026-01-01T00:00:00Z"},
                "active_entitlements": [
                    {"id": "basic", "is_active": false, "product_id": "p0", "store": "app_store", "will_renew": false},
                    {"id": "pro", "is_active": true, "product_id": "p1", "store": "app_store",
                     "expiration_date": "2026-12-31T23:59:59Z", "will_renew": true}
                ],
                "transactions": []
            }"#,
        );

        let status = status_for(&info, "pro");
        assert!(status.is_active);
        assert_eq!(
            status.expiration_date.unwrap().to_rfc3339(),
            "2026-12-31T23:59:59+00:00"
        );
    }

    #[test]
    fn test_status_for_missing_entitlement_is_inactive() {
        let info = parse(r#"{"active_entitlements": []}"#);
        assert_eq!(status_for(&info, "pro"), EntitlementStatus::default());
    }

    #[test]
    fn test_unparseable_expiration_is_dropped() {
        let info = parse(
            r#"{"active_entitlements": [{"id": "pro", "is_active": true, "expiration_date": "soon"}]}"#,
        );
        let status = status_for(&info, "pro");
        assert!(status.is_active);
        assert!(status.expiration_date.is_none());
    }

    #[test]
    fn test_subscriber_url_escapes_user_id() {
        let provider = HttpEntitlementProvider::new(config("https://billing.example.com/api/"));
        let url = provider.subscriber_url("user/1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://billing.example.com/api/v1/subscribers/user%2F1"
        );
    }

    #[tokio::test]
    async fn test_signed_out_status_is_inactive_without_request() {
        let provider = HttpEntitlementProvider::new(config("http://127.0.0.1:9"));
        let mut rx = provider.subscribe();
        let status = provider.status().await.unwrap();
        assert!(!status.is_active);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), EntitlementStatus::default());
    }
}
