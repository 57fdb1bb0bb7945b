use client_core::config as core_config;
use client_core::error::AppError;
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    /// Absent when no subscription service is configured.
    pub entitlements: Option<EntitlementConfig>,
    pub device: DeviceConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntitlementConfig {
    pub base_url: String,
    pub api_key: String,
    /// Entitlement that unlocks premium features.
    pub entitlement_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub platform: String,
    /// Push token to register after login, if the host has one.
    pub push_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-issued bearer token for service accounts and local development.
    pub static_token: Option<String>,
    pub user_id: Option<String>,
}

impl PlannerConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let entitlements = match env::var("ENTITLEMENTS_BASE_URL") {
            Ok(base_url) => Some(EntitlementConfig {
                base_url,
                api_key: get_env("ENTITLEMENTS_API_KEY", None, is_prod)?,
                entitlement_id: get_env("ENTITLEMENTS_ID", Some("premium"), is_prod)?,
            }),
            Err(_) => None,
        };

        Ok(PlannerConfig {
            common: common_config,
            entitlements,
            device: DeviceConfig {
                platform: get_env("DEVICE_PLATFORM", Some(env::consts::OS), is_prod)?,
                push_token: env::var("DEVICE_PUSH_TOKEN").ok(),
            },
            auth: AuthConfig {
                static_token: env::var("AUTH_STATIC_TOKEN").ok(),
                user_id: env::var("AUTH_USER_ID").ok(),
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_default_outside_prod() {
        let value = get_env("PLANNER_TEST_UNSET_KEY", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");
    }

    #[test]
    fn test_get_env_required_in_prod() {
        let result = get_env("PLANNER_TEST_UNSET_KEY", Some("fallback"), true);
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_get_env_missing_without_default() {
        let result = get_env("PLANNER_TEST_UNSET_KEY", None, false);
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
