//! Remote auth endpoints (OTP delivery and refresh-token exchange)

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use super::models::TokenPair;
use crate::common::RemoteConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("remote auth is not configured")]
    NotConfigured,

    #[error("auth request failed: {0}")]
    Request(String),

    #[error("auth endpoint rejected the request: {0}")]
    Rejected(String),

    #[error("token response could not be parsed: {0}")]
    Malformed(String),
}

/// Auth endpoint boundary consumed by the session manager.
#[async_trait]
pub trait AuthApi: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Requests a one-time login link/code be sent to `email`.
    async fn request_otp(&self, email: &str) -> Result<(), AuthError>;

    /// Exchanges a refresh token for a new access/refresh pair.
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenPair, AuthError>;
}

/// Auth client for a Supabase-style `/auth/v1` endpoint.
pub struct SupabaseAuthApi {
    config: Option<RemoteConfig>,
    client: Client,
}

impl SupabaseAuthApi {
    pub fn new(config: Option<RemoteConfig>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { config, client }
    }

    pub fn from_env() -> Self {
        Self::new(RemoteConfig::from_env())
    }

    fn config(&self) -> Result<&RemoteConfig, AuthError> {
        self.config.as_ref().ok_or(AuthError::NotConfigured)
    }
}

#[async_trait]
impl AuthApi for SupabaseAuthApi {
    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    async fn request_otp(&self, email: &str) -> Result<(), AuthError> {
        let config = self.config()?;
        debug!("requesting one-time login link");

        let body = serde_json::json!({
            "email": email,
            "create_user": true,
            "data": {},
            "gotrue_meta_security": {},
        });

        let response = self
            .client
            .post(format!("{}/auth/v1/otp", config.url))
            .header("apikey", &config.anon_key)
            .bearer_auth(&config.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(http_status = %status, "OTP request rejected");
            return Err(AuthError::Rejected(if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body
            }));
        }

        Ok(())
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let config = self.config()?;
        debug!("exchanging refresh token");

        let response = self
            .client
            .post(format!(
                "{}/auth/v1/token?grant_type=refresh_token",
                config.url
            ))
            .header("apikey", &config.anon_key)
            .bearer_auth(&config.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(http_status = %status, "refresh token exchange rejected");
            return Err(AuthError::Rejected(if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body
            }));
        }

        response
            .json::<TokenPair>()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }
}
