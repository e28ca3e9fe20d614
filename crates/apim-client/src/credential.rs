//! Workload identity credential
//!
//! The pod gets a projected service-account token signed by the cluster's
//! OIDC issuer. Entra ID trusts that issuer, so the token can be presented as
//! a client assertion in a client-credentials grant and traded for an access
//! token for the management API.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Scope for the Azure Resource Manager API
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Default location of the projected federated token
pub const DEFAULT_FEDERATED_TOKEN_FILE: &str = "/var/run/secrets/azure/tokens/azure-identity-token";

/// Default Entra ID authority
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com/";

/// Cached tokens are refreshed this long before they expire
pub const REFRESH_MARGIN: Duration = Duration::from_secs(300);

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// A bearer token and its expiry
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw token value
    pub secret: String,
    /// When the token stops being accepted
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    /// Build a token
    pub fn new(secret: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_on,
        }
    }

    /// Whether the token is still good for at least `margin`
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => self.expires_on - margin > now,
            Err(_) => false,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// The only way obtaining a token fails: it cannot be had right now
#[derive(Debug, Error)]
#[error("credential unavailable: {reason}")]
pub struct CredentialError {
    /// What went wrong
    pub reason: String,
}

impl CredentialError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Source of bearer tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Token valid for `scopes`
    async fn token(&self, scopes: &[String]) -> Result<AccessToken, CredentialError>;
}

/// Settings for [`WorkloadIdentityCredential`]
#[derive(Clone, Debug)]
pub struct WorkloadIdentityConfig {
    /// Application (client) id of the federated identity
    pub client_id: String,
    /// Directory (tenant) id
    pub tenant_id: String,
    /// Projected service-account token
    pub token_file: PathBuf,
    /// Entra ID authority
    pub authority_host: Url,
    /// Timeout for the token request
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: serde_json::Value,
}

/// Workload identity token exchange with an in-memory cache per scope set
pub struct WorkloadIdentityCredential {
    config: WorkloadIdentityConfig,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl WorkloadIdentityCredential {
    /// Create the credential
    pub fn new(config: WorkloadIdentityConfig) -> Result<Self, CredentialError> {
        if config.client_id.trim().is_empty() {
            return Err(CredentialError::new("client id is empty"));
        }
        if config.tenant_id.trim().is_empty() {
            return Err(CredentialError::new("tenant id is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CredentialError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn token_url(&self) -> Result<Url, CredentialError> {
        let mut url = self.config.authority_host.clone();
        url.path_segments_mut()
            .map_err(|_| CredentialError::new("authority host cannot be a base URL"))?
            .pop_if_empty()
            .extend([self.config.tenant_id.as_str(), "oauth2", "v2.0", "token"]);
        Ok(url)
    }

    async fn read_assertion(&self) -> Result<String, CredentialError> {
        let raw = tokio::fs::read_to_string(&self.config.token_file)
            .await
            .map_err(|e| {
                CredentialError::new(format!(
                    "failed to read federated token {}: {e}",
                    self.config.token_file.display()
                ))
            })?;
        let assertion = raw.trim();
        if assertion.is_empty() {
            return Err(CredentialError::new(format!(
                "federated token {} is empty",
                self.config.token_file.display()
            )));
        }
        Ok(assertion.to_string())
    }

    async fn exchange(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let assertion = self.read_assertion().await?;
        let url = self.token_url()?;
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("scope", scope),
            ("grant_type", "client_credentials"),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
        ];

        let resp = self
            .http
            .post(url)
            .form(&form[..])
            .send()
            .await
            .map_err(|e| CredentialError::new(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::new(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CredentialError::new(format!("invalid token response: {e}")))?;

        let lifetime = match &parsed.expires_in {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| CredentialError::new("token response has no usable expires_in"))?;

        Ok(AccessToken::new(
            parsed.access_token,
            Utc::now() + chrono::Duration::seconds(lifetime),
        ))
    }
}

#[async_trait]
impl TokenProvider for WorkloadIdentityCredential {
    async fn token(&self, scopes: &[String]) -> Result<AccessToken, CredentialError> {
        if scopes.is_empty() {
            return Err(CredentialError::new("no scopes requested"));
        }
        let key = scopes.join(" ");

        let cached = self.cache.lock().get(&key).cloned();
        if let Some(cached) = cached.filter(|t| t.is_fresh(Utc::now(), REFRESH_MARGIN)) {
            debug!(scope = %key, "Using cached access token");
            return Ok(cached);
        }

        let token = self.exchange(&key).await?;
        info!(scope = %key, expires_on = %token.expires_on, "Obtained access token");
        self.cache.lock().insert(key, token.clone());
        Ok(token)
    }
}
