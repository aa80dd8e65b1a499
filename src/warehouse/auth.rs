//! OAuth access tokens for the BigQuery REST API.
//!
//! Either a pre-minted token is used as-is, or a service-account key is
//! exchanged for a token through the JWT bearer grant.

use crate::config::CredentialsConfig;
use crate::error::{PipelineError, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Failure to obtain an access token.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to sign token request: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// The fields of a service-account JSON key that the grant needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    /// Read a key file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!(
                "Failed to read credentials {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            PipelineError::config(format!(
                "Invalid service-account key {}: {}",
                path.display(),
                e
            ))
        })
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

enum TokenSource {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        encoding_key: EncodingKey,
    },
}

/// Hands out bearer tokens, minting and caching them as needed.
pub struct TokenProvider {
    source: TokenSource,
    http_client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Build a provider from the credentials section.
    pub fn from_config(config: &CredentialsConfig) -> Result<Self> {
        if let Some(ref token) = config.access_token {
            info!("Using BigQuery access token from configuration");
            return Ok(Self::with_static_token(token.clone()));
        }

        let path = config.credential_path.as_deref().ok_or_else(|| {
            PipelineError::config("No credential_path or access_token configured")
        })?;
        let key = ServiceAccountKey::from_file(path)?;
        info!("Using service account {}", key.client_email);
        Self::with_service_account(key)
    }

    /// Provider that always returns the same token.
    pub fn with_static_token(token: String) -> Self {
        Self {
            source: TokenSource::Static(token),
            http_client: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// Provider that exchanges a service-account key for tokens.
    pub fn with_service_account(key: ServiceAccountKey) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| PipelineError::config(format!("Invalid private key: {}", e)))?;

        Ok(Self {
            source: TokenSource::ServiceAccount { key, encoding_key },
            http_client: reqwest::Client::new(),
            cached: Mutex::new(None),
        })
    }

    /// Return a valid access token.
    pub async fn access_token(&self) -> std::result::Result<String, AuthError> {
        let (key, encoding_key) = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount { key, encoding_key } => (key, encoding_key),
        };

        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp();
        if let Some(ref token) = *cached {
            if token.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.exchange(key, encoding_key, now).await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn exchange(
        &self,
        key: &ServiceAccountKey,
        encoding_key: &EncodingKey,
        now: i64,
    ) -> std::result::Result<CachedToken, AuthError> {
        let claims = Claims {
            iss: &key.client_email,
            scope: BIGQUERY_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, encoding_key)?;

        debug!("Requesting access token from {}", key.token_uri);
        let response = self
            .http_client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }

        let token: TokenResponse = response.json().await?;
        Ok(CachedToken {
            token: token.access_token,
            expires_at: now + token.expires_in,
        })
    }
}
