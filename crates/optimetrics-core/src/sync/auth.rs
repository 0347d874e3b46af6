//! Access tokens for the Drive API.
//!
//! Two sources are supported: a service-account key, exchanged for short-lived
//! tokens through the OAuth JWT-bearer grant, and a token file written by some
//! external tool.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CloudConfig;
use crate::sync::error::RemoteError;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Source of bearer tokens.
pub trait CredentialProvider: Send + Sync {
    fn token(&self, http: &Client) -> Result<String, RemoteError>;

    /// Drops any cached token after the server rejected it.
    fn invalidate(&self) {}
}

/// Builds the provider named by the cloud section of the config.
pub fn from_config(config: &CloudConfig) -> Result<Box<dyn CredentialProvider>, RemoteError> {
    if let Some(path) = &config.credentials_path {
        return Ok(Box::new(ServiceAccount::from_file(path)?));
    }
    if let Some(path) = &config.token_path {
        return Ok(Box::new(StaticToken::from_file(path)?));
    }
    Err(RemoteError::Auth(
        "neither credentials_path nor token_path is set".into(),
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: i64,
}

/// Service-account key file credentials.
pub struct ServiceAccount {
    key: ServiceAccountKey,
    encoding: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccount {
    pub fn from_file(path: &Path) -> Result<Self, RemoteError> {
        let text = fs::read_to_string(path)
            .map_err(|e| RemoteError::Auth(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, RemoteError> {
        let key: ServiceAccountKey = serde_json::from_str(text)
            .map_err(|e| RemoteError::Auth(format!("invalid service account key: {}", e)))?;
        let encoding = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| RemoteError::Auth(format!("invalid private key: {}", e)))?;
        Ok(Self {
            key,
            encoding,
            cached: Mutex::new(None),
        })
    }

    /// Overrides the token endpoint from the key file.
    pub fn with_token_uri(mut self, uri: impl Into<String>) -> Self {
        self.key.token_uri = uri.into();
        self
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn assertion(&self, now: i64) -> Result<String, RemoteError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let claims = Claims {
            iss: &self.key.client_email,
            sub: &self.key.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        encode(&header, &claims, &self.encoding)
            .map_err(|e| RemoteError::Auth(format!("cannot sign assertion: {}", e)))
    }

    fn exchange(&self, http: &Client, now: i64) -> Result<CachedToken, RemoteError> {
        let assertion = self.assertion(now)?;
        let response = http
            .post(&self.key.token_uri)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            // Server errors are retried, a rejected grant is not
            if status.is_server_error() {
                return Err(RemoteError::Status {
                    code: status.as_u16(),
                    body,
                });
            }
            return Err(RemoteError::Auth(format!("token endpoint returned {}: {}", status, body)));
        }
        let token: TokenResponse = response
            .json()
            .map_err(|e| RemoteError::Decode(format!("token response: {}", e)))?;
        Ok(CachedToken {
            value: token.access_token,
            expires_at: now + token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS),
        })
    }
}

impl CredentialProvider for ServiceAccount {
    fn token(&self, http: &Client) -> Result<String, RemoteError> {
        let now = Utc::now().timestamp();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = cached.as_ref()
            && token.expires_at - EXPIRY_MARGIN_SECS > now
        {
            return Ok(token.value.clone());
        }
        let token = self.exchange(http, now)?;
        debug!(account = %self.key.client_email, expires_at = token.expires_at, "access token refreshed");
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(alias = "access_token")]
    token: String,
}

/// Token read once from a file. The file holds either the bare token or a
/// JSON object with a `token` or `access_token` field.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, RemoteError> {
        let text = fs::read_to_string(path)
            .map_err(|e| RemoteError::Auth(format!("{}: {}", path.display(), e)))?;
        let text = text.trim();
        if text.starts_with('{') {
            let file: TokenFile = serde_json::from_str(text)
                .map_err(|e| RemoteError::Auth(format!("invalid token file: {}", e)))?;
            return Ok(Self::new(file.token));
        }
        if text.is_empty() {
            return Err(RemoteError::Auth(format!("{} is empty", path.display())));
        }
        Ok(Self::new(text))
    }
}

impl CredentialProvider for StaticToken {
    fn token(&self, _http: &Client) -> Result<String, RemoteError> {
        Ok(self.token.clone())
    }
}
