use crate::error::BackupError;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a Google service account key file that token exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, BackupError> {
        let content = fs::read_to_string(path).map_err(|e| {
            BackupError::Credential(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| BackupError::Credential(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> Result<Self, BackupError> {
        serde_json::from_str(content)
            .map_err(|e| BackupError::Credential(format!("malformed service account key: {}", e)))
    }

    /// Signed RS256 assertion for the JWT-bearer grant.
    pub fn assertion(&self, now: DateTime<Utc>) -> Result<String, BackupError> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let claims = Claims {
            iss: &self.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| BackupError::Credential(format!("invalid private key: {}", e)))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| BackupError::Credential(format!("cannot sign assertion: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Authenticated HTTP session shared read-only by everything that talks to Drive.
#[derive(Debug, Clone)]
pub struct Session {
    http: reqwest::Client,
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Loads the service account key and exchanges a signed assertion for an
/// access token. Any failure is a [`BackupError::Credential`].
pub async fn authenticate(credentials_path: &Path) -> Result<Session, BackupError> {
    let key = ServiceAccountKey::from_file(credentials_path)?;
    let now = Utc::now();
    let assertion = key.assertion(now)?;

    let http = reqwest::Client::new();
    let response = http
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await
        .map_err(|e| BackupError::Credential(format!("token request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(BackupError::Credential(format!(
            "token endpoint answered {}: {}",
            status, body
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| BackupError::Credential(format!("unreadable token response: {}", e)))?;

    let lifetime = token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
    info!("Authenticated as {}", key.client_email);

    Ok(Session {
        http,
        access_token: token.access_token,
        expires_at: now + Duration::seconds(lifetime),
    })
}
