use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::TokenError;

const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const METADATA_BASE: &str = "http://metadata.google.internal";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Upper bound for one token endpoint or metadata server round trip. A
/// metadata host that resolves but never answers must not stall the caller.
const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

// ── Token provider ────────────────────────────────────────────────────────────

/// Source of OIDC identity tokens for a target audience.
///
/// Implementations do not cache: every call may hit the network.
#[async_trait]
pub trait IdTokenProvider: Send + Sync {
    async fn id_token(&self, audience: &str) -> Result<String, TokenError>;
}

/// Returns a fixed token without any network call.
pub struct StaticIdToken(pub String);

#[async_trait]
impl IdTokenProvider for StaticIdToken {
    async fn id_token(&self, _audience: &str) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }
}

// ── Application Default Credentials ───────────────────────────────────────────

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

enum Credentials {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
    Metadata { base: String },
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    target_audience: &'a str,
    iat: i64,
    exp: i64,
}

/// Identity tokens from Application Default Credentials.
///
/// Resolution order:
/// 1. `GOOGLE_APPLICATION_CREDENTIALS` (service account key or authorized user)
/// 2. gcloud's well-known `application_default_credentials.json`
/// 3. the GCE metadata server
pub struct AdcIdTokenProvider {
    client: reqwest::Client,
    credentials: Credentials,
    oauth_token_url: String,
    timeout: Duration,
}

impl AdcIdTokenProvider {
    pub fn from_environment() -> Result<Self, TokenError> {
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return Self::from_credentials_file(path);
        }
        if let Some(path) = well_known_file().filter(|p| p.exists()) {
            return Self::from_credentials_file(path);
        }
        let base = std::env::var("GCE_METADATA_HOST")
            .map(|host| format!("http://{}", host))
            .unwrap_or_else(|_| METADATA_BASE.into());
        debug!(%base, "no credentials file; falling back to metadata server");
        Ok(Self::metadata_server(base))
    }

    /// Credentials from a service account key or an authorized-user file.
    pub fn from_credentials_file(path: impl AsRef<Path>) -> Result<Self, TokenError> {
        let path = path.as_ref();
        let io_err = |e: std::io::Error| TokenError::CredentialsFile {
            path: path.display().to_string(),
            source: e,
        };
        let raw = std::fs::read_to_string(path).map_err(io_err)?;
        let json: Value = serde_json::from_str(&raw).map_err(|e| {
            io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let kind = json["type"].as_str().unwrap_or("").to_string();
        let parse_err = |e: serde_json::Error| {
            io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        };
        let credentials = match kind.as_str() {
            "service_account" => {
                Credentials::ServiceAccount(serde_json::from_value(json).map_err(parse_err)?)
            }
            "authorized_user" => {
                Credentials::AuthorizedUser(serde_json::from_value(json).map_err(parse_err)?)
            }
            _ => return Err(TokenError::UnsupportedCredentials(kind.clone())),
        };
        debug!(path = %path.display(), kind = %kind, "loaded credentials file");
        Ok(Self {
            client: reqwest::Client::new(),
            credentials,
            oauth_token_url: OAUTH_TOKEN_URL.into(),
            timeout: DEFAULT_TOKEN_TIMEOUT,
        })
    }

    pub fn metadata_server(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials: Credentials::Metadata { base: base.into() },
            oauth_token_url: OAUTH_TOKEN_URL.into(),
            timeout: DEFAULT_TOKEN_TIMEOUT,
        }
    }

    /// Point refresh-token exchanges at a different OAuth endpoint.
    pub fn with_oauth_token_url(mut self, url: impl Into<String>) -> Self {
        self.oauth_token_url = url.into();
        self
    }

    /// Limit for each token request, connect included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn service_account_token(
        &self,
        key: &ServiceAccountKey,
        audience: &str,
    ) -> Result<String, TokenError> {
        let token_uri = key.token_uri.as_deref().unwrap_or(OAUTH_TOKEN_URL);
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            sub: &key.client_email,
            aud: token_uri,
            target_audience: audience,
            iat: now,
            exp: now + 3600,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();
        let assertion = jsonwebtoken::encode(
            &header,
            &claims,
            &EncodingKey::from_rsa_pem(key.private_key.as_bytes())?,
        )?;

        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        self.exchange(token_uri, &form).await
    }

    async fn authorized_user_token(&self, user: &AuthorizedUser) -> Result<String, TokenError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", user.client_id.as_str()),
            ("client_secret", user.client_secret.as_str()),
            ("refresh_token", user.refresh_token.as_str()),
        ];
        self.exchange(&self.oauth_token_url, &form).await
    }

    /// POST a form to an OAuth token endpoint and pull `id_token` out of the reply.
    async fn exchange(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<String, TokenError> {
        let endpoint_err = |message: String| TokenError::Endpoint {
            endpoint: endpoint.to_string(),
            message,
        };
        let resp = self
            .client
            .post(endpoint)
            .form(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| endpoint_err(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| endpoint_err(format!("decode response: {}", e)))?;
        if !status.is_success() {
            return Err(endpoint_err(extract_oauth_error(status.as_u16(), &body)));
        }
        body["id_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| endpoint_err("response has no id_token".into()))
    }

    async fn metadata_token(&self, base: &str, audience: &str) -> Result<String, TokenError> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/identity",
            base.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .query(&[("audience", audience), ("format", "full")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TokenError::Endpoint {
                        endpoint: url.clone(),
                        message: format!("timed out after {:?}", self.timeout),
                    }
                } else {
                    TokenError::NoCredentials(format!("metadata server unreachable: {}", e))
                }
            })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| TokenError::Endpoint {
            endpoint: url.clone(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(TokenError::Endpoint {
                endpoint: url,
                message: format!("{}: {}", status.as_u16(), text.trim()),
            });
        }
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl IdTokenProvider for AdcIdTokenProvider {
    async fn id_token(&self, audience: &str) -> Result<String, TokenError> {
        info!(audience, "fetching ID token");
        match &self.credentials {
            Credentials::ServiceAccount(key) => self.service_account_token(key, audience).await,
            Credentials::AuthorizedUser(user) => self.authorized_user_token(user).await,
            Credentials::Metadata { base } => self.metadata_token(base, audience).await,
        }
    }
}

fn well_known_file() -> Option<PathBuf> {
    let config_dir = match std::env::var("CLOUDSDK_CONFIG") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from(std::env::var("HOME").ok()?).join(".config").join("gcloud"),
    };
    Some(config_dir.join("application_default_credentials.json"))
}

/// `"400: invalid_grant: Bad Request"` from an OAuth error body.
fn extract_oauth_error(status: u16, body: &Value) -> String {
    let error = body["error"].as_str().unwrap_or("unknown_error");
    match body["error_description"].as_str() {
        Some(description) => format!("{}: {}: {}", status, error, description),
        None => format!("{}: {}", status, error),
    }
}
