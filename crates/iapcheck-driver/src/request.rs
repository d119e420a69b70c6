use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use tracing::{debug, info};

use crate::error::{AttemptError, RequestError};
use crate::retry::RetryPolicy;
use crate::token::IdTokenProvider;

// ── Target ────────────────────────────────────────────────────────────────────

/// Virtual host the load balancer's certificate and URL map are set up for.
///
/// Requests are addressed to this host name while DNS resolution is pinned
/// to the load balancer IP discovered at runtime.
#[derive(Debug, Clone)]
pub struct IapTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for IapTarget {
    fn default() -> Self {
        Self {
            scheme: "https".into(),
            host: "example.com".into(),
            port: 443,
        }
    }
}

impl IapTarget {
    pub fn url(&self, path: &str) -> String {
        let default_port = matches!(
            (self.scheme.as_str(), self.port),
            ("https", 443) | ("http", 80)
        );
        let slash = if path.starts_with('/') { "" } else { "/" };
        if default_port {
            format!("{}://{}{}{}", self.scheme, self.host, slash, path)
        } else {
            format!("{}://{}:{}{}{}", self.scheme, self.host, self.port, slash, path)
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// One authorized GET, with DNS for `host` overridden to `resolve_to`.
#[derive(Clone)]
pub struct AuthorizedGet {
    pub url: String,
    pub host: String,
    pub resolve_to: SocketAddr,
    pub bearer: String,
}

impl fmt::Debug for AuthorizedGet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedGet")
            .field("url", &self.url)
            .field("host", &self.host)
            .field("resolve_to", &self.resolve_to)
            .field("bearer", &"<redacted>")
            .finish()
    }
}

/// A single request attempt. Retrying is the caller's business.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, req: &AuthorizedGet) -> Result<String, AttemptError>;
}

/// [`Transport`] over reqwest.
///
/// Certificate validation is disabled: the load balancer is reached by IP
/// with a host override and serves a self-signed certificate for the
/// placeholder host. Only use against isolated test deployments.
/// Redirects are not followed, so an IAP login redirect surfaces as-is.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    attempt_timeout: Duration,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ReqwestTransport {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, req: &AuthorizedGet) -> Result<String, AttemptError> {
        let client = reqwest::Client::builder()
            .resolve(&req.host, req.resolve_to)
            .danger_accept_invalid_certs(true)
            .redirect(Policy::none())
            .timeout(self.attempt_timeout)
            .build()
            .map_err(|e| AttemptError::Fatal(format!("build client: {}", e)))?;

        let resp = client
            .get(&req.url)
            .bearer_auth(&req.bearer)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(AttemptError::Unavailable(format!("{} returned {}", req.url, status)));
        }
        let body = resp.text().await.map_err(classify)?;
        Ok(body.trim().to_string())
    }
}

fn classify(e: reqwest::Error) -> AttemptError {
    if e.is_builder() {
        AttemptError::Fatal(e.to_string())
    } else {
        AttemptError::Unavailable(e.to_string())
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Sends IAP-authorized requests to the load balancer, retrying while the
/// endpoint is unavailable.
pub struct AuthorizedClient {
    target: IapTarget,
    audience: String,
    tokens: Arc<dyn IdTokenProvider>,
    transport: Arc<dyn Transport>,
    backoff: RetryPolicy,
}

impl AuthorizedClient {
    /// `audience` is the OAuth client id protecting the backend.
    pub fn new(
        target: IapTarget,
        audience: impl Into<String>,
        tokens: Arc<dyn IdTokenProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            target,
            audience: audience.into(),
            tokens,
            transport,
            backoff: RetryPolicy::with_deadline(Duration::ZERO),
        }
    }

    /// Replace the backoff shape. The deadline is taken per call.
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn target(&self) -> &IapTarget {
        &self.target
    }

    /// GET `path` on the load balancer at `load_balancer_ip` and return the
    /// trimmed body. A fresh ID token is fetched for every call.
    pub async fn send(
        &self,
        load_balancer_ip: IpAddr,
        path: &str,
        timeout: Duration,
    ) -> Result<String, RequestError> {
        let bearer = self.tokens.id_token(&self.audience).await?;
        info!(%load_balancer_ip, path, "sending request");

        let req = AuthorizedGet {
            url: self.target.url(path),
            host: self.target.host.clone(),
            resolve_to: SocketAddr::new(load_balancer_ip, self.target.port),
            bearer,
        };
        let policy = RetryPolicy { deadline: timeout, ..self.backoff.clone() };
        let req = &req;
        let body = policy
            .run(
                |attempt| {
                    debug!(attempt, url = %req.url, "request attempt");
                    self.transport.get(req)
                },
                AttemptError::is_retryable,
            )
            .await?;

        info!(response = %body, "response");
        Ok(body)
    }
}
