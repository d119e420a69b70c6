use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::InventoryError;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

// ── Inventory ─────────────────────────────────────────────────────────────────

/// Read-only lookups against the project hosting the IAP deployment.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Numeric project number for a project id.
    async fn project_number(&self, project_id: &str) -> Result<String, InventoryError>;

    /// Numeric id of a global backend service.
    async fn backend_service_id(&self, project_id: &str, name: &str)
        -> Result<String, InventoryError>;

    /// Self-links of the instances in a regional managed instance group.
    async fn managed_instances(
        &self,
        project_id: &str,
        region: &str,
        mig: &str,
    ) -> Result<Vec<String>, InventoryError>;
}

// ── Base URLs (overridden in tests to point at a mock server) ─────────────────

#[derive(Clone)]
struct BaseUrls {
    resourcemanager: String,
    compute: String,
}

impl Default for BaseUrls {
    fn default() -> Self {
        Self {
            resourcemanager: "https://cloudresourcemanager.googleapis.com".into(),
            compute: "https://compute.googleapis.com".into(),
        }
    }
}

// ── Access token provider ─────────────────────────────────────────────────────

/// Source of GCP access tokens for the REST calls.
#[async_trait]
trait AccessTokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, InventoryError>;
}

/// Production token provider backed by Application Default Credentials.
struct AdcAccessToken {
    inner: std::sync::Arc<dyn gcp_auth::TokenProvider>,
}

#[async_trait]
impl AccessTokenProvider for AdcAccessToken {
    async fn token(&self) -> Result<String, InventoryError> {
        let token = self
            .inner
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|e| InventoryError::Auth(e.to_string()))?;
        Ok(token.as_str().to_string())
    }
}

#[cfg(test)]
struct StaticAccessToken(String);

#[cfg(test)]
#[async_trait]
impl AccessTokenProvider for StaticAccessToken {
    async fn token(&self) -> Result<String, InventoryError> {
        Ok(self.0.clone())
    }
}

// ── GcpInventory ──────────────────────────────────────────────────────────────

/// [`Inventory`] over the Resource Manager and Compute Engine REST APIs.
pub struct GcpInventory {
    client: reqwest::Client,
    token: Box<dyn AccessTokenProvider>,
    base: BaseUrls,
}

impl GcpInventory {
    /// Create a `GcpInventory` using Application Default Credentials.
    pub async fn from_adc() -> Result<Self, InventoryError> {
        let inner = gcp_auth::provider()
            .await
            .map_err(|e| InventoryError::Auth(format!("failed to initialise GCP ADC: {}", e)))?;
        Ok(Self {
            client: reqwest::Client::new(),
            token: Box::new(AdcAccessToken { inner }),
            base: BaseUrls::default(),
        })
    }

    #[cfg(test)]
    fn with_static_token(token: &str, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: Box::new(StaticAccessToken(token.to_string())),
            base: BaseUrls {
                resourcemanager: base_url.to_string(),
                compute: base_url.to_string(),
            },
        }
    }

    /// `"NOT_FOUND: The resource 'projects/p/global/backendServices/x' was not found"`
    fn extract_gcp_error(body: &Value) -> String {
        let err = &body["error"];
        let status = err["status"]
            .as_str()
            .or_else(|| err["errors"][0]["reason"].as_str())
            .unwrap_or("UNKNOWN");
        let message = err["message"].as_str().unwrap_or("unknown error");
        format!("{}: {}", status, message)
    }

    async fn send(&self, req: reqwest::RequestBuilder, url: &str) -> Result<Value, InventoryError> {
        let token = self.token.token().await?;
        let resp = req
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| InventoryError::Request { url: url.to_string(), message: e.to_string() })?;
        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| InventoryError::Request {
            url: url.to_string(),
            message: format!("decode ({}): {}", status.as_u16(), e),
        })?;
        if body.get("error").is_some() || !status.is_success() {
            return Err(InventoryError::Api(Self::extract_gcp_error(&body)));
        }
        Ok(body)
    }
}

#[async_trait]
impl Inventory for GcpInventory {
    async fn project_number(&self, project_id: &str) -> Result<String, InventoryError> {
        let url = format!("{}/v1/projects/{}", self.base.resourcemanager, project_id);
        let body = self.send(self.client.get(&url), &url).await?;
        let number = body["projectNumber"]
            .as_str()
            .ok_or(InventoryError::MissingField { url, field: "projectNumber" })?;
        debug!(project_id, number, "resolved project number");
        Ok(number.to_string())
    }

    async fn backend_service_id(
        &self,
        project_id: &str,
        name: &str,
    ) -> Result<String, InventoryError> {
        let url = format!(
            "{}/compute/v1/projects/{}/global/backendServices/{}",
            self.base.compute, project_id, name
        );
        let body = self.send(self.client.get(&url), &url).await?;
        // The compute API encodes uint64 ids as strings.
        match &body["id"] {
            Value::String(id) => Ok(id.clone()),
            Value::Number(id) => Ok(id.to_string()),
            _ => Err(InventoryError::MissingField { url, field: "id" }),
        }
    }

    async fn managed_instances(
        &self,
        project_id: &str,
        region: &str,
        mig: &str,
    ) -> Result<Vec<String>, InventoryError> {
        let url = format!(
            "{}/compute/v1/projects/{}/regions/{}/instanceGroupManagers/{}/listManagedInstances",
            self.base.compute, project_id, region, mig
        );

        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.client.post(&url).header("Content-Length", "0");
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token)]);
            }
            let body = self.send(req, &url).await?;

            if let Some(items) = body["managedInstances"].as_array() {
                instances.extend(
                    items
                        .iter()
                        .filter_map(|item| item["instance"].as_str())
                        .map(str::to_string),
                );
            }
            match body["nextPageToken"].as_str() {
                Some(next) if !next.is_empty() => page_token = Some(next.to_string()),
                _ => break,
            }
        }
        debug!(mig, count = instances.len(), "listed managed instances");
        Ok(instances)
    }
}
