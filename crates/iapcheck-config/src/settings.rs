use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_REGION: &str = "us-east1";

const PROJECT_ID: &str = "GCP_PROJECT_ID";
const CLIENT_ID: &str = "GCP_IAP_OAUTH_CLIENT_ID";
const CLIENT_SECRET: &str = "GCP_IAP_OAUTH_CLIENT_SECRET";
const REGION: &str = "GCP_IAP_REGION";
const SKIP_TERRAFORM: &str = "SKIP_TERRAFORM";
const PLAN_DIR: &str = "IAP_TERRAFORM_PLAN";
const IAC_BINARY: &str = "IAP_TERRAFORM_BINARY";

/// Operator-level settings for an IAP connectivity check.
///
/// Everything comes from the environment so the same test binary runs in CI
/// and on a workstation without flags.
#[derive(Clone)]
pub struct Settings {
    /// Project that hosts the load balancer and instance group.
    pub project_id: String,
    /// OAuth client protecting the backend; also the ID token audience.
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub region: String,
    /// When true, resources are neither created nor destroyed; an existing
    /// deployment is reused.
    pub skip_provisioning: bool,
    /// Directory holding the Terraform plan.
    pub plan_dir: PathBuf,
    /// `terraform` or `tofu`.
    pub iac_binary: String,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing { var: key });

        let skip_provisioning = match get(SKIP_TERRAFORM) {
            Some(raw) => parse_bool(SKIP_TERRAFORM, &raw)?,
            None => false,
        };

        let settings = Self {
            project_id: required(PROJECT_ID)?,
            oauth_client_id: required(CLIENT_ID)?,
            oauth_client_secret: required(CLIENT_SECRET)?,
            region: get(REGION).unwrap_or_else(|| DEFAULT_REGION.into()),
            skip_provisioning,
            plan_dir: get(PLAN_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("iap_terraform_plan")),
            iac_binary: get(IAC_BINARY).unwrap_or_else(|| "terraform".into()),
        };
        debug!(?settings, "loaded settings");
        Ok(settings)
    }

    /// Variables handed to the Terraform plan (exported as `TF_VAR_<name>`).
    pub fn plan_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("region".to_string(), self.region.clone()),
            ("project_id".to_string(), self.project_id.clone()),
            ("oauth2_client_id".to_string(), self.oauth_client_id.clone()),
            ("oauth2_client_secret".to_string(), self.oauth_client_secret.clone()),
        ])
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("project_id", &self.project_id)
            .field("oauth_client_id", &self.oauth_client_id)
            .field("oauth_client_secret", &"<redacted>")
            .field("region", &self.region)
            .field("skip_provisioning", &self.skip_provisioning)
            .field("plan_dir", &self.plan_dir)
            .field("iac_binary", &self.iac_binary)
            .finish()
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::Invalid {
            var,
            message: format!("expected true or false, got {:?}", other),
        }),
    }
}
