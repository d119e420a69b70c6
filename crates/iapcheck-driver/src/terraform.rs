use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ExecError, ProvisionError};
use crate::exec::{CommandRunner, Invocation};

// ── TerraformDeployer ─────────────────────────────────────────────────────────

/// Applies and destroys a Terraform (or OpenTofu) plan and reads its outputs.
///
/// Variables are passed to every mutating command as `TF_VAR_<name>`
/// environment entries, never written to disk. Failures are not retried:
/// provisioning errors are assumed to be permanent.
pub struct TerraformDeployer {
    plan_dir: PathBuf,
    binary: String,
    variables: BTreeMap<String, String>,
    runner: Arc<dyn CommandRunner>,
}

impl TerraformDeployer {
    pub fn new(
        plan_dir: impl Into<PathBuf>,
        binary: impl Into<String>,
        variables: BTreeMap<String, String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            plan_dir: plan_dir.into(),
            binary: binary.into(),
            variables,
            runner,
        }
    }

    pub fn plan_dir(&self) -> &Path {
        &self.plan_dir
    }

    /// `init` then `apply -auto-approve`.
    pub async fn apply(&self) -> Result<(), ProvisionError> {
        info!(plan = %self.plan_dir.display(), "applying terraform plan");
        self.step("init", &["init", "-input=false", "-no-color"]).await?;
        self.step("apply", &["apply", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    /// `destroy -auto-approve`.
    pub async fn destroy(&self) -> Result<(), ProvisionError> {
        info!(plan = %self.plan_dir.display(), "destroying terraform plan");
        self.step("destroy", &["destroy", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    /// Value of a declared output, via `terraform output -raw`.
    pub async fn read_output(&self, key: &str) -> Result<String, ProvisionError> {
        let stdout = self
            .runner
            .check(&self.invocation(&["output", "-raw", key]))
            .await
            .map_err(|source| ProvisionError::Output { key: key.to_string(), source })?;
        let value = stdout.trim();
        if value.is_empty() {
            return Err(ProvisionError::EmptyOutput(key.to_string()));
        }
        debug!(key, value, "read terraform output");
        Ok(value.to_string())
    }

    async fn step(&self, step: &'static str, args: &[&str]) -> Result<String, ProvisionError> {
        self.runner
            .check(&self.invocation(args))
            .await
            .map_err(|source: ExecError| ProvisionError::Step { step, source })
    }

    fn invocation(&self, args: &[&str]) -> Invocation {
        let mut inv = Invocation::new(&self.binary)
            .args(args.iter().copied())
            .current_dir(&self.plan_dir)
            // Disable interactive prompts and colour
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0");
        for (name, value) in &self.variables {
            inv = inv.env(format!("TF_VAR_{}", name), value);
        }
        inv
    }
}
