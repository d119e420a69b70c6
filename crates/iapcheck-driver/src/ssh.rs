use std::sync::Arc;

use tokio::process::Child;

use crate::error::ExecError;
use crate::exec::{CommandRunner, Invocation};

/// `gcloud compute ssh --tunnel-through-iap` against one instance.
///
/// Everything after `--` is handed to ssh: leading ssh flags (`-R …`) and
/// then the remote command.
#[derive(Clone)]
pub struct IapSsh {
    gcloud: String,
    runner: Arc<dyn CommandRunner>,
}

impl IapSsh {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { gcloud: "gcloud".into(), runner }
    }

    /// Use a different `gcloud` binary.
    pub fn with_binary(mut self, gcloud: impl Into<String>) -> Self {
        self.gcloud = gcloud.into();
        self
    }

    pub fn invocation(&self, instance: &str, remote: &[&str]) -> Invocation {
        Invocation::new(&self.gcloud)
            .args(["compute", "ssh", instance, "--tunnel-through-iap", "--"])
            .args(remote.iter().copied())
    }

    /// Run a remote command to completion. A non-zero exit is an error.
    pub async fn run(&self, instance: &str, remote: &[&str]) -> Result<String, ExecError> {
        self.runner.check(&self.invocation(instance, remote)).await
    }

    /// Start a long-lived ssh session in the background.
    pub fn spawn(&self, instance: &str, remote: &[&str]) -> Result<Child, ExecError> {
        self.runner.spawn(&self.invocation(instance, remote))
    }
}
