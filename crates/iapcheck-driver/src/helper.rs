use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use iapcheck_config::Settings;
use tracing::{info, warn};

use crate::error::{HelperError, InventoryError};
use crate::exec::{CommandRunner, SystemRunner};
use crate::forward::RemotePortForwarder;
use crate::inventory::{GcpInventory, Inventory};
use crate::request::{AuthorizedClient, IapTarget, ReqwestTransport, Transport};
use crate::retry::RetryPolicy;
use crate::ssh::IapSsh;
use crate::terraform::TerraformDeployer;
use crate::token::{AdcIdTokenProvider, IdTokenProvider};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

const OUTPUT_LOAD_BALANCER_IP: &str = "load-balancer-ip";
const OUTPUT_MIG_NAME: &str = "mig_name";
const OUTPUT_BACKEND_SERVICE: &str = "backend_service_name";

/// Everything [`IapHelper`] talks to. Swap parts out to test without a cloud.
pub struct IapHelperParts {
    pub runner: Arc<dyn CommandRunner>,
    pub tokens: Arc<dyn IdTokenProvider>,
    pub inventory: Arc<dyn Inventory>,
    pub transport: Arc<dyn Transport>,
}

/// Entry point for IAP connectivity checks: owns the Terraform deployment,
/// the authorized request client and the IAP ssh channel.
pub struct IapHelper {
    settings: Settings,
    deployer: TerraformDeployer,
    inventory: Arc<dyn Inventory>,
    client: AuthorizedClient,
    ssh: IapSsh,
}

impl IapHelper {
    /// Production wiring: system processes, ADC for ID and access tokens.
    pub async fn from_settings(settings: Settings) -> Result<Self, HelperError> {
        let tokens = AdcIdTokenProvider::from_environment()?;
        let inventory = GcpInventory::from_adc().await?;
        let parts = IapHelperParts {
            runner: Arc::new(SystemRunner),
            tokens: Arc::new(tokens),
            inventory: Arc::new(inventory),
            transport: Arc::new(ReqwestTransport::default()),
        };
        Ok(Self::with_parts(settings, parts))
    }

    pub fn with_parts(settings: Settings, parts: IapHelperParts) -> Self {
        let deployer = TerraformDeployer::new(
            settings.plan_dir.clone(),
            settings.iac_binary.clone(),
            settings.plan_variables(),
            parts.runner.clone(),
        );
        let client = AuthorizedClient::new(
            IapTarget::default(),
            settings.oauth_client_id.clone(),
            parts.tokens,
            parts.transport,
        )
        .with_backoff(RetryPolicy::with_deadline(DEFAULT_REQUEST_TIMEOUT));
        Self {
            settings,
            deployer,
            inventory: parts.inventory,
            client,
            ssh: IapSsh::new(parts.runner),
        }
    }

    /// Replace the request backoff shape (the deadline still comes per call).
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.client = self.client.with_backoff(backoff);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn ssh(&self) -> &IapSsh {
        &self.ssh
    }

    pub async fn create_resources(&self) -> Result<(), HelperError> {
        Ok(self.deployer.apply().await?)
    }

    pub async fn destroy_resources(&self) -> Result<(), HelperError> {
        Ok(self.deployer.destroy().await?)
    }

    /// GET `path` through the load balancer with an IAP identity token,
    /// retrying for up to `timeout` while the endpoint is unavailable.
    pub async fn send_authorized_request(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<String, HelperError> {
        let raw = self.load_balancer_ip().await?;
        let ip: IpAddr = raw.parse().map_err(|_| HelperError::InvalidAddress(raw.clone()))?;
        Ok(self.client.send(ip, path, timeout).await?)
    }

    pub async fn load_balancer_ip(&self) -> Result<String, HelperError> {
        Ok(self.deployer.read_output(OUTPUT_LOAD_BALANCER_IP).await?)
    }

    pub async fn mig_name(&self) -> Result<String, HelperError> {
        Ok(self.deployer.read_output(OUTPUT_MIG_NAME).await?)
    }

    pub async fn backend_service_name(&self) -> Result<String, HelperError> {
        Ok(self.deployer.read_output(OUTPUT_BACKEND_SERVICE).await?)
    }

    /// Backend service name in the form IAP policies refer to:
    /// `/projects/<number>/global/backendServices/<id>`.
    pub async fn backend_service_name_for_iap(&self) -> Result<String, HelperError> {
        let project = &self.settings.project_id;
        let number = self.inventory.project_number(project).await?;
        let name = self.backend_service_name().await?;
        let id = self.inventory.backend_service_id(project, &name).await?;
        let iap_name = format!("/projects/{}/global/backendServices/{}", number, id);
        info!(%iap_name, "backend service name for IAP");
        Ok(iap_name)
    }

    /// Self-link of the instance serving behind the load balancer.
    pub async fn instance_uri(&self) -> Result<String, HelperError> {
        let mig = self.mig_name().await?;
        let mut instances = self
            .inventory
            .managed_instances(&self.settings.project_id, &self.settings.region, &mig)
            .await?;
        if instances.len() > 1 {
            warn!(%mig, count = instances.len(), "instance group has several instances; using the first");
        }
        if instances.is_empty() {
            return Err(InventoryError::NoInstances(mig).into());
        }
        Ok(instances.swap_remove(0))
    }

    /// Port forward from `remote_port` on `instance` to `local_port` here.
    /// Nothing happens until it is opened.
    pub fn forward_remote_port_to_local(
        &self,
        instance: &str,
        remote_port: u16,
        local_port: u16,
    ) -> RemotePortForwarder {
        RemotePortForwarder::new(self.ssh.clone(), instance, remote_port, local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttemptError, ProvisionError, RequestError};
    use crate::exec::ScriptedRunner;
    use crate::request::AuthorizedGet;
    use crate::token::StaticIdToken;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct FixedInventory {
        instances: Vec<String>,
    }

    #[async_trait]
    impl Inventory for FixedInventory {
        async fn project_number(&self, _project_id: &str) -> Result<String, InventoryError> {
            Ok("123456789012".into())
        }

        async fn backend_service_id(
            &self,
            _project_id: &str,
            name: &str,
        ) -> Result<String, InventoryError> {
            assert_eq!(name, "iap-backend");
            Ok("4242".into())
        }

        async fn managed_instances(
            &self,
            _project_id: &str,
            region: &str,
            mig: &str,
        ) -> Result<Vec<String>, InventoryError> {
            assert_eq!(region, "us-east1");
            assert_eq!(mig, "iap-mig");
            Ok(self.instances.clone())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<AuthorizedGet>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn get(&self, req: &AuthorizedGet) -> Result<String, AttemptError> {
            self.seen.lock().unwrap().push(req.clone());
            Ok("Hello World!".into())
        }
    }

    fn settings() -> Settings {
        Settings {
            project_id: "iap-tests".into(),
            oauth_client_id: "client-123.apps.googleusercontent.com".into(),
            oauth_client_secret: "s3cret".into(),
            region: "us-east1".into(),
            skip_provisioning: false,
            plan_dir: PathBuf::from("/plans/iap"),
            iac_binary: "terraform".into(),
        }
    }

    fn scripted_runner() -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .reply("output -raw load-balancer-ip", "203.0.113.5\n")
            .reply("output -raw mig_name", "iap-mig\n")
            .reply("output -raw backend_service_name", "iap-backend\n");
        runner
    }

    fn helper(
        runner: Arc<ScriptedRunner>,
        transport: Arc<RecordingTransport>,
        instances: Vec<String>,
    ) -> IapHelper {
        IapHelper::with_parts(
            settings(),
            IapHelperParts {
                runner,
                tokens: Arc::new(StaticIdToken("fake-id-token".into())),
                inventory: Arc::new(FixedInventory { instances }),
                transport,
            },
        )
    }

    #[tokio::test]
    async fn create_and_destroy_drive_terraform_with_plan_variables() {
        let runner = scripted_runner();
        let h = helper(runner.clone(), Arc::default(), vec![]);
        h.create_resources().await.unwrap();
        h.destroy_resources().await.unwrap();

        let calls = runner.calls();
        let steps: Vec<&str> = calls.iter().map(|c| c.args[0].as_str()).collect();
        assert_eq!(steps, vec!["init", "apply", "destroy"]);
        assert_eq!(calls[1].env["TF_VAR_oauth2_client_id"], "client-123.apps.googleusercontent.com");
        assert_eq!(calls[1].env["TF_VAR_project_id"], "iap-tests");
    }

    #[tokio::test]
    async fn apply_failure_surfaces_as_provision_error() {
        let runner = scripted_runner();
        runner.fail("apply", 1, "Error: quota exceeded");
        let h = helper(runner, Arc::default(), vec![]);
        let err = h.create_resources().await.unwrap_err();
        assert!(matches!(err, HelperError::Provision(ProvisionError::Step { step: "apply", .. })));
    }

    #[tokio::test]
    async fn authorized_request_targets_load_balancer_output() {
        let transport = Arc::new(RecordingTransport::default());
        let h = helper(scripted_runner(), transport.clone(), vec![]);

        let body = h.send_authorized_request("/", DEFAULT_REQUEST_TIMEOUT).await.unwrap();
        assert!(body.contains("Hello"));

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url, "https://example.com/");
        assert_eq!(seen[0].resolve_to, "203.0.113.5:443".parse().unwrap());
        assert_eq!(seen[0].bearer, "fake-id-token");
    }

    #[tokio::test]
    async fn garbage_load_balancer_ip_is_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply("output -raw load-balancer-ip", "not-an-ip\n");
        let h = helper(runner, Arc::default(), vec![]);
        let err = h.send_authorized_request("/", DEFAULT_REQUEST_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, HelperError::InvalidAddress(ref a) if a == "not-an-ip"));
    }

    #[tokio::test]
    async fn backend_service_name_for_iap_combines_number_and_id() {
        let h = helper(scripted_runner(), Arc::default(), vec![]);
        let name = h.backend_service_name_for_iap().await.unwrap();
        assert_eq!(name, "/projects/123456789012/global/backendServices/4242");
    }

    #[tokio::test]
    async fn instance_uri_is_first_group_member() {
        let h = helper(
            scripted_runner(),
            Arc::default(),
            vec![
                "https://www.googleapis.com/compute/v1/projects/iap-tests/zones/us-east1-b/instances/a".into(),
                "https://www.googleapis.com/compute/v1/projects/iap-tests/zones/us-east1-c/instances/b".into(),
            ],
        );
        let uri = h.instance_uri().await.unwrap();
        assert!(uri.ends_with("/instances/a"));
    }

    #[tokio::test]
    async fn empty_instance_group_is_an_error() {
        let h = helper(scripted_runner(), Arc::default(), vec![]);
        let err = h.instance_uri().await.unwrap_err();
        assert!(matches!(err, HelperError::Inventory(InventoryError::NoInstances(_))));
    }

    #[tokio::test]
    async fn forwarder_uses_iap_ssh_for_instance() {
        let runner = scripted_runner();
        let h = helper(runner.clone(), Arc::default(), vec![]);
        let mut fwd = h.forward_remote_port_to_local("vm-1", 80, 8000);
        fwd.open().await.unwrap();
        fwd.close().await.unwrap();
        assert!(runner
            .commands()
            .iter()
            .all(|c| c.starts_with("gcloud compute ssh vm-1 --tunnel-through-iap --")));
    }

    #[test]
    fn request_error_wraps_attempt_error() {
        let err: HelperError = RequestError::from(AttemptError::Unavailable("x".into())).into();
        assert!(matches!(err, HelperError::Request(_)));
    }
}
