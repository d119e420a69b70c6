//! Connectivity scenario against scripted processes and an in-process
//! "load balancer" that follows the reverse tunnel to the local file server.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use iapcheck_config::Settings;
use iapcheck_driver::{
    AttemptError, AuthorizedGet, HelperError, IapHelper, IapHelperParts, Inventory,
    InventoryError, ProvisionError, ScriptedRunner, StaticIdToken, Transport,
};
use iapcheck_harness::{ConnectivityScenario, ScenarioError, ScenarioSettings};
use tracing_subscriber::EnvFilter;

const INSTANCE: &str =
    "https://www.googleapis.com/compute/v1/projects/iap-tests/zones/us-east1-b/instances/iap-mig-a";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct OneInstance;

#[async_trait]
impl Inventory for OneInstance {
    async fn project_number(&self, _project_id: &str) -> Result<String, InventoryError> {
        Ok("123456789012".into())
    }

    async fn backend_service_id(
        &self,
        _project_id: &str,
        _name: &str,
    ) -> Result<String, InventoryError> {
        Ok("4242".into())
    }

    async fn managed_instances(
        &self,
        _project_id: &str,
        _region: &str,
        _mig: &str,
    ) -> Result<Vec<String>, InventoryError> {
        Ok(vec![INSTANCE.into()])
    }
}

/// Answers like the instance's demo server until a reverse tunnel has been
/// started, then fetches from the tunnel's local end like the forward would.
struct TunnelAwareBackend {
    runner: Arc<ScriptedRunner>,
    follow_tunnel: bool,
    requests: Mutex<Vec<AuthorizedGet>>,
}

impl TunnelAwareBackend {
    fn new(runner: Arc<ScriptedRunner>, follow_tunnel: bool) -> Self {
        Self { runner, follow_tunnel, requests: Mutex::new(Vec::new()) }
    }

    /// Local port from `-R 127.0.0.1:<relay>:127.0.0.1:<local>`.
    fn tunnel_local_port(&self) -> Option<u16> {
        self.runner.calls().iter().find_map(|call| {
            let at = call.args.iter().position(|a| a == "-R")?;
            call.args.get(at + 1)?.rsplit(':').next()?.parse().ok()
        })
    }
}

#[async_trait]
impl Transport for TunnelAwareBackend {
    async fn get(&self, req: &AuthorizedGet) -> Result<String, AttemptError> {
        self.requests.lock().unwrap().push(req.clone());
        match self.tunnel_local_port() {
            Some(port) if self.follow_tunnel => {
                let resp = reqwest::get(format!("http://127.0.0.1:{}/", port))
                    .await
                    .map_err(|e| AttemptError::Unavailable(e.to_string()))?;
                resp.text().await.map_err(|e| AttemptError::Unavailable(e.to_string()))
            }
            _ => Ok("Hello World!".into()),
        }
    }
}

fn settings(skip_provisioning: bool) -> Settings {
    Settings {
        project_id: "iap-tests".into(),
        oauth_client_id: "client-123.apps.googleusercontent.com".into(),
        oauth_client_secret: "s3cret".into(),
        region: "us-east1".into(),
        skip_provisioning,
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

fn scenario(
    runner: Arc<ScriptedRunner>,
    backend: Arc<TunnelAwareBackend>,
    skip_provisioning: bool,
) -> ConnectivityScenario {
    let helper = IapHelper::with_parts(
        settings(skip_provisioning),
        IapHelperParts {
            runner,
            tokens: Arc::new(StaticIdToken("fake-id-token".into())),
            inventory: Arc::new(OneInstance),
            transport: backend,
        },
    );
    ConnectivityScenario::new(helper)
        .with_settings(ScenarioSettings { local_port: 0, ..ScenarioSettings::default() })
}

fn position(commands: &[String], needle: &str) -> usize {
    commands
        .iter()
        .position(|c| c.contains(needle))
        .unwrap_or_else(|| panic!("no command containing {needle:?} in {commands:#?}"))
}

#[tokio::test]
async fn scenario_reaches_instance_then_forwarded_file_server() {
    init_tracing();
    let runner = scripted_runner();
    let backend = Arc::new(TunnelAwareBackend::new(runner.clone(), true));

    scenario(runner.clone(), backend.clone(), true).run().await.unwrap();

    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    for req in requests.iter() {
        assert_eq!(req.url, "https://example.com/");
        assert_eq!(req.resolve_to, "203.0.113.5:443".parse().unwrap());
        assert_eq!(req.bearer, "fake-id-token");
    }

    let commands = runner.commands();
    let kill = position(&commands, "pkill -f");
    let install = position(&commands, "apt install -y socat");
    let tunnel = position(&commands, "tcp-listen:80,reuseaddr,fork");
    let reboot = position(&commands, "sudo reboot");
    assert!(kill < install && install < tunnel && tunnel < reboot);
    assert!(commands[kill].contains(INSTANCE));
    assert!(!commands.iter().any(|c| c.contains("terraform apply")));
}

#[tokio::test]
async fn provisioning_wraps_scenario_in_apply_and_destroy() {
    init_tracing();
    let runner = scripted_runner();
    let backend = Arc::new(TunnelAwareBackend::new(runner.clone(), true));

    scenario(runner.clone(), backend, false)
        .run_with_provisioning()
        .await
        .unwrap();

    let commands = runner.commands();
    assert!(position(&commands, "terraform init") < position(&commands, "terraform apply"));
    assert!(position(&commands, "terraform apply") < position(&commands, "pkill -f"));
    assert_eq!(position(&commands, "terraform destroy"), commands.len() - 1);
}

#[tokio::test]
async fn wrong_forwarded_page_fails_but_still_cleans_up() {
    init_tracing();
    let runner = scripted_runner();
    // Keeps answering with the demo page even after the tunnel is up.
    let backend = Arc::new(TunnelAwareBackend::new(runner.clone(), false));

    let err = scenario(runner.clone(), backend, false)
        .run_with_provisioning()
        .await
        .unwrap_err();

    match err {
        ScenarioError::UnexpectedBody { expected, body, .. } => {
            assert_eq!(expected, "System tests");
            assert_eq!(body, "Hello World!");
        }
        other => panic!("unexpected error: {other}"),
    }
    let commands = runner.commands();
    assert!(position(&commands, "sudo reboot") < position(&commands, "terraform destroy"));
}

#[tokio::test]
async fn failed_apply_skips_scenario_and_still_destroys() {
    init_tracing();
    let runner = scripted_runner();
    runner.fail("terraform apply", 1, "Error: quota exceeded");
    let backend = Arc::new(TunnelAwareBackend::new(runner.clone(), true));

    let err = scenario(runner.clone(), backend.clone(), false)
        .run_with_provisioning()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScenarioError::Helper(HelperError::Provision(ProvisionError::Step { step: "apply", .. }))
    ));
    assert!(backend.requests.lock().unwrap().is_empty());
    assert!(runner.commands().iter().any(|c| c.contains("terraform destroy")));
}

#[tokio::test]
async fn failed_kill_over_ssh_aborts_before_forwarding() {
    init_tracing();
    let runner = scripted_runner();
    runner.fail("pkill -f", 255, "Connection closed by remote host");
    let backend = Arc::new(TunnelAwareBackend::new(runner.clone(), true));

    let err = scenario(runner.clone(), backend, true).run().await.unwrap_err();

    assert!(matches!(err, ScenarioError::Remote(_)));
    assert!(!runner.commands().iter().any(|c| c.contains("socat")));
}
