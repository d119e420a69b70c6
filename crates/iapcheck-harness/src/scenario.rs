use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use iapcheck_driver::{IapHelper, DEFAULT_REQUEST_TIMEOUT};
use tracing::{info, warn};

use crate::error::ScenarioError;
use crate::file_server::StaticFileServer;

/// Command that stops the demo web server baked into the instance image.
pub const KILL_WEB_SERVER: &str = "sudo pkill -f 'python3 -m http.server'";

const BASELINE_GREETING: &str = "Hello";
const PAGE_CONTENT: &str = "System tests";

/// Knobs for [`ConnectivityScenario`].
#[derive(Debug, Clone)]
pub struct ScenarioSettings {
    /// Budget for the first request; a fresh deployment can take a long time
    /// before IAP lets traffic through.
    pub baseline_timeout: Duration,
    pub request_timeout: Duration,
    /// Port the load balancer sends traffic to on the instance.
    pub remote_port: u16,
    /// Local port for the replacement file server. 0 picks a free one.
    pub local_port: u16,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            baseline_timeout: Duration::from_secs(20 * 60),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            remote_port: 80,
            local_port: 8000,
        }
    }
}

/// End-to-end check that IAP-authorized requests reach the backend, first
/// the instance's own web server and then a local one forwarded in its place.
pub struct ConnectivityScenario {
    helper: IapHelper,
    settings: ScenarioSettings,
}

impl ConnectivityScenario {
    pub fn new(helper: IapHelper) -> Self {
        Self { helper, settings: ScenarioSettings::default() }
    }

    pub fn with_settings(mut self, settings: ScenarioSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn helper(&self) -> &IapHelper {
        &self.helper
    }

    /// Provision, run, tear down. Provisioning is skipped entirely when the
    /// settings ask for it. Teardown runs even if creation or the scenario
    /// failed; the first failure is the one returned.
    pub async fn run_with_provisioning(&self) -> Result<(), ScenarioError> {
        if self.helper.settings().skip_provisioning {
            info!("provisioning skipped; using existing deployment");
            return self.run().await;
        }

        let outcome = match self.helper.create_resources().await {
            Ok(()) => self.run().await,
            Err(e) => Err(e.into()),
        };
        let destroyed = self.helper.destroy_resources().await;

        match (outcome, destroyed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(destroy_err)) => {
                warn!(error = %destroy_err, "destroying resources failed after an earlier error");
                Err(e)
            }
        }
    }

    pub async fn run(&self) -> Result<(), ScenarioError> {
        let lb_ip = self.helper.load_balancer_ip().await?;
        let mig = self.helper.mig_name().await?;
        info!(%lb_ip, %mig, "deployment outputs");
        let instance = self.helper.instance_uri().await?;
        info!(%instance, "serving instance");

        let body = self
            .helper
            .send_authorized_request("/", self.settings.baseline_timeout)
            .await?;
        expect_body("baseline request", &body, BASELINE_GREETING)?;

        info!(%instance, "stopping instance web server");
        self.helper.ssh().run(&instance, &[KILL_WEB_SERVER]).await?;

        let site = tempfile::tempdir().map_err(ScenarioError::Content)?;
        tokio::fs::write(site.path().join("index.html"), PAGE_CONTENT)
            .await
            .map_err(ScenarioError::Content)?;

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.settings.local_port);
        let server = StaticFileServer::start(site.path(), bind)
            .await
            .map_err(ScenarioError::Serve)?;

        let forwarder = self.helper.forward_remote_port_to_local(
            &instance,
            self.settings.remote_port,
            server.local_addr().port(),
        );
        let forwarded = forwarder
            .scope(|| async {
                self.helper
                    .send_authorized_request("/", self.settings.request_timeout)
                    .await
                    .map_err(ScenarioError::from)
            })
            .await;

        let stopped = server.stop().await;
        let body = forwarded?;
        if let Err(e) = stopped {
            warn!(error = %e, "file server did not stop cleanly");
        }
        expect_body("forwarded request", &body, PAGE_CONTENT)?;

        info!("IAP connectivity verified");
        Ok(())
    }
}

fn expect_body(step: &'static str, body: &str, expected: &'static str) -> Result<(), ScenarioError> {
    if body.contains(expected) {
        Ok(())
    } else {
        Err(ScenarioError::UnexpectedBody { step, expected, body: body.to_string() })
    }
}
