use std::future::Future;
use std::ops::Range;
use std::time::Duration;

use rand::Rng;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::ForwardError;
use crate::ssh::IapSsh;

/// Relay ports on the instance are picked from this range to avoid clashing
/// with a relay left behind by an earlier run.
const RELAY_PORTS: Range<u16> = 8000..9000;

/// How long the tunnel gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

// ── TunnelProcess ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Signaled,
    Terminated,
}

/// Background ssh session carrying the reverse tunnel.
pub struct TunnelProcess {
    child: Child,
    relay_port: u16,
    state: ProcessState,
    signals_sent: u32,
}

impl TunnelProcess {
    pub fn new(child: Child, relay_port: u16) -> Self {
        Self { child, relay_port, state: ProcessState::Running, signals_sent: 0 }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn relay_port(&self) -> u16 {
        self.relay_port
    }

    pub fn signals_sent(&self) -> u32 {
        self.signals_sent
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Never fails: problems are
    /// logged and the process is considered terminated afterwards. Calling
    /// again once terminated does nothing.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.state == ProcessState::Terminated {
            return;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "tunnel process already exited");
                self.state = ProcessState::Terminated;
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to poll tunnel process"),
        }

        if self.state == ProcessState::Running {
            self.send_sigterm();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "tunnel process exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for tunnel process"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f64(), "tunnel process ignored SIGTERM; killing");
                self.signals_sent += 1;
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill tunnel process");
                }
            }
        }
        self.state = ProcessState::Terminated;
    }

    #[cfg(unix)]
    fn send_sigterm(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            self.signals_sent += 1;
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(pid, "sent SIGTERM to tunnel process"),
                Err(e) => warn!(pid, error = %e, "failed to send SIGTERM"),
            }
        }
        self.state = ProcessState::Signaled;
    }

    #[cfg(not(unix))]
    fn send_sigterm(&mut self) {
        self.signals_sent += 1;
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "failed to stop tunnel process");
        }
        self.state = ProcessState::Signaled;
    }
}

// ── RemotePortForwarder ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Idle,
    Installing,
    Active,
    TearingDown,
    Restarting,
}

/// Makes `remote_port` on a compute instance reach `local_port` on this host.
///
/// `socat` on the instance listens on `remote_port` and relays to a random
/// port that an ssh reverse tunnel (`-R`) carries back to the local listener.
/// There is no clean way to stop the remote relay from outside the tunnel, so
/// closing the forward reboots the instance.
///
/// `open` returns once the tunnel process is launched; it does not wait for
/// the forward to carry traffic, so callers retry their own requests.
pub struct RemotePortForwarder {
    ssh: IapSsh,
    instance: String,
    remote_port: u16,
    local_port: u16,
    grace: Duration,
    state: ForwardState,
    tunnel: Option<TunnelProcess>,
}

impl RemotePortForwarder {
    pub fn new(ssh: IapSsh, instance: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            ssh,
            instance: instance.into(),
            remote_port,
            local_port,
            grace: DEFAULT_GRACE,
            state: ForwardState::Idle,
            tunnel: None,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> ForwardState {
        self.state
    }

    pub fn tunnel(&self) -> Option<&TunnelProcess> {
        self.tunnel.as_ref()
    }

    /// Install the relay and launch the tunnel.
    pub async fn open(&mut self) -> Result<(), ForwardError> {
        if self.tunnel.is_some() {
            return Err(ForwardError::AlreadyOpen(self.instance.clone()));
        }

        self.state = ForwardState::Installing;
        info!(instance = %self.instance, "installing socat");
        if let Err(source) = self
            .ssh
            .run(&self.instance, &["sudo", "apt", "install", "-y", "socat"])
            .await
        {
            self.state = ForwardState::Idle;
            return Err(ForwardError::Install { instance: self.instance.clone(), source });
        }

        let relay_port = rand::thread_rng().gen_range(RELAY_PORTS);
        let reverse = format!("127.0.0.1:{}:127.0.0.1:{}", relay_port, self.local_port);
        let listen = format!("tcp-listen:{},reuseaddr,fork", self.remote_port);
        let relay = format!("tcp:localhost:{}", relay_port);
        info!(
            instance = %self.instance,
            remote_port = self.remote_port,
            local_port = self.local_port,
            relay_port,
            "opening reverse tunnel"
        );
        let child = match self.ssh.spawn(
            &self.instance,
            &["-R", reverse.as_str(), "sudo", "socat", listen.as_str(), relay.as_str()],
        ) {
            Ok(child) => child,
            Err(source) => {
                self.state = ForwardState::Idle;
                return Err(ForwardError::Tunnel { instance: self.instance.clone(), source });
            }
        };

        self.tunnel = Some(TunnelProcess::new(child, relay_port));
        self.state = ForwardState::Active;
        Ok(())
    }

    /// Stop the tunnel and reboot the instance. A no-op if nothing is open.
    ///
    /// Tunnel shutdown is best effort; the reboot always runs afterwards and
    /// its failure is returned.
    pub async fn close(&mut self) -> Result<(), ForwardError> {
        let Some(mut tunnel) = self.tunnel.take() else {
            return Ok(());
        };

        self.state = ForwardState::TearingDown;
        tunnel.terminate(self.grace).await;

        self.state = ForwardState::Restarting;
        info!(instance = %self.instance, "restarting instance to clear relay");
        let rebooted = self.ssh.run(&self.instance, &["sudo reboot"]).await;
        self.state = ForwardState::Idle;
        rebooted
            .map(|_| ())
            .map_err(|source| ForwardError::Restart { instance: self.instance.clone(), source })
    }

    /// Open the forward, run `body`, and close the forward whatever `body`
    /// returned. An error from `body` takes precedence over a close error.
    pub async fn scope<F, Fut, T, E>(mut self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ForwardError>,
    {
        self.open().await?;
        let result = body().await;
        let closed = self.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(error = %close_err, "closing port forward failed after an earlier error");
                Err(e)
            }
        }
    }
}

impl Drop for RemotePortForwarder {
    fn drop(&mut self) {
        if let Some(tunnel) = self.tunnel.as_mut() {
            warn!(
                instance = %self.instance,
                "port forward dropped while open; killing tunnel without restarting the instance"
            );
            let _ = tunnel.child.start_kill();
        }
    }
}
