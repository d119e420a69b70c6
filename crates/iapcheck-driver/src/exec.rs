use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ExecError;

/// External tools should never need more than 30 minutes for a single step;
/// past that the process is killed and a clear error is returned.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

// ── Invocation ────────────────────────────────────────────────────────────────

/// A fully described external command.
///
/// `Display` renders a shell-quoted command line for logs. Environment values
/// are never rendered; they may carry secrets (`TF_VAR_oauth2_client_secret`).
#[derive(Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.to_string())
            .field("cwd", &self.cwd)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// POSIX shell quoting, only where needed.
fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\"'\"'"))
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over process execution, so tests can script it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is not an error here.
    async fn output(&self, inv: &Invocation) -> Result<CommandOutput, ExecError>;

    /// Start a background process with inherited stdio. The child is killed
    /// if its handle is dropped.
    fn spawn(&self, inv: &Invocation) -> Result<Child, ExecError>;

    /// Run to completion; a non-zero exit becomes [`ExecError::NonZeroExit`].
    /// Returns stdout.
    async fn check(&self, inv: &Invocation) -> Result<String, ExecError> {
        let out = self.output(inv).await?;
        if out.code != 0 {
            return Err(ExecError::NonZeroExit {
                command: inv.to_string(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, inv: &Invocation) -> Result<CommandOutput, ExecError> {
        let command = inv.to_string();
        info!(%command, "executing command");

        let mut child = inv
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn { program: inv.program.clone(), source: e })?;

        // Read both streams concurrently so neither pipe fills up and blocks
        // the child. Each line is also mirrored to tracing.
        let stdout_task = tokio::spawn(collect_lines(child.stdout.take(), "stdout"));
        let stderr_task = tokio::spawn(collect_lines(child.stderr.take(), "stderr"));

        let limit = inv.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let finished = tokio::time::timeout(limit, async {
            let status = child.wait().await;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            (status, stdout, stderr)
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(done) => done,
            Err(_) => {
                let _ = child.kill().await;
                return Err(ExecError::TimedOut { command, secs: limit.as_secs() });
            }
        };

        let status = status.map_err(|e| ExecError::Wait { program: inv.program.clone(), source: e })?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(%command, code, "command exited non-zero");
        }
        Ok(CommandOutput { code, stdout, stderr })
    }

    fn spawn(&self, inv: &Invocation) -> Result<Child, ExecError> {
        info!(command = %inv, "starting background command");
        inv.command()
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn { program: inv.program.clone(), source: e })
    }
}

async fn collect_lines<R>(reader: Option<R>, stream: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let mut text = String::new();
    let Some(reader) = reader else {
        return text;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "iapcheck::exec", stream, "{}", line);
        text.push_str(&line);
        text.push('\n');
    }
    text
}

// ── Scripted runner (tests) ───────────────────────────────────────────────────

/// Test runner: records every invocation and answers from canned replies.
///
/// A reply matches when its needle is a substring of the rendered command
/// line; the first match wins and unmatched commands succeed with no output.
/// `spawn` starts an inert `sleep` so callers get a real [`Child`] to manage.
#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
pub struct ScriptedRunner {
    replies: std::sync::Mutex<Vec<(String, CommandOutput)>>,
    calls: std::sync::Mutex<Vec<Invocation>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `stdout` for commands containing `needle`.
    pub fn reply(&self, needle: &str, stdout: &str) -> &Self {
        self.push(needle, CommandOutput { code: 0, stdout: stdout.into(), stderr: String::new() })
    }

    /// Exit with `code` for commands containing `needle`.
    pub fn fail(&self, needle: &str, code: i32, stderr: &str) -> &Self {
        self.push(needle, CommandOutput { code, stdout: String::new(), stderr: stderr.into() })
    }

    fn push(&self, needle: &str, out: CommandOutput) -> &Self {
        self.replies.lock().unwrap().push((needle.to_string(), out));
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered command lines, in call order.
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn output(&self, inv: &Invocation) -> Result<CommandOutput, ExecError> {
        self.calls.lock().unwrap().push(inv.clone());
        let line = inv.to_string();
        let replies = self.replies.lock().unwrap();
        Ok(replies
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    fn spawn(&self, inv: &Invocation) -> Result<Child, ExecError> {
        self.calls.lock().unwrap().push(inv.clone());
        Command::new("sleep")
            .arg("300")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn { program: "sleep".into(), source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_only_unsafe_words() {
        let inv = Invocation::new("gcloud")
            .args(["compute", "ssh", "vm-1", "--"])
            .arg("sudo pkill -f 'python3 -m http.server'");
        assert_eq!(
            inv.to_string(),
            r#"gcloud compute ssh vm-1 -- 'sudo pkill -f '"'"'python3 -m http.server'"'"''"#
        );
    }

    #[test]
    fn debug_hides_env_values() {
        let inv = Invocation::new("terraform").env("TF_VAR_oauth2_client_secret", "hunter2");
        let shown = format!("{:?}", inv);
        assert!(shown.contains("TF_VAR_oauth2_client_secret"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn system_runner_captures_stdout_and_exit_code() {
        let out = SystemRunner
            .output(&Invocation::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn check_turns_non_zero_exit_into_error() {
        let err = SystemRunner
            .check(&Invocation::new("sh").args(["-c", "echo broken >&2; exit 2"]))
            .await
            .unwrap_err();
        match err {
            ExecError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn system_runner_passes_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let out = SystemRunner
            .check(
                &Invocation::new("sh")
                    .args(["-c", "echo $GREETING; pwd"])
                    .env("GREETING", "hi")
                    .current_dir(dir.path()),
            )
            .await
            .unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("hi"));
        let cwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn system_runner_kills_on_timeout() {
        let err = SystemRunner
            .output(&Invocation::new("sleep").arg("30").timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = SystemRunner
            .output(&Invocation::new("definitely-not-a-real-binary-iapcheck"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn scripted_runner_matches_first_needle() {
        let runner = ScriptedRunner::new();
        runner.reply("output -raw mig_name", "mig-1\n").fail("apply", 1, "boom");

        let out = runner
            .output(&Invocation::new("terraform").args(["output", "-raw", "mig_name"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "mig-1\n");

        let err = runner
            .check(&Invocation::new("terraform").arg("apply"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(runner.commands().len(), 2);
    }
}
