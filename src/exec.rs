//! Local process execution
//!
//! Every external tool the runner drives (ssh, scp, az, kubectl, helm,
//! clusterctl, make) is launched through a [`CommandRunner`]. The trait is the
//! seam tests mock; [`LocalRunner`] is the real implementation on top of
//! `tokio::process`.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A command to launch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments, passed without a shell
    pub args: Vec<String>,
    /// Data written to standard input, then closed
    pub stdin: Option<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Wall-clock budget
    pub timeout: Option<Duration>,
    /// Echo output lines to the log as they arrive
    pub stream: bool,
    /// Arguments carry credentials and are never displayed
    pub redact: bool,
}

impl CommandSpec {
    /// Create a spec for `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` on standard input
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Bound the run time
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Echo output to the log while running
    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Hide arguments from logs and error messages
    pub fn redacted(mut self) -> Self {
        self.redact = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        if self.redact {
            return write!(f, " <redacted>");
        }
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub status: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with status 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed standard output
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Turn a non-zero exit into [`Error::CommandFailed`]
    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::command_failed(format!(
                "`{}` exited with {}: {}",
                spec,
                self.status
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                self.stderr.trim()
            )))
        }
    }
}

/// Launches processes.
///
/// A non-zero exit is not an error at this layer: callers see the status and
/// decide. Errors are reserved for spawn failures, timeouts and cancellation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput>;
}

/// Runs commands on the local host.
#[derive(Clone, Debug, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// Create a local runner
    pub fn new() -> Self {
        Self
    }
}

async fn drain<R>(reader: R, echo: bool, label: &'static str) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Some(line) = lines.next_line().await? {
        if echo {
            info!(stream = label, "{}", line);
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    Ok(collected)
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(spec.to_string()));
        }
        debug!(command = %spec, "Running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::command_failed(format!("failed to spawn {}: {}", spec.program, e))
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(error = %e, "Failed to write command stdin");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::command_failed("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::command_failed("stderr was not captured"))?;

        let outcome = {
            let completion = async {
                let (out, err, status) = tokio::join!(
                    drain(stdout, spec.stream, "stdout"),
                    drain(stderr, spec.stream, "stderr"),
                    child.wait()
                );
                Ok::<_, std::io::Error>((out?, err?, status?))
            };
            let bounded = async {
                match spec.timeout {
                    Some(timeout) => tokio::time::timeout(timeout, completion)
                        .await
                        .map_err(|_| Error::CommandTimeout {
                            command: spec.to_string(),
                            timeout,
                        }),
                    None => Ok(completion.await),
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::cancelled(spec.to_string())),
                result = bounded => result,
            }
        };

        let (stdout, stderr, status) = match outcome {
            Ok(io_result) => io_result?,
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    debug!(error = %kill_err, "Failed to kill command");
                }
                return Err(e);
            }
        };

        let output = CommandOutput {
            status: status.code(),
            stdout,
            stderr,
        };
        if !output.success() {
            debug!(command = %spec, status = ?output.status, "Command exited non-zero");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn builder_collects_arguments_and_renders_them() {
        let spec = CommandSpec::new("kubectl")
            .args(["get", "nodes"])
            .arg("-o=json")
            .env("KUBECONFIG", "/tmp/kubeconfig")
            .timeout(Duration::from_secs(30));
        assert_eq!(spec.to_string(), "kubectl get nodes -o=json");
        assert_eq!(spec.env[0].0, "KUBECONFIG");
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn redacted_specs_never_display_their_arguments() {
        let spec = CommandSpec::new("az")
            .args(["login", "--password", "hunter2"])
            .redacted();
        assert_eq!(spec.to_string(), "az <redacted>");
    }

    #[test]
    fn check_turns_non_zero_into_command_failed() {
        let spec = CommandSpec::new("helm");
        let out = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "Error: repo not found\n".to_string(),
        };
        let err = out.check(&spec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert!(err.to_string().contains("repo not found"));
    }

    #[tokio::test]
    async fn local_runner_captures_stdout_and_status() {
        let cancel = CancellationToken::new();
        let out = LocalRunner::new()
            .run(&CommandSpec::new("sh").args(["-c", "echo hello; exit 3"]), &cancel)
            .await
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout_trimmed(), "hello");
    }

    #[tokio::test]
    async fn local_runner_feeds_stdin() {
        let cancel = CancellationToken::new();
        let out = LocalRunner::new()
            .run(&CommandSpec::new("cat").stdin("from stdin"), &cancel)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_trimmed(), "from stdin");
    }

    #[tokio::test]
    async fn local_runner_enforces_timeout() {
        let cancel = CancellationToken::new();
        let err = LocalRunner::new()
            .run(
                &CommandSpec::new("sleep")
                    .arg("10")
                    .timeout(Duration::from_millis(100)),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandTimeout);
    }

    #[tokio::test]
    async fn local_runner_stops_on_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = LocalRunner::new()
            .run(&CommandSpec::new("sleep").arg("10"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn spawn_failure_is_command_failed() {
        let cancel = CancellationToken::new();
        let err = LocalRunner::new()
            .run(&CommandSpec::new("definitely-not-a-real-binary-e2e"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
    }
}
