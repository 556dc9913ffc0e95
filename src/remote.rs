//! Remote execution over ssh/scp
//!
//! [`RemoteClient`] runs commands and scripts on a [`RemoteTarget`], moves
//! files with `scp -r`, and waits for TCP reachability. Targets behind a
//! bastion carry it in [`RemoteTarget::proxy_via`]; the `ProxyCommand` option
//! is derived from that structure so no caller ever concatenates ssh strings.
//!
//! Every call goes through the client's [`RetryPolicy`]. By default only
//! transport failures are retried: a command that ran and failed is returned
//! as [`Error::RemoteCommandFailed`] on the first attempt.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use shell_escape::escape;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::poll::{poll_until_ready, PollSpec, Readiness};
use crate::retry::{retry, RetryPolicy};

/// Default ssh port
pub const SSH_PORT: u16 = 22;

/// Default budget for a single remote command
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Starts of the stderr lines ssh and scp print themselves when the
/// transport, not the remote command, failed
const TRANSPORT_ERROR_PREFIXES: &[&str] = &[
    "ssh: connect to host",
    "ssh: Could not resolve hostname",
    "kex_exchange_identification:",
    "Connection closed by ",
    "Connection reset by ",
    "Connection timed out during banner exchange",
    "lost connection",
];

/// A host reachable over ssh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Hostname or IP address
    pub address: String,
    /// Login user
    pub user: String,
    /// Private key; ssh defaults apply when unset
    pub key_path: Option<PathBuf>,
    /// ssh port
    pub port: u16,
    /// Bastion this target is reached through
    pub proxy_via: Option<Box<RemoteTarget>>,
}

impl RemoteTarget {
    /// Target `user@address` on port 22
    pub fn new(address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            key_path: None,
            port: SSH_PORT,
            proxy_via: None,
        }
    }

    /// Authenticate with this private key
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Connect on a non-default port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Reach this target through `bastion`
    pub fn via(mut self, bastion: RemoteTarget) -> Self {
        self.proxy_via = Some(Box::new(bastion));
        self
    }

    /// `user@address`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Transport options shared by ssh and scp.
    ///
    /// `port_flag` is `-p` for ssh and `-P` for scp.
    fn transport_options(&self, port_flag: &str) -> Vec<String> {
        let mut opts = vec!["-q".to_string()];
        if let Some(key) = &self.key_path {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
        }
        opts.extend(
            [
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
            ]
            .map(String::from),
        );
        if self.port != SSH_PORT {
            opts.push(port_flag.to_string());
            opts.push(self.port.to_string());
        }
        if let Some(bastion) = &self.proxy_via {
            opts.push("-o".to_string());
            opts.push(format!("ProxyCommand={}", bastion.proxy_command(self)));
        }
        opts
    }

    /// `ssh <bastion options> -W <hop>:<port> <bastion>` with every token escaped
    fn proxy_command(&self, hop: &RemoteTarget) -> String {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.transport_options("-p"));
        argv.push("-W".to_string());
        argv.push(format!("{}:{}", hop.address, hop.port));
        argv.push(self.destination());
        argv.iter()
            .map(|token| escape(Cow::Borrowed(token.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Full ssh argv (without the program) for running `remote_command`
    pub fn ssh_args(&self, remote_command: &[&str]) -> Vec<String> {
        let mut args = self.transport_options("-p");
        args.push(self.destination());
        args.extend(remote_command.iter().map(|s| s.to_string()));
        args
    }

    fn scp_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = vec!["-r".to_string()];
        args.extend(self.transport_options("-P"));
        args.push(from);
        args.push(to);
        args
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}:{}", self.destination(), path)
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination())?;
        if let Some(bastion) = &self.proxy_via {
            write!(f, " (via {})", bastion)?;
        }
        Ok(())
    }
}

/// Output of a successful remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Build a fail-fast bash script: errexit, nounset, pipefail, optional `cd`,
/// then `lines` in order.
pub fn compose_script<S: AsRef<str>>(lines: &[S], cwd: Option<&str>) -> String {
    let mut script = String::from("set -o errexit\nset -o nounset\nset -o pipefail\n");
    if let Some(cwd) = cwd {
        script.push_str("cd ");
        script.push_str(&quote_remote_path(cwd));
        script.push('\n');
    }
    for line in lines {
        script.push_str(line.as_ref());
        script.push('\n');
    }
    script
}

/// Shell-quote a remote path, leaving a leading `~` unquoted so it expands.
fn quote_remote_path(path: &str) -> String {
    if path == "~" {
        return path.to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", escape(Cow::Borrowed(rest))),
        None => escape(Cow::Borrowed(path)).into_owned(),
    }
}

/// Classify a finished ssh/scp invocation.
fn classify(target: &RemoteTarget, output: CommandOutput) -> Result<RemoteOutput> {
    if output.success() {
        return Ok(RemoteOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    let transport_failed = match output.status {
        None | Some(255) => true,
        Some(_) => output.stderr.lines().any(|line| {
            TRANSPORT_ERROR_PREFIXES
                .iter()
                .any(|p| line.trim_start().starts_with(p))
        }),
    };
    if transport_failed {
        Err(Error::ConnectionFailed {
            target: target.to_string(),
            message: non_empty(output.stderr.trim(), "ssh exited with status 255"),
        })
    } else {
        Err(Error::RemoteCommandFailed {
            target: target.to_string(),
            exit_code: output.status.unwrap_or(-1),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

fn non_empty(s: &str, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}

/// Client for running commands on remote hosts.
#[derive(Clone)]
pub struct RemoteClient {
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RemoteClient {
    /// Create a client with the default policy: 5 attempts, only connection
    /// failures retried.
    pub fn new(runner: Arc<dyn CommandRunner>, cancel: CancellationToken) -> Self {
        Self {
            runner,
            retry: Self::default_policy(),
            cancel,
        }
    }

    /// Policy used when none is given
    pub fn default_policy() -> RetryPolicy {
        RetryPolicy::with_max_attempts(5)
            .max_delay(Duration::from_secs(60))
            .terminal_on([ErrorKind::RemoteCommandFailed, ErrorKind::CommandTimeout])
    }

    /// A client sharing this one's transport with a different retry policy
    pub fn with_retry(&self, policy: RetryPolicy) -> Self {
        Self {
            runner: self.runner.clone(),
            retry: policy,
            cancel: self.cancel.clone(),
        }
    }

    /// A single-attempt client for checks that a poll repeats anyway
    pub fn single_attempt(&self) -> Self {
        self.with_retry(RetryPolicy::with_max_attempts(1))
    }

    /// Run `command` through the remote login shell
    pub async fn run(
        &self,
        target: &RemoteTarget,
        command: &str,
        timeout: Duration,
        cwd: Option<&str>,
    ) -> Result<RemoteOutput> {
        let command = match cwd {
            Some(cwd) => format!("cd {} && {}", quote_remote_path(cwd), command),
            None => command.to_string(),
        };
        let spec = CommandSpec::new("ssh")
            .args(target.ssh_args(&[command.as_str()]))
            .timeout(timeout);
        debug!(target = %target, command = %command, "Running remote command");
        self.invoke(target, &format!("ssh {}", target.address), spec)
            .await
    }

    /// Run `lines` as one fail-fast bash script fed to `bash -s`
    pub async fn run_script<S: AsRef<str>>(
        &self,
        target: &RemoteTarget,
        lines: &[S],
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<RemoteOutput> {
        let spec = CommandSpec::new("ssh")
            .args(target.ssh_args(&["bash", "-s"]))
            .stdin(compose_script(lines, cwd))
            .timeout(timeout);
        self.invoke(target, &format!("ssh script {}", target.address), spec)
            .await
    }

    /// Like [`run_script`](Self::run_script), echoing output to the log as it arrives
    pub async fn run_script_streamed<S: AsRef<str>>(
        &self,
        target: &RemoteTarget,
        lines: &[S],
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<RemoteOutput> {
        let spec = CommandSpec::new("ssh")
            .args(target.ssh_args(&["bash", "-s"]))
            .stdin(compose_script(lines, cwd))
            .timeout(timeout)
            .streamed();
        self.invoke(target, &format!("ssh script {}", target.address), spec)
            .await
    }

    /// Copy a local file or directory to `remote` on the target
    pub async fn upload(&self, target: &RemoteTarget, local: &Path, remote: &str) -> Result<()> {
        info!(target = %target, local = %local.display(), remote = %remote, "Uploading");
        let spec = CommandSpec::new("scp").args(
            target.scp_args(local.display().to_string(), target.remote_path(remote)),
        );
        self.invoke(target, &format!("scp upload {}", target.address), spec)
            .await
            .map(|_| ())
    }

    /// Copy `remote` from the target to a local path
    pub async fn download(&self, target: &RemoteTarget, remote: &str, local: &Path) -> Result<()> {
        info!(target = %target, remote = %remote, local = %local.display(), "Downloading");
        let spec = CommandSpec::new("scp").args(
            target.scp_args(target.remote_path(remote), local.display().to_string()),
        );
        self.invoke(target, &format!("scp download {}", target.address), spec)
            .await
            .map(|_| ())
    }

    /// Wait until `address:port` accepts TCP connections
    pub async fn wait_for_port(&self, address: &str, port: u16, timeout: Duration) -> Result<()> {
        let endpoint = format!("{}:{}", address, port);
        let spec = PollSpec::new(timeout).fixed_interval(Duration::from_secs(5));
        poll_until_ready(
            &spec,
            &format!("port {} to accept connections", endpoint),
            &self.cancel,
            || async {
                let attempt =
                    tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(&endpoint))
                        .await;
                Ok(match attempt {
                    Ok(Ok(_)) => Readiness::Ready,
                    Ok(Err(e)) => Readiness::not_ready(e.to_string()),
                    Err(_) => Readiness::not_ready("connect timed out"),
                })
            },
        )
        .await
    }

    async fn invoke(
        &self,
        target: &RemoteTarget,
        operation: &str,
        spec: CommandSpec,
    ) -> Result<RemoteOutput> {
        retry(&self.retry, operation, &self.cancel, || async {
            let output = self.runner.run(&spec, &self.cancel).await?;
            classify(target, output)
        })
        .await
    }
}
