//! Operations on the workload cluster's nodes over ssh
//!
//! Nodes only have private addresses; every connection hops through the
//! control plane (see [`NodeAccess`]). Fan-out goes through a
//! [`WorkerPool`], so every node has finished before a call returns.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::poll::{poll_until_ready, PollSpec, Readiness};
use crate::pool::WorkerPool;
use crate::remote::{RemoteClient, RemoteTarget};
use crate::scripts::{
    Script, ScriptDir, COLLECT_LOGS_LINUX, COLLECT_LOGS_WINDOWS, CONFIRM_READY_CNI,
    INSTALL_PATCHES,
};
use crate::topology::{ClusterTopology, NodeAccess};

const NODE_COMMAND_TIMEOUT: Duration = Duration::from_secs(1200);
const CHECK_TIMEOUT: Duration = Duration::from_secs(60);
const CNI_READY_TIMEOUT: Duration = Duration::from_secs(900);
const PATCH_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(600);
const LOGS_ARCHIVE: &str = "/tmp/logs.tgz";

fn powershell_file(remote: &str, args: &[String]) -> String {
    let mut command = format!(
        "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass -File {}",
        remote
    );
    for arg in args {
        command.push(' ');
        command.push_str(&quote_windows_arg(arg));
    }
    command
}

/// Double-quote `arg` for the Windows command line so `&`, spaces and
/// quotes reach the script as one argument
fn quote_windows_arg(arg: &str) -> String {
    let mut quoted = String::from("\"");
    let mut backslashes = 0;
    for c in arg.chars() {
        if c == '\\' {
            backslashes += 1;
            continue;
        }
        let escapes = if c == '"' { backslashes * 2 + 1 } else { backslashes };
        quoted.extend(std::iter::repeat('\\').take(escapes));
        quoted.push(c);
        backslashes = 0;
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

fn remote_script_path(script: &Script) -> String {
    format!("/tmp/{}", script.name)
}

/// Runs commands on cluster nodes.
pub struct NodeOps {
    remote: RemoteClient,
    access: NodeAccess,
    topology: ClusterTopology,
    scripts: Arc<ScriptDir>,
    pool: WorkerPool,
    cancel: CancellationToken,
}

impl NodeOps {
    pub fn new(
        remote: RemoteClient,
        access: NodeAccess,
        topology: ClusterTopology,
        scripts: Arc<ScriptDir>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            access,
            topology,
            scripts,
            pool: WorkerPool::default(),
            cancel,
        }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    fn is_windows(&self, address: &str) -> bool {
        self.topology.windows_nodes.iter().any(|n| n == address)
    }

    async fn upload_script(&self, target: &RemoteTarget, script: &Script) -> Result<String> {
        let remote = remote_script_path(script);
        self.remote
            .upload(target, &self.scripts.path(script), &remote)
            .await?;
        Ok(remote)
    }

    /// Whether the control plane can open port 22 on `address`
    async fn reachable(&self, address: &str) -> bool {
        self.remote
            .single_attempt()
            .run(
                &self.access.bastion(),
                &format!("nc -w 5 -z {} 22", address),
                CHECK_TIMEOUT,
                None,
            )
            .await
            .is_ok()
    }

    /// Collect an archive of node logs from every node into `artifacts_dir`.
    ///
    /// Unreachable nodes and per-node failures are logged and skipped.
    pub async fn collect_logs(&self, artifacts_dir: &Path) -> Vec<PathBuf> {
        let nodes = self.topology.all_nodes();
        let this = self;
        let outcomes = self
            .pool
            .run_settled(&nodes, move |address| async move {
                this.collect_node_logs(&address, artifacts_dir).await
            })
            .await;

        let mut archives = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(Some(archive)) => archives.push(archive),
                Ok(None) => {}
                Err(e) => {
                    warn!(node = %outcome.node, error = %e, "Failed to collect node logs");
                }
            }
        }
        info!(archives = archives.len(), "Collected node logs");
        archives
    }

    async fn collect_node_logs(&self, address: &str, artifacts_dir: &Path) -> Result<Option<PathBuf>> {
        if !self.reachable(address).await {
            warn!(node = %address, "Node is not reachable over ssh, skipping log collection");
            return Ok(None);
        }
        let target = self.access.node(address);
        let command = if self.is_windows(address) {
            let remote = self.upload_script(&target, &COLLECT_LOGS_WINDOWS).await?;
            powershell_file(&remote, &[])
        } else {
            let remote = self.upload_script(&target, &COLLECT_LOGS_LINUX).await?;
            format!("sudo bash {}", remote)
        };
        self.remote
            .run(&target, &command, NODE_COMMAND_TIMEOUT, None)
            .await?;
        let hostname = self
            .remote
            .run(&target, "hostname", CHECK_TIMEOUT, None)
            .await?
            .stdout
            .trim()
            .to_string();
        let hostname = if hostname.is_empty() {
            address.to_string()
        } else {
            hostname
        };
        let archive = artifacts_dir.join(format!("{}-logs.tgz", hostname));
        self.remote.download(&target, LOGS_ARCHIVE, &archive).await?;
        Ok(Some(archive))
    }

    /// Install Windows update packages on every Windows node, then wait for
    /// the nodes to come back after their reboot.
    pub async fn install_patches(&self, urls: &[String]) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }
        let this = self;
        self.pool
            .run_all(
                "install Windows patches",
                &self.topology.windows_nodes,
                move |address| async move {
                    let target = this.access.node(&address);
                    let remote = this.upload_script(&target, &INSTALL_PATCHES).await?;
                    this.remote
                        .run(&target, &powershell_file(&remote, urls), NODE_COMMAND_TIMEOUT, None)
                        .await
                        .map(|_| ())
                },
            )
            .await?;

        self.wait_windows_reachable(PATCH_CONNECTIVITY_TIMEOUT).await
    }

    async fn wait_windows_reachable(&self, timeout: Duration) -> Result<()> {
        let check = self.remote.single_attempt();
        let spec = PollSpec::new(timeout).max_interval(Duration::from_secs(30));
        poll_until_ready(&spec, "Windows nodes to accept ssh", &self.cancel, || async {
            let mut observations = Vec::new();
            for address in &self.topology.windows_nodes {
                let observed = match check
                    .run(&self.access.node(address), "hostname", CHECK_TIMEOUT, None)
                    .await
                {
                    Ok(_) => Readiness::Ready,
                    Err(Error::Cancelled { operation }) => {
                        return Err(Error::Cancelled { operation })
                    }
                    Err(e) => Readiness::not_ready(format!("{}: {}", address, e)),
                };
                observations.push(observed);
            }
            Ok(Readiness::all(observations))
        })
        .await
    }

    /// Replace kube-proxy on every Windows node with the upstream release
    /// binary of `version`, placed where the kube-proxy DaemonSet looks.
    pub async fn update_kube_proxy(&self, version: &str) -> Result<()> {
        let command = format!(
            "powershell.exe -NoProfile -Command \"mkdir -force /build; curl.exe --fail -L -o /build/kube-proxy.exe https://dl.k8s.io/{}/bin/windows/amd64/kube-proxy.exe\"",
            version
        );
        let this = self;
        let command = &command;
        self.pool
            .run_all(
                "update kube-proxy",
                &self.topology.windows_nodes,
                move |address| async move {
                    this.remote
                        .run(&this.access.node(&address), command, NODE_COMMAND_TIMEOUT, None)
                        .await
                        .map(|_| ())
                },
            )
            .await
            .map(|_| ())
    }

    /// Wait until every Windows node reports a configured CNI.
    ///
    /// A node that cannot be reached yet counts as not ready. A topology
    /// without Windows nodes is an error, never vacuously ready.
    pub async fn wait_cni_ready(&self) -> Result<()> {
        if self.topology.windows_nodes.is_empty() {
            return Err(Error::not_found("Windows nodes", "cluster topology"));
        }
        let this = self;
        self.pool
            .run_all(
                "upload CNI readiness script",
                &self.topology.windows_nodes,
                move |address| async move {
                    this.upload_script(&this.access.node(&address), &CONFIRM_READY_CNI)
                        .await
                        .map(|_| ())
                },
            )
            .await?;

        let check = self.remote.single_attempt();
        let command = powershell_file(&remote_script_path(&CONFIRM_READY_CNI), &[]);
        let spec = PollSpec::new(CNI_READY_TIMEOUT).fixed_interval(Duration::from_secs(10));
        poll_until_ready(&spec, "Windows CNI to be ready", &self.cancel, || async {
            let mut observations = Vec::new();
            for address in &self.topology.windows_nodes {
                let observed = match check
                    .run(&self.access.node(address), &command, CHECK_TIMEOUT, None)
                    .await
                {
                    Ok(output) if output.stdout.trim().eq_ignore_ascii_case("true") => {
                        Readiness::Ready
                    }
                    Ok(output) => Readiness::not_ready(format!(
                        "{} reports {}",
                        address,
                        output.stdout.trim()
                    )),
                    Err(Error::Cancelled { operation }) => {
                        return Err(Error::Cancelled { operation })
                    }
                    Err(e) => Readiness::not_ready(format!("{}: {}", address, e)),
                };
                observations.push(observed);
            }
            Ok(Readiness::all(observations))
        })
        .await?;
        info!("Windows CNI is ready on every node");
        Ok(())
    }
}
