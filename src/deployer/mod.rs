//! Cluster deployers
//!
//! Deployers drive one cluster through its [`lifecycle::ClusterState`]s:
//! the bootstrap VM and Cluster API workload cluster for `capz_flannel`
//! ([`bootstrap_vm`], [`capz`]) and the managed cluster for `aks` ([`aks`]).

pub mod aks;
pub mod bootstrap_vm;
pub mod capz;
pub mod lifecycle;
pub mod naming;
pub mod nodes;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cloud::CloudProvisioner;
use crate::cluster::{ClusterApi, ClusterConnector};
use crate::config::RunConfig;
use crate::error::Result;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::poll::{poll_until_ready, PollSpec, Readiness};
use crate::remote::RemoteClient;
use crate::retry::{retry, RetryPolicy};
use crate::scripts::ScriptDir;
use crate::template::TemplateRenderer;

/// Time allowed for every pod of a new cluster to start
pub const PODS_RUNNING_TIMEOUT: Duration = Duration::from_secs(600);

/// Pod phases counted as healthy
const HEALTHY_POD_PHASES: &[&str] = &["Running", "Succeeded"];

/// Collaborators shared by the deployers of one run.
#[derive(Clone)]
pub struct DeployEnv {
    pub config: Arc<RunConfig>,
    pub cloud: Arc<dyn CloudProvisioner>,
    pub runner: Arc<dyn CommandRunner>,
    pub connector: Arc<dyn ClusterConnector>,
    pub renderer: Arc<TemplateRenderer>,
    pub scripts: Arc<ScriptDir>,
    pub cancel: CancellationToken,
}

impl DeployEnv {
    /// ssh client with the default retry policy
    pub fn remote(&self) -> RemoteClient {
        RemoteClient::new(self.runner.clone(), self.cancel.clone())
    }

    /// Run a local command; a non-zero exit is an error
    pub async fn local(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.runner.run(&spec, &self.cancel).await?.check(&spec)
    }

    /// Run a local command under a retry policy
    pub async fn local_retried(
        &self,
        policy: &RetryPolicy,
        operation: &str,
        spec: CommandSpec,
    ) -> Result<CommandOutput> {
        retry(policy, operation, &self.cancel, || self.local(spec.clone())).await
    }

    /// Open a cluster session, retrying while the API server comes up
    pub async fn connect(&self, kubeconfig: &std::path::Path) -> Result<Arc<dyn ClusterApi>> {
        retry(
            &RetryPolicy::with_max_attempts(5),
            "connect to cluster",
            &self.cancel,
            || self.connector.connect(kubeconfig),
        )
        .await
    }
}

/// Wait until every pod in the cluster is running or finished
pub async fn wait_pods_running(
    api: &dyn ClusterApi,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let spec = PollSpec::new(timeout).max_interval(Duration::from_secs(10));
    poll_until_ready(&spec, "all pods to be running", cancel, || async {
        let pods = api.list_pods(None).await?;
        if pods.is_empty() {
            return Ok(Readiness::not_ready("no pods reported yet"));
        }
        let pending: Vec<String> = pods
            .iter()
            .filter(|pod| {
                !pod.phase
                    .as_deref()
                    .is_some_and(|phase| HEALTHY_POD_PHASES.contains(&phase))
            })
            .map(|pod| pod.key())
            .collect();
        Ok(if pending.is_empty() {
            Readiness::Ready
        } else {
            Readiness::not_ready(format!(
                "the following pods are not running yet: {}",
                pending.join(", ")
            ))
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MockClusterApi, PodStatus};
    use crate::error::ErrorKind;

    fn pod(name: &str, phase: &str) -> PodStatus {
        PodStatus {
            name: name.to_string(),
            namespace: "kube-system".to_string(),
            phase: Some(phase.to_string()),
            containers: vec!["main".to_string()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn when_a_pod_stays_pending_the_wait_names_it() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods().returning(|_| {
            Ok(vec![
                pod("coredns-1", "Running"),
                pod("kube-flannel-ds-x", "Pending"),
            ])
        });
        let err = wait_pods_running(&api, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PollTimeout);
        assert!(err.to_string().contains("kube-system/kube-flannel-ds-x"));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_pods_count_as_healthy() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods().times(1).returning(|_| {
            Ok(vec![pod("coredns-1", "Running"), pod("job-1", "Succeeded")])
        });
        wait_pods_running(&api, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();
    }
}
