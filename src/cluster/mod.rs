//! Cluster control-plane access
//!
//! [`ClusterApi`] is everything the runner asks of a Kubernetes cluster,
//! management or workload. Observations come back as small typed snapshots
//! ([`MachineStatus`], [`NodeStatus`], [`PodStatus`]) so readiness predicates
//! can be written and tested without a cluster.

pub mod client;
pub mod kubeconfig;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Taint;
#[cfg(test)]
use mockall::automock;

use crate::error::Result;
pub use kubeconfig::Endpoint;

/// Label selecting control-plane machines
pub const CONTROL_PLANE_SELECTOR: &str = "cluster.x-k8s.io/control-plane";
/// Machine phase counted as ready
pub const MACHINE_RUNNING: &str = "Running";
/// Pod phases a finished pod ends in
pub const POD_TERMINAL_PHASES: &[&str] = &["Succeeded", "Failed"];

/// Selector for the machines of one machine deployment
pub fn deployment_selector(deployment: &str) -> String {
    format!("cluster.x-k8s.io/deployment-name={}", deployment)
}

/// Cluster API machine snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineStatus {
    /// Machine name
    pub name: String,
    /// `status.phase`
    pub phase: Option<String>,
}

impl MachineStatus {
    /// Whether the machine reached the running phase
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some(MACHINE_RUNNING)
    }
}

/// Node snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node name
    pub name: String,
    /// `status.nodeInfo.operatingSystem`
    pub os: String,
    /// First `InternalIP` address
    pub internal_ip: Option<String>,
    /// `status.nodeInfo.kubeletVersion`
    pub kubelet_version: String,
    /// `status.nodeInfo.kubeProxyVersion`; empty on clusters that stopped reporting it
    pub kube_proxy_version: String,
    /// Every name of every image cached on the node
    pub images: Vec<String>,
    /// `Ready` condition is `True`
    pub ready: bool,
}

/// Pod snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodStatus {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// `status.phase`
    pub phase: Option<String>,
    /// Names of the pod's containers
    pub containers: Vec<String>,
}

impl PodStatus {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Kubernetes API operations used by the runner.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply every document of a (multi-document) manifest
    async fn apply(&self, manifest: &str) -> Result<()>;

    /// Cluster API machines in `namespace` matching a label selector
    async fn list_machines(&self, namespace: &str, selector: &str) -> Result<Vec<MachineStatus>>;

    /// `spec.controlPlaneEndpoint` of a Cluster API cluster, once assigned
    async fn cluster_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Endpoint>>;

    /// All nodes
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>>;

    /// Pods in `namespace`, or in every namespace
    async fn list_pods(&self, namespace: Option<String>) -> Result<Vec<PodStatus>>;

    /// Phase of a pod, `None` when the pod does not exist
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>>;

    /// Whether a container of a pod has terminated
    async fn container_terminated(&self, namespace: &str, pod: &str, container: &str)
        -> Result<bool>;

    /// One key of a ConfigMap, `None` when the ConfigMap or key is missing
    async fn config_map_value(&self, namespace: &str, name: &str, key: &str)
        -> Result<Option<String>>;

    /// Create or update a namespace with labels
    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    /// Create or update an Opaque secret
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Create or update a ConfigMap
    async fn create_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Add `taint` to every node matching a label selector, skipping nodes that have it
    async fn taint_nodes(&self, selector: &str, taint: &Taint) -> Result<()>;

    /// Delete a namespaced object; a missing object is already deleted
    async fn delete(&self, api_version: &str, kind: &str, namespace: &str, name: &str)
        -> Result<()>;

    /// Full log of one container
    async fn logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String>;

    /// Run a command in a pod and return its stdout
    async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>) -> Result<String>;

    /// Copy a path out of a pod
    async fn copy_from_pod(&self, namespace: &str, pod: &str, remote: &str, local: &Path)
        -> Result<()>;

    /// Stream a container's log to the runner log until the container terminates
    async fn follow_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<()>;
}

/// Opens [`ClusterApi`] sessions from kubeconfig files.
///
/// Kubeconfigs only exist once a cluster is up, so deployers receive a
/// connector and connect when the file has been written.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the cluster described by `kubeconfig`
    async fn connect(&self, kubeconfig: &Path) -> Result<Arc<dyn ClusterApi>>;
}
