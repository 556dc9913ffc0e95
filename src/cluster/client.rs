//! [`ClusterApi`] on top of kube-rs
//!
//! Reads, applies and deletes go through the Kubernetes API directly. Pod
//! exec, copy and log following are delegated to `kubectl`, which already
//! handles the streaming protocols and tar framing those need.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Secret, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::kubeconfig::Endpoint;
use super::{ClusterApi, ClusterConnector, MachineStatus, NodeStatus, PodStatus};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::retry::{retry, RetryPolicy};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "e2e-runner";
/// Default connect timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

const CAPI_GROUP: &str = "cluster.x-k8s.io";
const CAPI_VERSION: &str = "v1beta1";

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from a kubeconfig file with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::control_plane("create_client", format!("failed to read kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::control_plane("create_client", format!("failed to load kubeconfig: {}", e))
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::control_plane("create_client", format!("failed to create client: {}", e))
    })
}

/// Split a multi-document YAML manifest, dropping empty documents
pub fn split_documents(manifest: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Get priority for a Kubernetes resource kind (lower = apply first)
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 8,
    }
}

fn kind_of(document: &Value) -> &str {
    document.get("kind").and_then(Value::as_str).unwrap_or_default()
}

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn capi_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(CAPI_GROUP, CAPI_VERSION, kind), plural)
}

fn machine_status(machine: &DynamicObject) -> MachineStatus {
    MachineStatus {
        name: machine.metadata.name.clone().unwrap_or_default(),
        phase: machine
            .data
            .pointer("/status/phase")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

fn control_plane_endpoint(cluster: &DynamicObject) -> Option<Endpoint> {
    let host = cluster
        .data
        .pointer("/spec/controlPlaneEndpoint/host")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())?;
    let port = cluster
        .data
        .pointer("/spec/controlPlaneEndpoint/port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)?;
    Some(Endpoint::new(host, port))
}

fn node_status(node: &Node) -> NodeStatus {
    let status = node.status.as_ref();
    let info = status.and_then(|s| s.node_info.as_ref());
    NodeStatus {
        name: node.metadata.name.clone().unwrap_or_default(),
        os: info.map(|i| i.operating_system.clone()).unwrap_or_default(),
        internal_ip: status
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addresses| addresses.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.clone()),
        kubelet_version: info.map(|i| i.kubelet_version.clone()).unwrap_or_default(),
        kube_proxy_version: info.map(|i| i.kube_proxy_version.clone()).unwrap_or_default(),
        images: status
            .and_then(|s| s.images.as_ref())
            .map(|images| {
                images
                    .iter()
                    .flat_map(|image| image.names.iter().flatten().cloned())
                    .collect()
            })
            .unwrap_or_default(),
        ready: status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false),
    }
}

fn pod_status(pod: &Pod) -> PodStatus {
    PodStatus {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
        containers: pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default(),
    }
}

fn has_taint(node: &Node, taint: &Taint) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .is_some_and(|taints| {
            taints
                .iter()
                .any(|t| t.key == taint.key && t.effect == taint.effect)
        })
}

/// Timestamp prefix of the last line written by `kubectl logs --timestamps`
fn last_log_timestamp(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_once(' '))
        .map(|(timestamp, _)| timestamp.to_string())
}

/// `kubectl` bound to one kubeconfig.
#[derive(Clone)]
pub struct Kubectl {
    binary: String,
    kubeconfig: PathBuf,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
    retry: RetryPolicy,
}

impl Kubectl {
    /// Create a kubectl wrapper
    pub fn new(
        binary: impl Into<String>,
        kubeconfig: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: kubeconfig.into(),
            runner,
            cancel,
            retry: RetryPolicy::with_max_attempts(5).max_delay(Duration::from_secs(30)),
        }
    }

    /// Use `policy` for every retried call
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.binary)
            .arg("--kubeconfig")
            .arg(self.kubeconfig.display().to_string())
            .args(args)
    }

    /// Run kubectl with `args` under the retry policy and return stdout
    pub async fn run<I, S>(&self, operation: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.command(args);
        retry(&self.retry, operation, &self.cancel, || async {
            let output = self.runner.run(&spec, &self.cancel).await?;
            Ok(output.check(&spec)?.stdout)
        })
        .await
    }

    /// `kubectl exec`
    pub async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>) -> Result<String> {
        let mut args = vec![
            "exec".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            pod.to_string(),
            "--".to_string(),
        ];
        args.extend(command);
        self.run("kubectl exec", args).await
    }

    /// `kubectl cp` from a pod to a local path
    pub async fn copy_from_pod(
        &self,
        namespace: &str,
        pod: &str,
        remote: &str,
        local: &Path,
    ) -> Result<()> {
        self.run(
            "kubectl cp",
            [
                "cp".to_string(),
                format!("{}/{}:{}", namespace, pod, remote),
                local.display().to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    /// One `kubectl logs --follow` session, resuming after `since`
    ///
    /// Returns the timestamp of the last line read, if any.
    pub async fn follow_once(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        since: Option<&str>,
    ) -> Result<Option<String>> {
        let mut spec = self
            .command([
                "logs", "--namespace", namespace, pod, "--container", container, "--follow",
                "--timestamps",
            ])
            .streamed();
        if let Some(since) = since {
            spec = spec.args(["--since-time", since]);
        }
        let output = self.runner.run(&spec, &self.cancel).await?;
        if !output.success() {
            warn!(pod = %pod, container = %container, stderr = %output.stderr.trim(), "Log stream ended with an error");
        }
        Ok(last_log_timestamp(&output.stdout))
    }
}

/// [`ClusterConnector`] producing [`KubeClient`]s.
#[derive(Clone)]
pub struct KubeConnector {
    kubectl_binary: String,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl KubeConnector {
    /// Create a connector whose clients shell out to `kubectl_binary`
    pub fn new(
        kubectl_binary: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kubectl_binary: kubectl_binary.into(),
            runner,
            cancel,
        }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, kubeconfig: &Path) -> Result<Arc<dyn ClusterApi>> {
        let client = KubeClient::connect(
            kubeconfig,
            &self.kubectl_binary,
            self.runner.clone(),
            self.cancel.clone(),
        )
        .await?;
        Ok(Arc::new(client))
    }
}

/// Kubernetes API client for one cluster.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    kubectl: Kubectl,
    cancel: CancellationToken,
}

impl KubeClient {
    /// Connect to the cluster described by `kubeconfig`
    pub async fn connect(
        kubeconfig: &Path,
        kubectl_binary: &str,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = create_client(kubeconfig).await?;
        debug!(kubeconfig = %kubeconfig.display(), "Connected to cluster");
        Ok(Self {
            client,
            kubectl: Kubectl::new(kubectl_binary, kubeconfig, runner, cancel.clone()),
            cancel,
        })
    }

    /// The kubectl wrapper bound to this cluster
    pub fn kubectl(&self) -> &Kubectl {
        &self.kubectl
    }

    async fn run_discovery(&self) -> Result<Discovery> {
        let policy = RetryPolicy::with_max_attempts(5).initial_delay(Duration::from_secs(1));
        retry(&policy, "api-discovery", &self.cancel, || async {
            Ok(Discovery::new(self.client.clone()).run().await?)
        })
        .await
    }

    async fn apply_document(&self, discovery: &Discovery, document: &Value) -> Result<()> {
        let kind = kind_of(document);
        let api_version = document
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::control_plane("apply", "manifest missing apiVersion"))?;
        let name = document
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::control_plane("apply", "manifest missing metadata.name"))?;

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        };
        let (resource, capabilities) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
            Error::control_plane(
                "apply",
                format!("unknown resource type: {}/{}", api_version, kind),
            )
        })?;

        let api: Api<DynamicObject> = match capabilities.scope {
            Scope::Namespaced => {
                let namespace = document
                    .pointer("/metadata/namespace")
                    .and_then(Value::as_str)
                    .unwrap_or("default");
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };

        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(document),
        )
        .await
        .map_err(|e| Error::control_plane("apply", format!("failed to apply {}/{}: {}", kind, name, e)))?;
        trace!(kind = %kind, name = %name, "applied manifest");
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn apply(&self, manifest: &str) -> Result<()> {
        let (mut foundational, mut rest): (Vec<Value>, Vec<Value>) = split_documents(manifest)?
            .into_iter()
            .partition(|d| matches!(kind_of(d), "Namespace" | "CustomResourceDefinition"));
        foundational.sort_by_key(|d| kind_priority(kind_of(d)));
        rest.sort_by_key(|d| kind_priority(kind_of(d)));

        let mut discovery = self.run_discovery().await?;
        for document in &foundational {
            self.apply_document(&discovery, document).await?;
        }
        if foundational
            .iter()
            .any(|d| kind_of(d) == "CustomResourceDefinition")
        {
            discovery = self.run_discovery().await?;
        }
        for document in &rest {
            self.apply_document(&discovery, document).await?;
        }
        info!(documents = foundational.len() + rest.len(), "Applied manifest");
        Ok(())
    }

    async fn list_machines(&self, namespace: &str, selector: &str) -> Result<Vec<MachineStatus>> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            namespace,
            &capi_resource("Machine", "machines"),
        );
        let machines = api.list(&ListParams::default().labels(selector)).await?;
        Ok(machines.items.iter().map(machine_status).collect())
    }

    async fn cluster_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Endpoint>> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            namespace,
            &capi_resource("Cluster", "clusters"),
        );
        Ok(api.get_opt(name).await?.as_ref().and_then(control_plane_endpoint))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeStatus>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(node_status).collect())
    }

    async fn list_pods(&self, namespace: Option<String>) -> Result<Vec<PodStatus>> {
        let api: Api<Pod> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods.items.iter().map(pod_status).collect())
    }

    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .and_then(|pod| pod.status)
            .and_then(|status| status.phase))
    }

    async fn container_terminated(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let Some(pod) = api.get_opt(pod).await? else {
            return Ok(true);
        };
        Ok(pod
            .status
            .and_then(|s| s.container_statuses)
            .unwrap_or_default()
            .iter()
            .filter(|s| s.name == container)
            .any(|s| s.state.as_ref().is_some_and(|state| state.terminated.is_some())))
    }

    async fn config_map_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(key)))
    }

    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name,
                "labels": labels
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
            .await?;
        Ok(())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v.into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        };
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await?;
        Ok(())
    }

    async fn taint_nodes(&self, selector: &str, taint: &Taint) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default().labels(selector)).await?;

        for node in &nodes.items {
            let node_name = node
                .metadata
                .name
                .as_deref()
                .ok_or_else(|| Error::control_plane("taint_nodes", "node has no name"))?;
            if has_taint(node, taint) {
                debug!(node = %node_name, "node already has the taint");
                continue;
            }
            let mut taints = node
                .spec
                .as_ref()
                .and_then(|spec| spec.taints.clone())
                .unwrap_or_default();
            taints.push(taint.clone());
            let patch = serde_json::json!({ "spec": { "taints": taints } });
            api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            info!(node = %node_name, key = %taint.key, effect = %taint.effect, "Tainted node");
        }
        Ok(())
    }

    async fn delete(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let discovery = self.run_discovery().await?;
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        };
        let Some((resource, _)) = discovery.resolve_gvk(&gvk) else {
            debug!(kind = %kind, name = %name, "resource type not served, nothing to delete");
            return Ok(());
        };
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &resource);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(kind = %kind, name = %name, namespace = %namespace, "Deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        Ok(api.logs(pod, &params).await?)
    }

    async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>) -> Result<String> {
        self.kubectl.exec(namespace, pod, command).await
    }

    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod: &str,
        remote: &str,
        local: &Path,
    ) -> Result<()> {
        self.kubectl.copy_from_pod(namespace, pod, remote, local).await
    }

    async fn follow_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<()> {
        let mut since: Option<String> = None;
        loop {
            match self
                .kubectl
                .follow_once(namespace, pod, container, since.as_deref())
                .await
            {
                Ok(Some(last)) => since = Some(last),
                Ok(None) => {}
                Err(e) if e.kind() == crate::error::ErrorKind::Cancelled => return Err(e),
                Err(e) => warn!(pod = %pod, error = %e, "Log read interrupted"),
            }

            if self.container_terminated(namespace, pod, container).await? {
                info!(pod = %pod, container = %container, "Log read finished");
                return Ok(());
            }
            warn!(pod = %pod, container = %container, "Log stream closed early, resuming");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::cancelled("follow_logs")),
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        }
    }
}
