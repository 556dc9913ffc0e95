//! Cluster API on Azure workload cluster
//!
//! The management cluster is a kind cluster on the bootstrap VM. It runs the
//! CAPZ providers, which create the workload cluster described by
//! `cluster.yaml.j2`. Once its control plane answers, the runner installs the
//! Azure cloud provider, Flannel and the Windows kube-proxy, waits for the
//! Windows agents and the CNI, and validates node versions.
//!
//! A failed bring-up attempt is cleaned up (management cluster deleted,
//! workload resource group deleted, vnet peerings removed) and retried on the
//! same bootstrap VM.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::bootstrap_vm::{BootstrapVm, MGMT_KUBECONFIG};
use super::lifecycle::{ClusterState, Lifecycle, Phase};
use super::naming::{ResourceNames, CAPI_NAMESPACE};
use super::nodes::NodeOps;
use super::validate::validate_cluster;
use super::{wait_pods_running, DeployEnv, PODS_RUNNING_TIMEOUT};
use crate::builder::{BuildManifest, BuildTarget};
use crate::cloud::resource_group::delete_resource_group;
use crate::cloud::GalleryImage;
use crate::cluster::kubeconfig::{read_endpoint, rewrite_server, write_private};
use crate::cluster::{
    deployment_selector, ClusterApi, Endpoint, MachineStatus, CONTROL_PLANE_SELECTOR,
};
use crate::config::{
    validate_gallery_name, CapzFlannelArgs, FlannelMode, RunConfig, WinOs,
    DEFAULT_KUBERNETES_VERSION,
};
use crate::error::{Error, ErrorKind, Result};
use crate::exec::CommandSpec;
use crate::poll::{count_readiness, poll_until_ready, PollSpec};
use crate::retry::{retry, RetryPolicy};
use crate::template::{
    context, flag, TemplateContext, CLUSTER_TEMPLATE, FLANNEL_WINDOWS_TEMPLATE,
    KUBE_PROXY_WINDOWS_TEMPLATE,
};
use crate::topology::{ClusterTopology, NodeAccess};

/// Login user on every workload node
pub const NODE_USER: &str = "capi";
/// Workload kubeconfig file name under `~/.kube`
pub const WORKLOAD_KUBECONFIG: &str = "config";

const BRING_UP_ATTEMPTS: u32 = 6;
const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(1800);
const WINDOWS_AGENTS_TIMEOUT: Duration = Duration::from_secs(5400);
const CLUSTERCTL_TIMEOUT: Duration = Duration::from_secs(1800);
const HELM_TIMEOUT: Duration = Duration::from_secs(900);

const CLUSTER_IDENTITY_SECRET: &str = "cluster-identity-secret";
const UBUNTU_IMAGE: &str = "capi-ubun2-2404";
const BOOTSTRAP_LOGS_DIR: &str = "bootstrap_vm_logs";

const FLANNEL_NAMESPACE: &str = "kube-flannel";
const FLANNEL_HELM_REPO: &str = "https://flannel-io.github.io/flannel";
const FLANNEL_HELM_VERSION: &str = "v0.23.0";
const FLANNEL_VXLAN_VNI: u32 = 4096;
const FLANNEL_VXLAN_PORT: u16 = 4789;

const CLOUD_PROVIDER_AZURE_TAGS: &str =
    "https://api.github.com/repos/kubernetes-sigs/cloud-provider-azure/tags";

fn cloud_provider_azure_repo(tag: &str) -> String {
    format!(
        "https://raw.githubusercontent.com/kubernetes-sigs/cloud-provider-azure/{}/helm/repo",
        tag
    )
}

/// Gallery image definition of the Windows agents
pub fn windows_image_name(os: WinOs) -> String {
    format!("capi-win-{}-containerd", os.version())
}

/// `major.minor` gallery version prefix matching a Kubernetes version
pub fn gallery_version_prefix(version: &str) -> Result<String> {
    let mut parts = version.trim_start_matches('v').split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() && !minor.is_empty() => {
            Ok(format!("{}.{}", major, minor))
        }
        _ => Err(Error::configuration(format!(
            "cannot derive an image version from kubernetes version {:?}",
            version
        ))),
    }
}

/// Node images resolved from the compute gallery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeImages {
    pub ubuntu_version: String,
    pub windows_name: String,
    pub windows_version: String,
}

/// Service and pod subnets of a kubeadm `ClusterConfiguration`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmNetworking {
    pub service_subnet: String,
    pub pod_subnet: String,
}

#[derive(Deserialize)]
struct KubeadmClusterConfiguration {
    networking: KubeadmNetworking,
}

/// Parse the networking section of the `kubeadm-config` ConfigMap
pub fn kubeadm_networking(cluster_configuration: &str) -> Result<KubeadmNetworking> {
    let config: KubeadmClusterConfiguration = serde_yaml::from_str(cluster_configuration)?;
    Ok(config.networking)
}

#[derive(Deserialize)]
struct GitTag {
    name: String,
}

/// Highest tag name of a GitHub tags listing
pub fn latest_tag(listing: &str) -> Result<String> {
    let tags: Vec<GitTag> = serde_json::from_str(listing)?;
    tags.into_iter()
        .map(|t| t.name)
        .max()
        .ok_or_else(|| Error::not_found("tag", "cloud-provider-azure"))
}

/// Helm values of the flannel chart
pub fn flannel_values(args: &CapzFlannelArgs) -> Value {
    let mut flannel = json!({ "backend": args.flannel_mode.backend() });
    if args.flannel_mode == FlannelMode::Overlay {
        flannel["vni"] = json!(FLANNEL_VXLAN_VNI);
        flannel["backendPort"] = json!(FLANNEL_VXLAN_PORT);
    }
    json!({
        "podCidr": args.cluster_network_subnet,
        "flannel": flannel,
    })
}

/// Helm values of the cloud-provider-azure chart
pub fn cloud_provider_values(args: &CapzFlannelArgs, image_tag: &str) -> Value {
    json!({
        "infra": { "clusterName": args.cluster_name },
        "cloudControllerManager": {
            "imageTag": image_tag,
            "clusterCIDR": args.cluster_network_subnet,
            "configureCloudRoutes": args.flannel_mode.needs_cloud_routes(),
        },
        "cloudNodeManager": { "imageTag": image_tag },
    })
}

/// Rendering context of `cluster.yaml.j2`
pub fn cluster_context(
    args: &CapzFlannelArgs,
    config: &RunConfig,
    names: &ResourceNames,
    location: &str,
    artifacts_endpoint: &str,
    images: &NodeImages,
    manifest: &BuildManifest,
) -> Result<TemplateContext> {
    let tags = serde_json::to_string(&config.tags.to_map())?;
    let mut ctx = context([
        ("cluster_name", names.cluster().to_string()),
        ("resource_group_tags", tags),
        ("bootstrap_resource_group", names.bootstrap_resource_group()),
        ("bootstrap_vm_vnet_name", names.bootstrap_vnet().name),
        ("bootstrap_vm_endpoint", artifacts_endpoint.to_string()),
        ("vnet_cidr", args.vnet_cidr_block.clone()),
        ("control_plane_subnet_cidr", args.control_plane_subnet_cidr_block.clone()),
        ("node_subnet_cidr", args.node_subnet_cidr_block.clone()),
        ("cluster_network_subnet", args.cluster_network_subnet.clone()),
        ("azure_location", location.to_string()),
        ("azure_tenant_id", config.azure.tenant_id.clone()),
        ("azure_client_id", config.azure.client_id.clone()),
        ("azure_ssh_public_key", config.ssh_public_key.clone()),
        ("master_vm_size", args.master_vm_size.clone()),
        ("win_agents_count", args.win_agents_count.to_string()),
        ("win_agent_size", args.win_agent_size.clone()),
        (
            "kubernetes_version",
            manifest.effective_version(&args.kubernetes_version).to_string(),
        ),
        ("capz_sig_image_gallery", args.image_gallery.clone()),
        ("capz_sig_ubuntu_image_name", UBUNTU_IMAGE.to_string()),
        ("capz_sig_ubuntu_image_version", images.ubuntu_version.clone()),
        ("capz_sig_windows_image_name", images.windows_name.clone()),
        ("capz_sig_windows_image_version", images.windows_version.clone()),
    ]);
    ctx.extend(
        manifest
            .template_flags()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v)),
    );
    Ok(ctx)
}

/// Wait until at least `wanted` machines matching `selector` are running
pub async fn wait_machines(
    api: &dyn ClusterApi,
    selector: &str,
    wanted: usize,
    timeout: Duration,
    noun: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(
        selector = %selector,
        wanted,
        minutes = timeout.as_secs() / 60,
        "Waiting for {}",
        noun
    );
    let spec = PollSpec::new(timeout).max_interval(Duration::from_secs(30));
    poll_until_ready(&spec, &format!("{} {}", wanted, noun), cancel, || async {
        let machines = api.list_machines(CAPI_NAMESPACE, selector).await?;
        Ok(count_readiness(
            &machines,
            wanted,
            MachineStatus::is_running,
            noun,
        ))
    })
    .await?;
    info!("{} are ready", noun);
    Ok(())
}

/// A running workload cluster.
pub struct CapzCluster {
    pub api: Arc<dyn ClusterApi>,
    pub nodes: NodeOps,
}

/// Deploys the CAPZ workload cluster of one run.
pub struct CapzDeployer {
    args: CapzFlannelArgs,
    names: ResourceNames,
    location: String,
    env: DeployEnv,
    http: reqwest::Client,
    mgmt_kubeconfig: PathBuf,
    kubeconfig: PathBuf,
}

impl CapzDeployer {
    pub fn new(args: CapzFlannelArgs, location: impl Into<String>, env: DeployEnv) -> Self {
        let names = ResourceNames::new(&args.cluster_name);
        let mgmt_kubeconfig = env.config.kube_dir.join(MGMT_KUBECONFIG);
        let kubeconfig = env.config.kube_dir.join(WORKLOAD_KUBECONFIG);
        Self {
            args,
            names,
            location: location.into(),
            env,
            http: reqwest::Client::new(),
            mgmt_kubeconfig,
            kubeconfig,
        }
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    /// Workload cluster kubeconfig
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    fn cancel(&self) -> &CancellationToken {
        &self.env.cancel
    }

    /// Bring the workload cluster up and validate it.
    ///
    /// Each failed attempt is cleaned up before the next one. Validation
    /// failures and cancellation end the loop at once.
    pub async fn bring_up(
        &self,
        vm: &BootstrapVm,
        manifest: &BuildManifest,
        lifecycle: &Lifecycle,
    ) -> Result<CapzCluster> {
        let start = Instant::now();
        let policy = RetryPolicy::with_max_attempts(BRING_UP_ATTEMPTS)
            .constant(Duration::ZERO)
            .retry_on([
                ErrorKind::PollTimeout,
                ErrorKind::CommandTimeout,
                ErrorKind::InvalidState,
            ]);
        let outcome = retry(&policy, "create CAPZ cluster", self.cancel(), || async {
            match self.bring_up_once(vm, manifest, lifecycle).await {
                Ok(cluster) => Ok(cluster),
                Err(e) => {
                    error!(error = %e, "Failed to create the CAPZ cluster");
                    self.cleanup(vm).await;
                    Err(e)
                }
            }
        })
        .await;

        match outcome {
            Ok(cluster) => {
                info!(
                    minutes = %format!("{:.2}", start.elapsed().as_secs_f64() / 60.0),
                    "The cluster is provisioned"
                );
                Ok(cluster)
            }
            Err(e) => {
                if let Err(state) = lifecycle.advance(ClusterState::Absent) {
                    warn!(error = %state, "Unexpected cluster state after cleanup");
                }
                Err(e)
            }
        }
    }

    async fn bring_up_once(
        &self,
        vm: &BootstrapVm,
        manifest: &BuildManifest,
        lifecycle: &Lifecycle,
    ) -> Result<CapzCluster> {
        lifecycle.advance(ClusterState::Provisioning(Phase::ControlPlane))?;
        let mgmt = self.setup_management_cluster(vm).await?;
        self.create_workload_cluster(mgmt.as_ref(), vm, manifest)
            .await?;
        wait_machines(
            mgmt.as_ref(),
            CONTROL_PLANE_SELECTOR,
            1,
            CONTROL_PLANE_TIMEOUT,
            "control-plane machines",
            self.cancel(),
        )
        .await?;
        lifecycle.advance(ClusterState::ControlPlaneReady)?;

        self.write_workload_kubeconfig().await?;
        let workload = self.env.connect(&self.kubeconfig).await?;
        let endpoint = read_endpoint(&self.kubeconfig)?;
        self.install_cloud_provider(manifest).await?;
        self.install_flannel(workload.as_ref(), &endpoint).await?;

        lifecycle.advance(ClusterState::Provisioning(Phase::Agents))?;
        wait_machines(
            mgmt.as_ref(),
            &deployment_selector(&self.names.windows_deployment()),
            self.args.win_agents_count as usize,
            WINDOWS_AGENTS_TIMEOUT,
            "Windows agents",
            self.cancel(),
        )
        .await?;
        lifecycle.advance(ClusterState::AgentsReady)?;

        let topology = ClusterTopology::discover_windows(
            workload.as_ref(),
            endpoint,
            self.args.win_agents_count as usize,
            self.cancel(),
        )
        .await?;
        let nodes = self.node_ops(topology);
        self.install_kube_proxy(workload.as_ref(), &nodes, manifest)
            .await?;
        nodes.wait_cni_ready().await?;
        lifecycle.advance(ClusterState::CniReady)?;

        wait_pods_running(workload.as_ref(), PODS_RUNNING_TIMEOUT, self.cancel()).await?;
        validate_cluster(
            workload.as_ref(),
            manifest.effective_version(&self.args.kubernetes_version),
            manifest.has_built(BuildTarget::K8sBins),
            self.cancel(),
        )
        .await?;
        lifecycle.advance(ClusterState::Validated)?;

        Ok(CapzCluster {
            api: workload,
            nodes,
        })
    }

    fn node_ops(&self, topology: ClusterTopology) -> NodeOps {
        let access = NodeAccess::new(&topology, NODE_USER, &self.env.config.ssh_private_key);
        NodeOps::new(
            self.env.remote(),
            access,
            topology,
            self.env.scripts.clone(),
            self.env.cancel.clone(),
        )
    }

    /// kind cluster on the bootstrap VM with the CAPZ providers installed
    async fn setup_management_cluster(&self, vm: &BootstrapVm) -> Result<Arc<dyn ClusterApi>> {
        info!("Setting up the management cluster");
        vm.exec(
            &["kind create cluster --config ~/kind-config.yaml --wait 15m"],
            None,
        )
        .await?;

        let public_ip = vm
            .addresses()
            .map(|a| a.public_ip.clone())
            .ok_or_else(|| Error::invalid_state("bootstrap VM", "not provisioned"))?;
        tokio::fs::create_dir_all(&self.env.config.kube_dir).await?;
        vm.download(".kube/config", &self.mgmt_kubeconfig).await?;
        rewrite_server(&self.mgmt_kubeconfig, &format!("https://{}:6443", public_ip))?;
        let mgmt = self.env.connect(&self.mgmt_kubeconfig).await?;

        info!("Creating the cluster identity secret");
        mgmt.create_secret(
            CAPI_NAMESPACE,
            CLUSTER_IDENTITY_SECRET,
            BTreeMap::from([(
                "clientSecret".to_string(),
                self.env.config.azure.client_secret.clone(),
            )]),
        )
        .await?;

        info!("Installing the Cluster API Azure providers");
        let mut init = CommandSpec::new("clusterctl")
            .args(["init", "--kubeconfig"])
            .arg(self.mgmt_kubeconfig.to_string_lossy())
            .args(["--infrastructure", "azure", "--wait-providers"])
            .timeout(CLUSTERCTL_TIMEOUT)
            .streamed();
        if let Some(token) = &self.env.config.github_token {
            init = init.env("GITHUB_TOKEN", token);
        }
        self.env
            .local_retried(&RetryPolicy::with_max_attempts(5), "clusterctl init", init)
            .await?;
        Ok(mgmt)
    }

    async fn node_images(&self, manifest: &BuildManifest) -> Result<NodeImages> {
        validate_gallery_name(&self.args.image_gallery)?;
        let base = if manifest.has_built(BuildTarget::K8sBins) {
            DEFAULT_KUBERNETES_VERSION
        } else {
            self.args.kubernetes_version.as_str()
        };
        let prefix = gallery_version_prefix(base)?;
        let windows_name = windows_image_name(self.args.win_os);
        let image = |name: &str| GalleryImage {
            gallery: self.args.image_gallery.clone(),
            image: name.to_string(),
            location: self.location.clone(),
        };
        let (ubuntu, windows) = (image(UBUNTU_IMAGE), image(&windows_name));
        let policy = RetryPolicy::with_max_attempts(5);
        let ubuntu_version = retry(&policy, "resolve ubuntu image version", self.cancel(), || {
            self.env.cloud.latest_gallery_image_version(&ubuntu, &prefix)
        })
        .await?;
        let windows_version = retry(&policy, "resolve windows image version", self.cancel(), || {
            self.env.cloud.latest_gallery_image_version(&windows, &prefix)
        })
        .await?;
        info!(
            ubuntu = %ubuntu_version,
            windows = %windows_version,
            "Resolved node image versions"
        );
        Ok(NodeImages {
            ubuntu_version,
            windows_name,
            windows_version,
        })
    }

    async fn create_workload_cluster(
        &self,
        mgmt: &dyn ClusterApi,
        vm: &BootstrapVm,
        manifest: &BuildManifest,
    ) -> Result<()> {
        info!(cluster = %self.names.cluster(), "Creating the CAPZ cluster");
        let images = self.node_images(manifest).await?;
        let ctx = cluster_context(
            &self.args,
            &self.env.config,
            &self.names,
            &self.location,
            &vm.artifacts_endpoint()?,
            &images,
            manifest,
        )?;
        let rendered = self.env.renderer.render(CLUSTER_TEMPLATE, &ctx)?;
        mgmt.apply(&rendered).await
    }

    async fn write_workload_kubeconfig(&self) -> Result<()> {
        info!("Setting up the CAPZ kubeconfig");
        let spec = CommandSpec::new("clusterctl")
            .args(["get", "kubeconfig", "--kubeconfig"])
            .arg(self.mgmt_kubeconfig.to_string_lossy())
            .arg(self.names.cluster());
        let output = self
            .env
            .local_retried(&RetryPolicy::with_max_attempts(5), "clusterctl get kubeconfig", spec)
            .await?;
        write_private(&self.kubeconfig, &output.stdout)
    }

    async fn helm_install(&self, repo: &str, chart: &str, values: &Value, extra: &[&str]) -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        file.write_all(serde_yaml::to_string(values)?.as_bytes())?;
        file.flush()?;
        let spec = CommandSpec::new("helm")
            .args(["install", "--repo", repo, chart, "--generate-name", "--values"])
            .arg(file.path().to_string_lossy())
            .arg("--kubeconfig")
            .arg(self.kubeconfig.to_string_lossy())
            .args(extra.iter().copied())
            .timeout(HELM_TIMEOUT)
            .streamed();
        self.env.local(spec).await.map(|_| ())
    }

    async fn latest_cloud_provider_tag(&self) -> Result<String> {
        let listing = retry(
            &RetryPolicy::with_max_attempts(5),
            "list cloud-provider-azure tags",
            self.cancel(),
            || async {
                let mut request = self
                    .http
                    .get(CLOUD_PROVIDER_AZURE_TAGS)
                    .header(reqwest::header::USER_AGENT, "e2e-runner");
                if let Some(token) = &self.env.config.github_token {
                    request = request.bearer_auth(token);
                }
                let response = request
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::command_failed(format!("GET {}: {}", CLOUD_PROVIDER_AZURE_TAGS, e)))?;
                response
                    .text()
                    .await
                    .map_err(|e| Error::command_failed(format!("GET {}: {}", CLOUD_PROVIDER_AZURE_TAGS, e)))
            },
        )
        .await?;
        latest_tag(&listing)
    }

    async fn install_cloud_provider(&self, manifest: &BuildManifest) -> Result<()> {
        let image_tag = if manifest.has_built(BuildTarget::K8sBins) {
            self.latest_cloud_provider_tag().await?
        } else {
            self.args.kubernetes_version.clone()
        };
        info!(tag = %image_tag, "Installing the Azure cloud provider");
        self.helm_install(
            &cloud_provider_azure_repo(&image_tag),
            "cloud-provider-azure",
            &cloud_provider_values(&self.args, &image_tag),
            &[],
        )
        .await
    }

    async fn install_flannel(&self, workload: &dyn ClusterApi, endpoint: &Endpoint) -> Result<()> {
        info!(mode = %self.args.flannel_mode, "Installing flannel");
        workload
            .create_namespace(
                FLANNEL_NAMESPACE,
                BTreeMap::from([(
                    "pod-security.kubernetes.io/enforce".to_string(),
                    "privileged".to_string(),
                )]),
            )
            .await?;
        self.helm_install(
            FLANNEL_HELM_REPO,
            "flannel",
            &flannel_values(&self.args),
            &["-n", FLANNEL_NAMESPACE, "--version", FLANNEL_HELM_VERSION],
        )
        .await?;

        let cluster_configuration = workload
            .config_map_value("kube-system", "kubeadm-config", "ClusterConfiguration")
            .await?
            .ok_or_else(|| Error::not_found("ConfigMap", "kube-system/kubeadm-config"))?;
        let networking = kubeadm_networking(&cluster_configuration)?;
        let ctx = context([
            ("cni_version", self.args.cni_version.clone()),
            ("container_image_tag", self.args.container_image_tag.clone()),
            ("container_image_registry", self.args.container_image_registry.clone()),
            ("control_plane_cidr", self.args.control_plane_subnet_cidr_block.clone()),
            ("node_cidr", self.args.node_subnet_cidr_block.clone()),
            ("service_subnet", networking.service_subnet),
            ("pod_subnet", networking.pod_subnet),
            ("kubernetes_service_host", endpoint.host.clone()),
            ("kubernetes_service_port", endpoint.port.to_string()),
            ("flannel_mode", self.args.flannel_mode.backend().to_string()),
        ]);
        let rendered = self.env.renderer.render(FLANNEL_WINDOWS_TEMPLATE, &ctx)?;
        workload.apply(&rendered).await
    }

    async fn install_kube_proxy(
        &self,
        workload: &dyn ClusterApi,
        nodes: &NodeOps,
        manifest: &BuildManifest,
    ) -> Result<()> {
        let k8s_built = manifest.has_built(BuildTarget::K8sBins);
        let custom_version = self.args.kubernetes_version != DEFAULT_KUBERNETES_VERSION;
        if !k8s_built && custom_version {
            // the image ships the default kube-proxy
            nodes.update_kube_proxy(&self.args.kubernetes_version).await?;
        }
        let ctx = context([
            ("cni_version", self.args.cni_version.clone()),
            ("kube_proxy_from_host", flag(k8s_built || custom_version)),
            ("container_image_tag", self.args.container_image_tag.clone()),
            ("container_image_registry", self.args.container_image_registry.clone()),
            ("enable_win_dsr", flag(self.args.enable_win_dsr)),
        ]);
        let rendered = self.env.renderer.render(KUBE_PROXY_WINDOWS_TEMPLATE, &ctx)?;
        info!("Installing the Windows kube-proxy");
        workload.apply(&rendered).await
    }

    /// Reuse a running workload cluster.
    ///
    /// Uses the workload kubeconfig when present, otherwise asks the
    /// management cluster for it.
    pub async fn reclaim(&self, lifecycle: &Lifecycle) -> Result<CapzCluster> {
        if !self.kubeconfig.exists() {
            if !self.mgmt_kubeconfig.exists() {
                return Err(Error::not_found(
                    "kubeconfig",
                    self.kubeconfig.display().to_string(),
                ));
            }
            self.write_workload_kubeconfig().await?;
        }
        let api = self.env.connect(&self.kubeconfig).await?;
        let endpoint = read_endpoint(&self.kubeconfig)?;
        let topology = ClusterTopology::discover(api.as_ref(), endpoint, self.cancel()).await?;
        lifecycle.advance(ClusterState::Reclaimed)?;
        Ok(CapzCluster {
            api,
            nodes: self.node_ops(topology),
        })
    }

    /// Undo a failed bring-up attempt; failures are logged and skipped
    pub async fn cleanup(&self, vm: &BootstrapVm) {
        self.collect_bootstrap_logs().await;

        info!("Deleting the management cluster");
        if let Err(e) = vm.exec(&["kind delete cluster"], None).await {
            warn!(error = %e, "Failed to delete the management cluster");
        }
        if let Err(e) = delete_resource_group(
            self.env.cloud.as_ref(),
            &self.names.workload_resource_group(),
            true,
            self.cancel(),
        )
        .await
        {
            warn!(error = %e, "Failed to delete the CAPZ resource group");
        }
        if let Err(e) = vm.delete_vnet_peerings().await {
            warn!(error = %e, "Failed to delete the bootstrap vnet peerings");
        }
    }

    /// Archive the management cluster pod logs into the artifacts directory
    pub async fn collect_bootstrap_logs(&self) {
        info!("Collecting logs from the bootstrap VM");
        match self.archive_bootstrap_logs().await {
            Ok(archive) => info!(archive = %archive.display(), "Bootstrap VM logs collected"),
            Err(e) => warn!(error = %e, "Cannot collect logs from the bootstrap VM, skipping"),
        }
    }

    async fn archive_bootstrap_logs(&self) -> Result<PathBuf> {
        if !self.mgmt_kubeconfig.exists() {
            return Err(Error::not_found(
                "kubeconfig",
                self.mgmt_kubeconfig.display().to_string(),
            ));
        }
        let mgmt = self.env.connect(&self.mgmt_kubeconfig).await?;
        let artifacts = &self.env.config.artifacts_dir;
        let dir = artifacts.join(BOOTSTRAP_LOGS_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        for pod in mgmt.list_pods(None).await? {
            for container in &pod.containers {
                let logs = mgmt.logs(&pod.namespace, &pod.name, container).await?;
                let file = dir.join(format!("{}_{}_{}.log", pod.namespace, pod.name, container));
                tokio::fs::write(file, logs).await?;
            }
        }

        let archive = artifacts.join(format!(
            "{}_{}.tgz",
            BOOTSTRAP_LOGS_DIR,
            Utc::now().format("%Y-%m-%d_%H-%M-%S")
        ));
        self.env
            .local(
                CommandSpec::new("tar")
                    .arg("-czf")
                    .arg(archive.to_string_lossy())
                    .arg("-C")
                    .arg(artifacts.to_string_lossy())
                    .arg(BOOTSTRAP_LOGS_DIR),
            )
            .await?;
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(archive)
    }

    /// Delete the bootstrap and workload resource groups without waiting
    pub async fn tear_down(&self, vm: &mut BootstrapVm, lifecycle: &Lifecycle) -> Result<()> {
        let bootstrap = vm.remove(false).await;
        let workload = delete_resource_group(
            self.env.cloud.as_ref(),
            &self.names.workload_resource_group(),
            false,
            self.cancel(),
        )
        .await;
        bootstrap?;
        workload?;
        lifecycle.advance(ClusterState::TornDown)
    }
}
