//! AKS managed cluster
//!
//! One resource group named after the cluster holds the managed cluster; AKS
//! creates the node resource group itself. The Linux system pool is tainted so
//! that only critical add-ons and the conformance helpers land on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::lifecycle::{ClusterState, Lifecycle, Phase};
use super::naming::ResourceNames;
use super::{wait_pods_running, DeployEnv, PODS_RUNNING_TIMEOUT};
use crate::cloud::resource_group::{create_resource_group, delete_resource_group};
use crate::cloud::{ensure, FATAL_PROVISIONING_STATES};
use crate::cluster::kubeconfig::write_private;
use crate::cluster::ClusterApi;
use crate::config::{AksArgs, RunConfig};
use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};

/// Taint key of the Linux system pool
pub const LINUX_POOL_TAINT_KEY: &str = "CriticalAddonsOnly";

const LINUX_POOL: &str = "linagt";
const WINDOWS_POOL: &str = "winagt";
const LINUX_POOL_TAINT: &str = "CriticalAddonsOnly=true:NoSchedule";
const ADMIN_USER: &str = "azureuser";
const OS_DISK_GB: u32 = 128;
const PASSWORD_LENGTH: usize = 32;
const PASSWORD_SPECIAL_CHARS: &str = "+-.<=>@_";
const CLUSTER_TIMEOUT: Duration = Duration::from_secs(3600);
const USER_CREDENTIAL_ACTION: &str = "listClusterUserCredential";

/// Random Windows administrator password
pub fn generate_admin_password() -> String {
    let alphabet: Vec<char> = ('a'..='z')
        .chain('A'..='Z')
        .chain('0'..='9')
        .chain(PASSWORD_SPECIAL_CHARS.chars())
        .collect();
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LENGTH)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}

/// ARM body of the managed cluster
pub fn managed_cluster_body(
    args: &AksArgs,
    config: &RunConfig,
    names: &ResourceNames,
    location: &str,
    admin_password: &str,
) -> Value {
    let tags = config.tags.to_map();
    json!({
        "location": location,
        "tags": tags,
        "properties": {
            "kubernetesVersion": args.aks_version,
            "dnsPrefix": names.cluster(),
            "nodeResourceGroup": names.aks_node_resource_group(),
            "enableRBAC": true,
            "agentPoolProfiles": [
                {
                    "name": LINUX_POOL,
                    "count": args.linux_agents_count,
                    "vmSize": args.linux_agents_size,
                    "osType": "Linux",
                    "osSKU": "Ubuntu",
                    "type": "VirtualMachineScaleSets",
                    "mode": "System",
                    "nodeTaints": [LINUX_POOL_TAINT],
                    "orchestratorVersion": args.aks_version,
                    "osDiskSizeGB": OS_DISK_GB,
                    "tags": tags,
                },
                {
                    "name": WINDOWS_POOL,
                    "count": args.win_agents_count,
                    "vmSize": args.win_agents_size,
                    "osType": "Windows",
                    "osSKU": args.win_agents_sku,
                    "type": "VirtualMachineScaleSets",
                    "mode": "User",
                    "orchestratorVersion": args.aks_version,
                    "osDiskSizeGB": OS_DISK_GB,
                    "tags": tags,
                },
            ],
            "servicePrincipalProfile": {
                "clientId": config.azure.client_id,
                "secret": config.azure.client_secret,
            },
            "linuxProfile": {
                "adminUsername": ADMIN_USER,
                "ssh": { "publicKeys": [{ "keyData": config.ssh_public_key }] },
            },
            "windowsProfile": {
                "adminUsername": ADMIN_USER,
                "adminPassword": admin_password,
            },
            "networkProfile": {
                "networkPlugin": "azure",
                "networkPolicy": "azure",
                "ipFamilies": ["IPv4"],
            },
        },
    })
}

/// First kubeconfig of a `listClusterUserCredential` response
pub fn kubeconfig_from_credentials(credentials: &Value) -> Result<String> {
    let encoded = credentials
        .pointer("/kubeconfigs/0/value")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::cloud(USER_CREDENTIAL_ACTION, "response carries no kubeconfig"))?;
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| Error::cloud(USER_CREDENTIAL_ACTION, format!("invalid kubeconfig: {}", e)))?;
    String::from_utf8(decoded)
        .map_err(|e| Error::cloud(USER_CREDENTIAL_ACTION, format!("invalid kubeconfig: {}", e)))
}

/// Deploys the AKS cluster of one run.
pub struct AksDeployer {
    args: AksArgs,
    names: ResourceNames,
    location: String,
    env: DeployEnv,
    kubeconfig: PathBuf,
}

impl AksDeployer {
    pub fn new(args: AksArgs, location: impl Into<String>, env: DeployEnv) -> Self {
        let names = ResourceNames::new(&args.cluster_name);
        let kubeconfig = env.config.kube_dir.join("config");
        Self {
            args,
            names,
            location: location.into(),
            env,
            kubeconfig,
        }
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    /// Create the resource group and managed cluster; a failed attempt
    /// deletes the resource group before the next one
    pub async fn bring_up(&self, lifecycle: &Lifecycle) -> Result<Arc<dyn ClusterApi>> {
        retry(
            &RetryPolicy::with_max_attempts(5),
            "create AKS cluster",
            &self.env.cancel,
            || async {
                match self.create_cluster(lifecycle).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        error!(error = %e, "Failed to create the AKS cluster, deleting its resource group");
                        if let Err(cleanup) = delete_resource_group(
                            self.env.cloud.as_ref(),
                            &self.names.workload_resource_group(),
                            true,
                            &self.env.cancel,
                        )
                        .await
                        {
                            warn!(error = %cleanup, "Failed to delete the AKS resource group");
                        }
                        if let Err(state) = lifecycle.advance(ClusterState::Absent) {
                            warn!(error = %state, "Unexpected cluster state after rollback");
                        }
                        Err(e)
                    }
                }
            },
        )
        .await?;

        let api = self.connect_with_credentials().await?;
        wait_pods_running(api.as_ref(), PODS_RUNNING_TIMEOUT, &self.env.cancel).await?;
        lifecycle.advance(ClusterState::CniReady)?;
        Ok(api)
    }

    async fn create_cluster(&self, lifecycle: &Lifecycle) -> Result<()> {
        let rg = self.names.workload_resource_group();
        lifecycle.advance(ClusterState::Provisioning(Phase::Network))?;
        create_resource_group(
            self.env.cloud.as_ref(),
            &rg,
            &self.location,
            &self.env.config.tags,
            &self.env.cancel,
        )
        .await?;
        lifecycle.advance(ClusterState::Provisioning(Phase::Compute))?;
        lifecycle.advance(ClusterState::Provisioning(Phase::ControlPlane))?;

        info!(cluster = %self.names.cluster(), version = %self.args.aks_version, "Creating the AKS cluster");
        let body = managed_cluster_body(
            &self.args,
            &self.env.config,
            &self.names,
            &self.location,
            &generate_admin_password(),
        );
        ensure(
            self.env.cloud.as_ref(),
            &self.names.managed_cluster(),
            &body,
            CLUSTER_TIMEOUT,
            FATAL_PROVISIONING_STATES,
            &self.env.cancel,
        )
        .await?;
        // agent pools are part of the managed cluster provisioning
        lifecycle.advance(ClusterState::ControlPlaneReady)?;
        lifecycle.advance(ClusterState::Provisioning(Phase::Agents))?;
        lifecycle.advance(ClusterState::AgentsReady)
    }

    async fn connect_with_credentials(&self) -> Result<Arc<dyn ClusterApi>> {
        info!("Setting up the AKS kubeconfig");
        let reference = self.names.managed_cluster();
        let credentials = retry(
            &RetryPolicy::with_max_attempts(5),
            "list AKS user credentials",
            &self.env.cancel,
            || self.env.cloud.invoke(&reference, USER_CREDENTIAL_ACTION),
        )
        .await?;
        write_private(&self.kubeconfig, &kubeconfig_from_credentials(&credentials)?)?;
        self.env.connect(&self.kubeconfig).await
    }

    /// Reuse the running managed cluster without creating anything
    pub async fn reclaim(&self, lifecycle: &Lifecycle) -> Result<Arc<dyn ClusterApi>> {
        let api = if self.kubeconfig.exists() {
            self.env.connect(&self.kubeconfig).await?
        } else {
            self.connect_with_credentials().await?
        };
        lifecycle.advance(ClusterState::Reclaimed)?;
        Ok(api)
    }

    /// Delete the resource group without waiting
    pub async fn tear_down(&self, lifecycle: &Lifecycle) -> Result<()> {
        info!("Deleting the AKS cluster resource group");
        delete_resource_group(
            self.env.cloud.as_ref(),
            &self.names.workload_resource_group(),
            false,
            &self.env.cancel,
        )
        .await?;
        lifecycle.advance(ClusterState::TornDown)
    }
}
