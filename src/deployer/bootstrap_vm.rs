//! Bootstrap VM
//!
//! A single Ubuntu VM in its own resource group hosts everything the run
//! needs besides the workload cluster: source builds, the nginx share the
//! nodes download artifacts from, and the kind management cluster. Setup
//! walks the cluster lifecycle through `Provisioning(Network)` and
//! `Provisioning(Compute)`; if any step fails for good the whole resource
//! group is deleted before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::lifecycle::{ClusterState, Lifecycle, Phase};
use super::naming::{ResourceNames, BOOTSTRAP_NIC, BOOTSTRAP_VM};
use crate::cloud::resource_group::{
    create_resource_group, delete_resource_group, ResourceGroupTags,
};
use crate::cloud::{
    ensure, wait_for_operation, CloudProvisioner, ResourceHandle, ResourceKind, ResourceRef,
    FATAL_PROVISIONING_STATES,
};
use crate::error::{Error, Result};
use crate::poll::{poll_until_ready, PollSpec, Readiness};
use crate::remote::{RemoteClient, RemoteOutput, RemoteTarget, DEFAULT_REMOTE_TIMEOUT, SSH_PORT};
use crate::retry::{retry, RetryPolicy};
use crate::scripts::{ScriptDir, CLOUD_INIT, INSTALL_GOLANG, INSTALL_KIND, KIND_CONFIG};

/// Login user of the bootstrap VM
pub const VM_USER: &str = "capi";
/// GOPATH on the VM
pub const GO_PATH: &str = "~/go";
/// Directory nginx serves to the cluster nodes
pub const ARTIFACTS_DIR: &str = "~/www";
/// Port nginx listens on
pub const ARTIFACTS_PORT: u16 = 8081;
/// Where the management cluster kubeconfig is kept on the runner
pub const MGMT_KUBECONFIG: &str = "mgmt-kubeconfig.yaml";

const VNET_CIDR: &str = "192.168.0.0/16";
const SUBNET_CIDR: &str = "192.168.0.0/24";
const NETWORK_TIMEOUT: Duration = Duration::from_secs(600);
const VM_TIMEOUT: Duration = Duration::from_secs(900);
const SSH_TIMEOUT: Duration = Duration::from_secs(300);
const CLOUD_INIT_TIMEOUT: Duration = Duration::from_secs(600);
const VM_FATAL_STATES: &[&str] = &["Failed", "Canceled", "Deleting"];
const OS_DISK_GB: u32 = 128;

/// What to create.
#[derive(Clone, Debug)]
pub struct BootstrapVmSpec {
    pub subscription_id: String,
    pub location: String,
    pub vm_size: String,
    pub tags: ResourceGroupTags,
    pub ssh_public_key: String,
    pub ssh_private_key: PathBuf,
}

/// Addresses of a provisioned bootstrap VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapVmAddresses {
    /// Reachable from the runner
    pub public_ip: String,
    /// Reachable from the cluster vnet (after peering)
    pub private_ip: String,
}

/// The bootstrap VM of one run.
pub struct BootstrapVm {
    cloud: Arc<dyn CloudProvisioner>,
    remote: RemoteClient,
    names: ResourceNames,
    spec: BootstrapVmSpec,
    scripts: Arc<ScriptDir>,
    addresses: Option<BootstrapVmAddresses>,
    cancel: CancellationToken,
}

impl BootstrapVm {
    pub fn new(
        cloud: Arc<dyn CloudProvisioner>,
        remote: RemoteClient,
        names: ResourceNames,
        spec: BootstrapVmSpec,
        scripts: Arc<ScriptDir>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cloud,
            remote,
            names,
            spec,
            scripts,
            addresses: None,
            cancel,
        }
    }

    /// Use the addresses of a VM known to exist instead of provisioning one
    pub fn with_addresses(mut self, addresses: BootstrapVmAddresses) -> Self {
        self.addresses = Some(addresses);
        self
    }

    /// Addresses, once the VM is set up or attached
    pub fn addresses(&self) -> Option<&BootstrapVmAddresses> {
        self.addresses.as_ref()
    }

    /// Resource group holding the VM
    pub fn resource_group(&self) -> String {
        self.names.bootstrap_resource_group()
    }

    /// ssh target of the VM
    pub fn target(&self) -> Result<RemoteTarget> {
        let addresses = self.require_addresses()?;
        Ok(RemoteTarget::new(&addresses.public_ip, VM_USER).with_key(&self.spec.ssh_private_key))
    }

    /// `host:port` of the artifact share as seen from the cluster
    pub fn artifacts_endpoint(&self) -> Result<String> {
        Ok(format!(
            "{}:{}",
            self.require_addresses()?.private_ip,
            ARTIFACTS_PORT
        ))
    }

    fn require_addresses(&self) -> Result<&BootstrapVmAddresses> {
        self.addresses
            .as_ref()
            .ok_or_else(|| Error::invalid_state(BOOTSTRAP_VM, "not provisioned"))
    }

    /// Provision and initialize the VM, rolling back on failure
    pub async fn setup(&mut self, lifecycle: &Lifecycle) -> Result<()> {
        if self.addresses.is_some() {
            // attached VM: the network and compute phases are already done
            if lifecycle.state() == ClusterState::Absent {
                lifecycle.advance(ClusterState::Provisioning(Phase::Network))?;
                lifecycle.advance(ClusterState::Provisioning(Phase::Compute))?;
            }
            return Ok(());
        }
        lifecycle.advance(ClusterState::Provisioning(Phase::Network))?;

        match self.provision(lifecycle).await {
            Ok(addresses) => {
                info!(
                    public_ip = %addresses.public_ip,
                    private_ip = %addresses.private_ip,
                    "Bootstrap VM is ready"
                );
                self.addresses = Some(addresses);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Bootstrap VM setup failed, deleting its resource group");
                if let Err(cleanup) = delete_resource_group(
                    self.cloud.as_ref(),
                    &self.resource_group(),
                    true,
                    &self.cancel,
                )
                .await
                {
                    warn!(error = %cleanup, "Failed to roll back the bootstrap resource group");
                }
                if let Err(state) = lifecycle.advance(ClusterState::Absent) {
                    warn!(error = %state, "Unexpected cluster state after rollback");
                }
                Err(e)
            }
        }
    }

    async fn provision(&self, lifecycle: &Lifecycle) -> Result<BootstrapVmAddresses> {
        let rg = self.resource_group();
        let location = &self.spec.location;
        let sub = &self.spec.subscription_id;
        create_resource_group(
            self.cloud.as_ref(),
            &rg,
            location,
            &self.spec.tags,
            &self.cancel,
        )
        .await?;

        let vnet = self.names.bootstrap_vnet();
        self.ensure(
            &vnet,
            json!({
                "location": location,
                "properties": {"addressSpace": {"addressPrefixes": [VNET_CIDR]}}
            }),
        )
        .await?;

        let nsg = self.names.bootstrap_nsg();
        self.ensure(
            &nsg,
            json!({
                "location": location,
                "properties": {"securityRules": [
                    inbound_rule("Allow_SSH", 1000, 22),
                    inbound_rule("Allow_K8s_API", 1001, 6443),
                ]}
            }),
        )
        .await?;

        let subnet = self.names.bootstrap_subnet();
        self.ensure(
            &subnet,
            json!({
                "properties": {
                    "addressPrefix": SUBNET_CIDR,
                    "networkSecurityGroup": {"id": nsg.id(sub)}
                }
            }),
        )
        .await?;

        let public_ip = self.names.bootstrap_public_ip();
        let public_ip_handle = self
            .ensure(
                &public_ip,
                json!({
                    "location": location,
                    "sku": {"name": "Standard"},
                    "properties": {
                        "publicIPAddressVersion": "IPv4",
                        "publicIPAllocationMethod": "Static"
                    }
                }),
            )
            .await?;

        let nic = self.names.bootstrap_nic();
        let nic_handle = self
            .ensure(
                &nic,
                json!({
                    "location": location,
                    "properties": {"ipConfigurations": [{
                        "name": format!("{}-ipconfig", BOOTSTRAP_NIC),
                        "properties": {
                            "subnet": {"id": subnet.id(sub)},
                            "publicIPAddress": {"id": public_ip.id(sub)}
                        }
                    }]}
                }),
            )
            .await?;
        let addresses = addresses_from(&public_ip_handle, &nic_handle)?;

        lifecycle.advance(ClusterState::Provisioning(Phase::Compute))?;
        ensure(
            self.cloud.as_ref(),
            &self.names.bootstrap_vm(),
            &self.vm_body(&nic.id(sub)),
            VM_TIMEOUT,
            VM_FATAL_STATES,
            &self.cancel,
        )
        .await?;

        let target =
            RemoteTarget::new(&addresses.public_ip, VM_USER).with_key(&self.spec.ssh_private_key);
        self.remote
            .wait_for_port(&addresses.public_ip, SSH_PORT, SSH_TIMEOUT)
            .await?;
        self.wait_for_cloud_init(&target).await?;
        self.initialize(&target).await?;
        Ok(addresses)
    }

    async fn ensure(&self, reference: &ResourceRef, body: Value) -> Result<ResourceHandle> {
        ensure(
            self.cloud.as_ref(),
            reference,
            &body,
            NETWORK_TIMEOUT,
            FATAL_PROVISIONING_STATES,
            &self.cancel,
        )
        .await
    }

    fn vm_body(&self, nic_id: &str) -> Value {
        let user_data = base64::engine::general_purpose::STANDARD.encode(CLOUD_INIT.contents);
        json!({
            "location": self.spec.location,
            "properties": {
                "hardwareProfile": {"vmSize": self.spec.vm_size},
                "osProfile": {
                    "computerName": BOOTSTRAP_VM,
                    "adminUsername": VM_USER,
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": true,
                        "ssh": {"publicKeys": [{
                            "path": format!("/home/{}/.ssh/authorized_keys", VM_USER),
                            "keyData": self.spec.ssh_public_key
                        }]}
                    }
                },
                "userData": user_data,
                "storageProfile": {
                    "imageReference": {
                        "publisher": "Canonical",
                        "offer": "0001-com-ubuntu-server-focal",
                        "sku": "20_04-lts-gen2",
                        "version": "latest"
                    },
                    "osDisk": {"createOption": "FromImage", "diskSizeGB": OS_DISK_GB}
                },
                "networkProfile": {"networkInterfaces": [{"id": nic_id}]}
            }
        })
    }

    async fn wait_for_cloud_init(&self, target: &RemoteTarget) -> Result<()> {
        let check = self.remote.single_attempt();
        let spec = PollSpec::new(CLOUD_INIT_TIMEOUT).max_interval(Duration::from_secs(10));
        poll_until_ready(&spec, "cloud-init to finish", &self.cancel, || async {
            match check
                .run(target, "test -e /cloud-init-complete", Duration::from_secs(60), None)
                .await
            {
                Ok(_) => Ok(Readiness::Ready),
                Err(Error::RemoteCommandFailed { .. }) => {
                    Ok(Readiness::not_ready("/cloud-init-complete is missing"))
                }
                Err(Error::ConnectionFailed { message, .. }) => Ok(Readiness::not_ready(message)),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn initialize(&self, target: &RemoteTarget) -> Result<()> {
        info!("Initializing the bootstrap VM");
        self.remote
            .run_script_streamed(
                target,
                &[
                    format!("mkdir -p {}", ARTIFACTS_DIR),
                    format!(
                        "docker run --name nginx --restart unless-stopped -p {}:80 -v {}:/usr/share/nginx/html:ro -d nginx:stable",
                        ARTIFACTS_PORT, ARTIFACTS_DIR
                    ),
                ],
                None,
                DEFAULT_REMOTE_TIMEOUT,
            )
            .await?;

        for script in [INSTALL_GOLANG, INSTALL_KIND] {
            let remote = format!("/tmp/{}", script.name);
            self.remote
                .upload(target, &self.scripts.path(&script), &remote)
                .await?;
            self.remote
                .run_script_streamed(
                    target,
                    &[format!("bash {}", remote)],
                    None,
                    DEFAULT_REMOTE_TIMEOUT,
                )
                .await?;
        }

        self.remote
            .upload(target, &self.scripts.path(&KIND_CONFIG), KIND_CONFIG.name)
            .await?;
        self.remote
            .upload(target, self.scripts.root(), "www/scripts")
            .await
    }

    /// Look up an already provisioned VM without creating anything.
    ///
    /// Returns `false` when the VM's network resources do not exist.
    pub async fn attach(&mut self) -> Result<bool> {
        let policy = RetryPolicy::with_max_attempts(5);
        let public_ip = self.names.bootstrap_public_ip();
        let nic = self.names.bootstrap_nic();
        let observed = retry(&policy, "find bootstrap VM", &self.cancel, || async {
            Ok((
                self.cloud.get(&public_ip).await?,
                self.cloud.get(&nic).await?,
            ))
        })
        .await?;
        match observed {
            (Some(public_ip), Some(nic)) => {
                let addresses = addresses_from(&public_ip, &nic)?;
                info!(public_ip = %addresses.public_ip, "Attached to the existing bootstrap VM");
                self.addresses = Some(addresses);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete the bootstrap resource group
    pub async fn remove(&mut self, wait: bool) -> Result<()> {
        delete_resource_group(
            self.cloud.as_ref(),
            &self.resource_group(),
            wait,
            &self.cancel,
        )
        .await?;
        self.addresses = None;
        Ok(())
    }

    /// Delete the peerings CAPZ added to the bootstrap vnet
    pub async fn delete_vnet_peerings(&self) -> Result<()> {
        let policy = RetryPolicy::with_max_attempts(5);
        let rg = self.resource_group();
        let vnet = self.names.bootstrap_vnet().name;
        let peerings = retry(&policy, "list vnet peerings", &self.cancel, || {
            self.cloud
                .list(ResourceKind::VnetPeering, &rg, Some(vnet.clone()))
        })
        .await?;
        for peering in peerings {
            let reference = &peering.reference;
            info!(peering = %reference.name, "Deleting vnet peering");
            let operation = retry(&policy, "delete vnet peering", &self.cancel, || {
                self.cloud.delete(reference)
            })
            .await?;
            wait_for_operation(self.cloud.as_ref(), &operation, NETWORK_TIMEOUT, &self.cancel)
                .await?;
        }
        Ok(())
    }

    /// Run a fail-fast script on the VM, streaming its output
    pub async fn exec<S: AsRef<str>>(&self, lines: &[S], cwd: Option<&str>) -> Result<RemoteOutput> {
        self.remote
            .run_script_streamed(&self.target()?, lines, cwd, DEFAULT_REMOTE_TIMEOUT)
            .await
    }

    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.remote.upload(&self.target()?, local, remote).await
    }

    pub async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.remote.download(&self.target()?, remote, local).await
    }

    /// Clone `branch` of `url` into `dir` unless it is already there
    pub async fn clone_repo(&self, url: &str, branch: &str, dir: &str) -> Result<()> {
        info!(repo = %url, branch = %branch, dir = %dir, "Cloning on the bootstrap VM");
        self.exec(
            &[format!(
                "test -e {dir} || git clone --single-branch {url} --branch {branch} {dir}",
                dir = dir,
                url = url,
                branch = branch
            )],
            None,
        )
        .await
        .map(|_| ())
    }
}

fn inbound_rule(name: &str, priority: u32, port: u16) -> Value {
    json!({
        "name": name,
        "properties": {
            "protocol": "Tcp",
            "priority": priority,
            "access": "Allow",
            "direction": "Inbound",
            "sourceAddressPrefix": "0.0.0.0/0",
            "sourcePortRange": "*",
            "destinationAddressPrefix": "0.0.0.0/0",
            "destinationPortRange": port.to_string()
        }
    })
}

fn addresses_from(public_ip: &ResourceHandle, nic: &ResourceHandle) -> Result<BootstrapVmAddresses> {
    let public = public_ip
        .str_at("/properties/ipAddress")
        .ok_or_else(|| Error::invalid_state(public_ip.reference.to_string(), "no address assigned"))?;
    let private = nic
        .str_at("/properties/ipConfigurations/0/properties/privateIPAddress")
        .ok_or_else(|| Error::invalid_state(nic.reference.to_string(), "no private address"))?;
    Ok(BootstrapVmAddresses {
        public_ip: public.to_string(),
        private_ip: private.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockCloudProvisioner, Operation, OperationAction};
    use crate::error::ErrorKind;
    use crate::exec::MockCommandRunner;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn spec() -> BootstrapVmSpec {
        BootstrapVmSpec {
            subscription_id: "sub".into(),
            location: "westeurope".into(),
            vm_size: "Standard_D2s_v3".into(),
            tags: ResourceGroupTags::new(None, None),
            ssh_public_key: "ssh-rsa AAAA".into(),
            ssh_private_key: PathBuf::from("/tmp/id_rsa"),
        }
    }

    fn accepted(reference: &ResourceRef, action: OperationAction) -> Operation {
        Operation {
            reference: reference.clone(),
            action,
        }
    }

    fn vm(cloud: MockCloudProvisioner) -> BootstrapVm {
        let cancel = CancellationToken::new();
        BootstrapVm::new(
            Arc::new(cloud),
            RemoteClient::new(Arc::new(MockCommandRunner::new()), cancel.clone()),
            ResourceNames::new("ci"),
            spec(),
            Arc::new(ScriptDir::materialize().unwrap()),
            cancel,
        )
    }

    #[test]
    fn addresses_come_from_the_public_ip_and_nic() {
        let names = ResourceNames::new("ci");
        let pip = ResourceHandle::from_body(
            names.bootstrap_public_ip(),
            json!({"properties": {"ipAddress": "20.1.2.3"}}),
        );
        let nic = ResourceHandle::from_body(
            names.bootstrap_nic(),
            json!({"properties": {"ipConfigurations": [{"properties": {"privateIPAddress": "192.168.0.4"}}]}}),
        );
        let addresses = addresses_from(&pip, &nic).unwrap();
        assert_eq!(addresses.public_ip, "20.1.2.3");
        assert_eq!(addresses.private_ip, "192.168.0.4");
    }

    #[test]
    fn vm_body_carries_user_data_and_the_ssh_key() {
        let vm = vm(MockCloudProvisioner::new());
        let body = vm.vm_body("/nic-id");
        let user_data = body
            .pointer("/properties/userData")
            .and_then(Value::as_str)
            .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(user_data)
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), CLOUD_INIT.contents);
        assert_eq!(
            body.pointer("/properties/osProfile/linuxConfiguration/ssh/publicKeys/0/keyData"),
            Some(&json!("ssh-rsa AAAA"))
        );
    }

    #[test]
    fn target_requires_a_provisioned_vm() {
        let vm = vm(MockCloudProvisioner::new());
        assert_eq!(vm.target().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    // ==========================================================================
    // Story: A failed network step rolls the resource group back
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn when_vnet_creation_fails_the_resource_group_is_deleted() {
        let deleted = Arc::new(AtomicBool::new(false));
        let mut cloud = MockCloudProvisioner::new();
        cloud.expect_create_or_update().returning(|r, _| match r.kind {
            ResourceKind::ResourceGroup => Ok(accepted(r, OperationAction::CreateOrUpdate)),
            _ => Err(Error::configuration("address space overlaps")),
        });
        let d = deleted.clone();
        cloud.expect_get().returning(move |r| {
            if d.load(Ordering::SeqCst) {
                Ok(None)
            } else {
                Ok(Some(ResourceHandle::from_body(
                    r.clone(),
                    json!({"properties": {"provisioningState": "Succeeded"}}),
                )))
            }
        });
        let d = deleted.clone();
        cloud.expect_delete().times(1).returning(move |r| {
            assert_eq!(r.kind, ResourceKind::ResourceGroup);
            d.store(true, Ordering::SeqCst);
            Ok(accepted(r, OperationAction::Delete))
        });

        let lifecycle = Lifecycle::new("ci");
        let mut vm = vm(cloud);
        let err = vm.setup(&lifecycle).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(deleted.load(Ordering::SeqCst));
        assert_eq!(lifecycle.state(), ClusterState::Absent);
        assert!(vm.addresses().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn attach_reports_a_missing_vm() {
        let mut cloud = MockCloudProvisioner::new();
        cloud.expect_get().returning(|_| Ok(None));
        let mut vm = vm(cloud);
        assert!(!vm.attach().await.unwrap());
    }

    #[tokio::test]
    async fn peerings_are_deleted_one_by_one() {
        let mut cloud = MockCloudProvisioner::new();
        cloud
            .expect_list()
            .withf(|kind, rg, parent| {
                *kind == ResourceKind::VnetPeering
                    && rg.to_string() == "ci-bootstrap"
                    && parent.as_deref() == Some("k8s-bootstrap-vnet")
            })
            .returning(|_, rg, parent| {
                Ok(vec![ResourceHandle::from_body(
                    ResourceRef::nested(
                        ResourceKind::VnetPeering,
                        rg,
                        parent.unwrap_or_default(),
                        "to-ci",
                    ),
                    json!({}),
                )])
            });
        cloud
            .expect_delete()
            .times(1)
            .returning(|r| Ok(accepted(r, OperationAction::Delete)));
        cloud.expect_get().returning(|_| Ok(None));

        vm(cloud).delete_vnet_peerings().await.unwrap();
    }
}
