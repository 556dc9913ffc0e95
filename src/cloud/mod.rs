//! Cloud provisioning
//!
//! The runner talks to Azure Resource Manager through the
//! [`CloudProvisioner`] trait. Resources are addressed by [`ResourceRef`] and
//! observed as [`ResourceHandle`] snapshots. Mutations return an
//! [`Operation`] that [`wait_for_operation`] turns into a poll, since ARM
//! accepts requests long before the resource reaches its final state.

pub mod azure;
pub mod resource_group;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::poll::{phase_readiness, poll_until_ready, PollSpec, Readiness};
use crate::retry::{retry, RetryPolicy};

/// ARM provisioning state of a finished resource
pub const SUCCEEDED: &str = "Succeeded";

/// Provisioning states a resource does not recover from
pub const FATAL_PROVISIONING_STATES: &[&str] = &["Failed", "Canceled"];

/// Kinds of ARM resources the runner manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Resource group
    ResourceGroup,
    /// Virtual network
    VirtualNetwork,
    /// Subnet of a virtual network
    Subnet,
    /// Network security group
    NetworkSecurityGroup,
    /// Public IP address
    PublicIp,
    /// Network interface
    NetworkInterface,
    /// Virtual machine
    VirtualMachine,
    /// AKS managed cluster
    ManagedCluster,
    /// Peering of a virtual network
    VnetPeering,
}

impl ResourceKind {
    /// Provider namespace and type segment, relative to the resource group
    fn type_path(&self) -> &'static str {
        match self {
            ResourceKind::ResourceGroup => "",
            ResourceKind::VirtualNetwork => "Microsoft.Network/virtualNetworks",
            ResourceKind::Subnet => "Microsoft.Network/virtualNetworks/{parent}/subnets",
            ResourceKind::NetworkSecurityGroup => "Microsoft.Network/networkSecurityGroups",
            ResourceKind::PublicIp => "Microsoft.Network/publicIPAddresses",
            ResourceKind::NetworkInterface => "Microsoft.Network/networkInterfaces",
            ResourceKind::VirtualMachine => "Microsoft.Compute/virtualMachines",
            ResourceKind::ManagedCluster => "Microsoft.ContainerService/managedClusters",
            ResourceKind::VnetPeering => {
                "Microsoft.Network/virtualNetworks/{parent}/virtualNetworkPeerings"
            }
        }
    }

    /// ARM api-version for this kind
    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::ResourceGroup => "2022-09-01",
            ResourceKind::VirtualMachine => "2023-07-01",
            ResourceKind::ManagedCluster => "2023-08-01",
            _ => "2023-05-01",
        }
    }

    /// Whether resources of this kind live under a parent resource
    pub fn has_parent(&self) -> bool {
        matches!(self, ResourceKind::Subnet | ResourceKind::VnetPeering)
    }

    /// Collection path under a resource group (parent substituted)
    fn collection_path(&self, subscription: &str, resource_group: &str, parent: Option<&str>) -> String {
        let group = format!("/subscriptions/{}/resourceGroups/{}", subscription, resource_group);
        match self {
            ResourceKind::ResourceGroup => format!("/subscriptions/{}/resourceGroups", subscription),
            kind => format!(
                "{}/providers/{}",
                group,
                kind.type_path().replace("{parent}", parent.unwrap_or_default())
            ),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::ResourceGroup => "resource group",
            ResourceKind::VirtualNetwork => "virtual network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::NetworkSecurityGroup => "network security group",
            ResourceKind::PublicIp => "public IP",
            ResourceKind::NetworkInterface => "network interface",
            ResourceKind::VirtualMachine => "virtual machine",
            ResourceKind::ManagedCluster => "managed cluster",
            ResourceKind::VnetPeering => "vnet peering",
        };
        write!(f, "{}", name)
    }
}

/// Address of an ARM resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Resource kind
    pub kind: ResourceKind,
    /// Owning resource group (the group itself for [`ResourceKind::ResourceGroup`])
    pub resource_group: String,
    /// Resource name
    pub name: String,
    /// Parent resource name for nested kinds (subnets, peerings)
    pub parent: Option<String>,
}

impl ResourceRef {
    /// Reference a top-level resource in a group
    pub fn new(kind: ResourceKind, resource_group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            resource_group: resource_group.into(),
            name: name.into(),
            parent: None,
        }
    }

    /// Reference a resource group
    pub fn resource_group(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ResourceKind::ResourceGroup, name.clone(), name)
    }

    /// Reference a nested resource (subnet, peering) under `parent`
    pub fn nested(
        kind: ResourceKind,
        resource_group: impl Into<String>,
        parent: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            resource_group: resource_group.into(),
            name: name.into(),
            parent: Some(parent.into()),
        }
    }

    /// Full ARM id within `subscription`
    pub fn id(&self, subscription: &str) -> String {
        match self.kind {
            ResourceKind::ResourceGroup => {
                format!("/subscriptions/{}/resourceGroups/{}", subscription, self.name)
            }
            kind => format!(
                "{}/{}",
                kind.collection_path(subscription, &self.resource_group, self.parent.as_deref()),
                self.name
            ),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{} {}/{}", self.kind, parent, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Observed snapshot of an ARM resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceHandle {
    /// Where the resource lives
    pub reference: ResourceRef,
    /// `properties.provisioningState`, when reported
    pub provisioning_state: Option<String>,
    /// Full resource body
    pub body: Value,
}

impl ResourceHandle {
    /// Build a handle from an ARM response body
    pub fn from_body(reference: ResourceRef, body: Value) -> Self {
        let provisioning_state = body
            .pointer("/properties/provisioningState")
            .and_then(Value::as_str)
            .map(String::from);
        Self {
            reference,
            provisioning_state,
            body,
        }
    }

    /// String at a JSON pointer into the body
    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.body.pointer(pointer).and_then(Value::as_str)
    }

    /// ARM id reported by the resource
    pub fn id(&self) -> Option<&str> {
        self.str_at("/id")
    }

    /// Resource tags
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.body
            .get("tags")
            .and_then(|tags| tags.get(name))
            .and_then(Value::as_str)
    }
}

/// Direction of an accepted mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationAction {
    /// PUT of a desired state
    CreateOrUpdate,
    /// DELETE
    Delete,
}

/// A mutation ARM accepted and may still be carrying out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    /// Target resource
    pub reference: ResourceRef,
    /// What was requested
    pub action: OperationAction,
}

/// Quota consumption for one counter in one location.
#[derive(Clone, Debug, PartialEq)]
pub struct Usage {
    /// Counter name (e.g. `cores`)
    pub name: String,
    /// Consumed amount
    pub current: f64,
    /// Quota
    pub limit: f64,
}

impl Usage {
    /// `current / limit`; zero when there is no quota
    pub fn ratio(&self) -> f64 {
        if self.limit > 0.0 {
            self.current / self.limit
        } else {
            0.0
        }
    }
}

/// Which provider's quotas to list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageScope {
    /// Microsoft.Compute usages
    Compute,
    /// Microsoft.Network usages
    Network,
}

/// A community gallery image to resolve a version for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GalleryImage {
    /// Public gallery name
    pub gallery: String,
    /// Image definition name
    pub image: String,
    /// Location the gallery is queried in
    pub location: String,
}

/// Cloud resource provisioning API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvisioner: Send + Sync {
    /// Ask for `reference` to match `body`; returns once the request is accepted
    async fn create_or_update(&self, reference: &ResourceRef, body: &Value) -> Result<Operation>;

    /// Current snapshot, or `None` when the resource does not exist
    async fn get(&self, reference: &ResourceRef) -> Result<Option<ResourceHandle>>;

    /// Request deletion; fails with `NotFound` when the resource does not exist
    async fn delete(&self, reference: &ResourceRef) -> Result<Operation>;

    /// List resources of `kind` in a resource group (under `parent` for nested kinds)
    async fn list(
        &self,
        kind: ResourceKind,
        resource_group: &str,
        parent: Option<String>,
    ) -> Result<Vec<ResourceHandle>>;

    /// Quota usage in `location`
    async fn list_usage(&self, scope: UsageScope, location: &str) -> Result<Vec<Usage>>;

    /// Resource groups carrying tag `tag=value`
    async fn list_resource_groups(&self, tag: &str, value: &str) -> Result<Vec<ResourceHandle>>;

    /// POST an action on a resource (e.g. `listClusterUserCredential`)
    async fn invoke(&self, reference: &ResourceRef, action: &str) -> Result<Value>;

    /// Highest version of a gallery image whose name starts with `prefix`
    async fn latest_gallery_image_version(&self, image: &GalleryImage, prefix: &str)
        -> Result<String>;
}

/// Wait for an accepted [`Operation`] to settle.
///
/// Create/update waits for `provisioningState == Succeeded` (`Failed` and
/// `Canceled` abort). Delete waits until the resource is gone.
pub async fn wait_for_operation(
    cloud: &dyn CloudProvisioner,
    operation: &Operation,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<ResourceHandle>> {
    let reference = &operation.reference;
    let spec = PollSpec::new(timeout);
    match operation.action {
        OperationAction::CreateOrUpdate => {
            let description = format!("{} to provision", reference);
            poll_until_ready(&spec, &description, cancel, || async {
                let observed = cloud.get(reference).await?;
                let state = observed.as_ref().and_then(|h| h.provisioning_state.as_deref());
                phase_readiness(
                    &reference.to_string(),
                    state,
                    SUCCEEDED,
                    FATAL_PROVISIONING_STATES,
                )
            })
            .await?;
            let handle = cloud.get(reference).await?;
            info!(resource = %reference, "Resource provisioned");
            Ok(handle)
        }
        OperationAction::Delete => {
            let description = format!("{} to be deleted", reference);
            poll_until_ready(&spec, &description, cancel, || async {
                Ok(match cloud.get(reference).await? {
                    None => Readiness::Ready,
                    Some(handle) => Readiness::not_ready(format!(
                        "still present in state {}",
                        handle.provisioning_state.as_deref().unwrap_or("unknown")
                    )),
                })
            })
            .await?;
            info!(resource = %reference, "Resource deleted");
            Ok(None)
        }
    }
}

/// Create or update a resource and wait until it is provisioned.
///
/// The request itself is retried; the wait aborts when the resource lands in
/// one of the `fatal` provisioning states.
pub async fn ensure(
    cloud: &dyn CloudProvisioner,
    reference: &ResourceRef,
    body: &Value,
    timeout: Duration,
    fatal: &[&str],
    cancel: &CancellationToken,
) -> Result<ResourceHandle> {
    info!(resource = %reference, "Creating or updating");
    retry(
        &RetryPolicy::with_max_attempts(5),
        &format!("create {}", reference),
        cancel,
        || cloud.create_or_update(reference, body),
    )
    .await?;

    let spec = PollSpec::new(timeout).max_interval(Duration::from_secs(30));
    poll_until_ready(&spec, &format!("{} to provision", reference), cancel, || async {
        let state = cloud
            .get(reference)
            .await?
            .and_then(|h| h.provisioning_state);
        phase_readiness(&reference.to_string(), state.as_deref(), SUCCEEDED, fatal)
    })
    .await?;

    let handle = cloud
        .get(reference)
        .await?
        .ok_or_else(|| crate::error::Error::not_found(reference.kind.to_string(), &reference.name))?;
    info!(resource = %reference, "Resource provisioned");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const SUB: &str = "0000-sub";

    fn handle(reference: &ResourceRef, state: &str) -> ResourceHandle {
        ResourceHandle::from_body(
            reference.clone(),
            json!({"properties": {"provisioningState": state}}),
        )
    }

    #[test]
    fn ids_follow_the_arm_layout() {
        assert_eq!(
            ResourceRef::resource_group("ci-bootstrap").id(SUB),
            "/subscriptions/0000-sub/resourceGroups/ci-bootstrap"
        );
        assert_eq!(
            ResourceRef::new(ResourceKind::VirtualMachine, "ci-bootstrap", "k8s-bootstrap").id(SUB),
            "/subscriptions/0000-sub/resourceGroups/ci-bootstrap/providers/Microsoft.Compute/virtualMachines/k8s-bootstrap"
        );
        assert_eq!(
            ResourceRef::nested(
                ResourceKind::Subnet,
                "ci-bootstrap",
                "k8s-bootstrap-vnet",
                "k8s-bootstrap-subnet"
            )
            .id(SUB),
            "/subscriptions/0000-sub/resourceGroups/ci-bootstrap/providers/Microsoft.Network/virtualNetworks/k8s-bootstrap-vnet/subnets/k8s-bootstrap-subnet"
        );
    }

    #[test]
    fn handle_reads_provisioning_state_and_tags() {
        let reference = ResourceRef::resource_group("rg");
        let h = ResourceHandle::from_body(
            reference,
            json!({"id": "/x", "tags": {"ciName": "flannel"}, "properties": {"provisioningState": "Succeeded"}}),
        );
        assert_eq!(h.provisioning_state.as_deref(), Some("Succeeded"));
        assert_eq!(h.tag("ciName"), Some("flannel"));
        assert_eq!(h.id(), Some("/x"));
    }

    #[test]
    fn usage_ratio_handles_zero_limits() {
        let u = Usage {
            name: "cores".into(),
            current: 10.0,
            limit: 0.0,
        };
        assert_eq!(u.ratio(), 0.0);
    }

    // ==========================================================================
    // Story: Accepted operations are converged by polling
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn create_waits_until_succeeded() {
        let reference = ResourceRef::new(ResourceKind::PublicIp, "rg", "ip");
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut cloud = MockCloudProvisioner::new();
        cloud.expect_get().returning(move |r| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            Ok(Some(handle(r, if n < 2 { "Updating" } else { "Succeeded" })))
        });

        let op = Operation {
            reference: reference.clone(),
            action: OperationAction::CreateOrUpdate,
        };
        let h = wait_for_operation(&cloud, &op, Duration::from_secs(600), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.provisioning_state.as_deref(), Some("Succeeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn create_aborts_on_failed_state() {
        let reference = ResourceRef::new(ResourceKind::VirtualMachine, "rg", "vm");
        let mut cloud = MockCloudProvisioner::new();
        cloud
            .expect_get()
            .times(1)
            .returning(|r| Ok(Some(handle(r, "Failed"))));

        let op = Operation {
            reference,
            action: OperationAction::CreateOrUpdate,
        };
        let err = wait_for_operation(&cloud, &op, Duration::from_secs(600), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_until_gone() {
        let reference = ResourceRef::resource_group("rg");
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut cloud = MockCloudProvisioner::new();
        cloud.expect_get().returning(move |r| {
            if c.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(Some(handle(r, "Deleting")))
            } else {
                Ok(None)
            }
        });

        let op = Operation {
            reference,
            action: OperationAction::Delete,
        };
        let out = wait_for_operation(&cloud, &op, Duration::from_secs(600), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn when_the_resource_never_settles_the_wait_times_out() {
        let reference = ResourceRef::resource_group("rg");
        let mut cloud = MockCloudProvisioner::new();
        cloud
            .expect_get()
            .returning(|r| Ok(Some(handle(r, "Accepted"))));

        let op = Operation {
            reference,
            action: OperationAction::CreateOrUpdate,
        };
        let err = wait_for_operation(&cloud, &op, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PollTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_retries_the_request_and_honours_custom_fatal_states() {
        let reference = ResourceRef::new(ResourceKind::VirtualMachine, "rg", "vm");
        let mut cloud = MockCloudProvisioner::new();
        let mut seq = mockall::Sequence::new();
        cloud
            .expect_create_or_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::cloud("create", "throttled")));
        cloud
            .expect_create_or_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|r, _| {
                Ok(Operation {
                    reference: r.clone(),
                    action: OperationAction::CreateOrUpdate,
                })
            });
        cloud
            .expect_get()
            .returning(|r| Ok(Some(handle(r, "Deleting"))));

        let err = ensure(
            &cloud,
            &reference,
            &serde_json::json!({}),
            Duration::from_secs(900),
            &["Failed", "Canceled", "Deleting"],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
