//! Resource names derived from the cluster name

use crate::cloud::{ResourceKind, ResourceRef};

/// Bootstrap VM name
pub const BOOTSTRAP_VM: &str = "k8s-bootstrap";
pub const BOOTSTRAP_VNET: &str = "k8s-bootstrap-vnet";
pub const BOOTSTRAP_SUBNET: &str = "k8s-bootstrap-subnet";
pub const BOOTSTRAP_NSG: &str = "k8s-bootstrap-nsg";
pub const BOOTSTRAP_NIC: &str = "k8s-bootstrap-nic";
pub const BOOTSTRAP_PUBLIC_IP: &str = "k8s-bootstrap-public-ip";
/// Namespace the CAPZ cluster objects are created in
pub const CAPI_NAMESPACE: &str = "default";

/// Every external name used for one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    cluster: String,
}

impl ResourceNames {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Resource group holding the bootstrap VM and its network
    pub fn bootstrap_resource_group(&self) -> String {
        format!("{}-bootstrap", self.cluster)
    }

    /// Resource group CAPZ (or AKS) creates the cluster in
    pub fn workload_resource_group(&self) -> String {
        self.cluster.clone()
    }

    /// Node resource group of an AKS cluster
    pub fn aks_node_resource_group(&self) -> String {
        format!("{}-node-rg", self.cluster)
    }

    /// Machine deployment of the Windows agents
    pub fn windows_deployment(&self) -> String {
        format!("{}-md-win", self.cluster)
    }

    pub fn bootstrap_vm(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::VirtualMachine,
            self.bootstrap_resource_group(),
            BOOTSTRAP_VM,
        )
    }

    pub fn bootstrap_vnet(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::VirtualNetwork,
            self.bootstrap_resource_group(),
            BOOTSTRAP_VNET,
        )
    }

    pub fn bootstrap_subnet(&self) -> ResourceRef {
        ResourceRef::nested(
            ResourceKind::Subnet,
            self.bootstrap_resource_group(),
            BOOTSTRAP_VNET,
            BOOTSTRAP_SUBNET,
        )
    }

    pub fn bootstrap_nsg(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::NetworkSecurityGroup,
            self.bootstrap_resource_group(),
            BOOTSTRAP_NSG,
        )
    }

    pub fn bootstrap_nic(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::NetworkInterface,
            self.bootstrap_resource_group(),
            BOOTSTRAP_NIC,
        )
    }

    pub fn bootstrap_public_ip(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::PublicIp,
            self.bootstrap_resource_group(),
            BOOTSTRAP_PUBLIC_IP,
        )
    }

    /// AKS managed cluster, named after the cluster in its own group
    pub fn managed_cluster(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::ManagedCluster,
            self.workload_resource_group(),
            &self.cluster,
        )
    }
}
