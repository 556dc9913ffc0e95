//! Workload cluster topology
//!
//! Node addresses are unknown until the agent VMs exist, so they are looked
//! up explicitly with [`ClusterTopology::discover`] once the agents are
//! ready. The result is a plain value the rest of the run reads.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterApi, Endpoint, NodeStatus};
use crate::error::Result;
use crate::poll::{poll_until_ready, PollSpec, Readiness};
use crate::remote::RemoteTarget;
use crate::retry::{retry, RetryPolicy};

/// Operating system label value of Linux nodes
pub const LINUX: &str = "linux";
/// Operating system label value of Windows nodes
pub const WINDOWS: &str = "windows";

/// Budget for every expected Windows node to publish an internal address
pub const ADDRESSES_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Addresses of a running workload cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    /// Public API server endpoint, also the ssh bastion
    pub control_plane: Endpoint,
    /// Internal addresses of Linux nodes
    pub linux_nodes: Vec<String>,
    /// Internal addresses of Windows nodes
    pub windows_nodes: Vec<String>,
}

impl ClusterTopology {
    /// Query node addresses from the cluster
    pub async fn discover(
        api: &dyn ClusterApi,
        control_plane: Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let nodes = retry(
            &RetryPolicy::with_max_attempts(5),
            "discover cluster topology",
            cancel,
            || api.list_nodes(),
        )
        .await?;
        let topology = Self::from_nodes(control_plane, &nodes);
        info!(
            control_plane = %topology.control_plane,
            linux = ?topology.linux_nodes,
            windows = ?topology.windows_nodes,
            "Discovered cluster topology"
        );
        Ok(topology)
    }

    /// Query node addresses, waiting until at least `windows_expected`
    /// Windows nodes have an internal address
    pub async fn discover_windows(
        api: &dyn ClusterApi,
        control_plane: Endpoint,
        windows_expected: usize,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let latest = Mutex::new(None);
        let spec = PollSpec::new(ADDRESSES_TIMEOUT).fixed_interval(Duration::from_secs(10));
        poll_until_ready(&spec, "Windows node addresses", cancel, || async {
            let nodes = api.list_nodes().await?;
            let topology = Self::from_nodes(control_plane.clone(), &nodes);
            let found = topology.windows_nodes.len();
            if let Ok(mut latest) = latest.lock() {
                *latest = Some(topology);
            }
            Ok(if found >= windows_expected {
                Readiness::Ready
            } else {
                Readiness::not_ready(format!(
                    "{} of {} Windows nodes have an internal address",
                    found, windows_expected
                ))
            })
        })
        .await?;

        let topology = latest
            .into_inner()
            .ok()
            .flatten()
            .unwrap_or_else(|| Self::from_nodes(control_plane, &[]));
        info!(
            control_plane = %topology.control_plane,
            linux = ?topology.linux_nodes,
            windows = ?topology.windows_nodes,
            "Discovered cluster topology"
        );
        Ok(topology)
    }

    /// Build a topology from node snapshots
    pub fn from_nodes(control_plane: Endpoint, nodes: &[NodeStatus]) -> Self {
        let addresses = |os: &str| -> Vec<String> {
            nodes
                .iter()
                .filter(|n| n.os == os)
                .filter_map(|n| {
                    if n.internal_ip.is_none() {
                        warn!(node = %n.name, "Cannot find private address for node, skipping");
                    }
                    n.internal_ip.clone()
                })
                .collect()
        };
        Self {
            linux_nodes: addresses(LINUX),
            windows_nodes: addresses(WINDOWS),
            control_plane,
        }
    }

    /// Every node address, Windows first
    pub fn all_nodes(&self) -> Vec<String> {
        self.windows_nodes
            .iter()
            .chain(&self.linux_nodes)
            .cloned()
            .collect()
    }
}

/// Builds ssh targets for the nodes of one cluster.
#[derive(Clone, Debug)]
pub struct NodeAccess {
    /// Login user on every node
    pub user: String,
    /// Private key accepted by every node
    pub key_path: PathBuf,
    /// Host reachable from the runner
    pub bastion: String,
}

impl NodeAccess {
    /// Access through the control plane of `topology`
    pub fn new(topology: &ClusterTopology, user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            bastion: topology.control_plane.host.clone(),
        }
    }

    /// The control-plane host itself
    pub fn bastion(&self) -> RemoteTarget {
        RemoteTarget::new(&self.bastion, &self.user).with_key(&self.key_path)
    }

    /// A private node, reached through the bastion
    pub fn node(&self, address: &str) -> RemoteTarget {
        RemoteTarget::new(address, &self.user)
            .with_key(&self.key_path)
            .via(self.bastion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::error::Error;

    fn node(name: &str, os: &str, ip: Option<&str>) -> NodeStatus {
        NodeStatus {
            name: name.to_string(),
            os: os.to_string(),
            internal_ip: ip.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn nodes_are_grouped_by_operating_system() {
        let topology = ClusterTopology::from_nodes(
            Endpoint::new("20.30.40.50", 6443),
            &[
                node("capz-control-plane-0", "linux", Some("10.0.0.4")),
                node("capz-md-win-a", "windows", Some("10.1.0.4")),
                node("capz-md-win-b", "windows", Some("10.1.0.5")),
            ],
        );
        assert_eq!(topology.linux_nodes, vec!["10.0.0.4"]);
        assert_eq!(topology.windows_nodes, vec!["10.1.0.4", "10.1.0.5"]);
        assert_eq!(topology.all_nodes(), vec!["10.1.0.4", "10.1.0.5", "10.0.0.4"]);
    }

    #[test]
    fn nodes_without_an_internal_address_are_skipped() {
        let topology = ClusterTopology::from_nodes(
            Endpoint::new("20.30.40.50", 6443),
            &[node("capz-md-win-a", "windows", None)],
        );
        assert!(topology.windows_nodes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_retries_transient_list_failures() {
        let mut api = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_list_nodes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(Error::control_plane("list_nodes", "connection reset")));
        api.expect_list_nodes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![node("capz-md-win-a", "windows", Some("10.1.0.4"))]));

        let topology = ClusterTopology::discover(
            &api,
            Endpoint::new("20.30.40.50", 6443),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(topology.windows_nodes, vec!["10.1.0.4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn when_a_windows_node_has_no_address_yet_discovery_waits_for_it() {
        let mut api = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_list_nodes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(vec![
                    node("capz-md-win-a", "windows", Some("10.1.0.4")),
                    node("capz-md-win-b", "windows", None),
                ])
            });
        api.expect_list_nodes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(vec![
                    node("capz-md-win-a", "windows", Some("10.1.0.4")),
                    node("capz-md-win-b", "windows", Some("10.1.0.5")),
                ])
            });

        let topology = ClusterTopology::discover_windows(
            &api,
            Endpoint::new("20.30.40.50", 6443),
            2,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(topology.windows_nodes, vec!["10.1.0.4", "10.1.0.5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn when_windows_nodes_never_get_addresses_discovery_times_out() {
        let mut api = MockClusterApi::new();
        api.expect_list_nodes()
            .returning(|| Ok(vec![node("capz-control-plane-0", "linux", Some("10.0.0.4"))]));

        let err = ClusterTopology::discover_windows(
            &api,
            Endpoint::new("20.30.40.50", 6443),
            2,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PollTimeout);
    }

    #[test]
    fn private_nodes_are_reached_through_the_control_plane() {
        let topology = ClusterTopology::from_nodes(Endpoint::new("20.30.40.50", 6443), &[]);
        let access = NodeAccess::new(&topology, "capi", "/tmp/id_rsa");
        let target = access.node("10.1.0.4");
        assert_eq!(target.address, "10.1.0.4");
        assert_eq!(
            target.proxy_via.as_deref().map(|b| b.address.as_str()),
            Some("20.30.40.50")
        );
    }
}
