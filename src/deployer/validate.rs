//! Post-deployment validation
//!
//! Checks are exact: a node running `v1.27.1` when `v1.27.0` was requested
//! fails the run. Validation errors are terminal for every retry policy.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::{ClusterApi, NodeStatus};
use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};
use crate::topology::LINUX;

/// Prefix of the upstream control-plane images
const UPSTREAM_IMAGE_PREFIX: &str = "registry.k8s.io/kube-";

/// Image tag of a Kubernetes version (`+` is not valid in tags)
pub fn image_tag(version: &str) -> String {
    version.replace('+', "_")
}

/// Every node runs exactly `expected` kubelet and, when reported, kube-proxy
pub fn check_versions(nodes: &[NodeStatus], expected: &str) -> Result<()> {
    for node in nodes {
        if node.kubelet_version != expected {
            return Err(Error::VersionMismatch {
                node: node.name.clone(),
                component: "kubelet".to_string(),
                expected: expected.to_string(),
                found: node.kubelet_version.clone(),
            });
        }
        if !node.kube_proxy_version.is_empty() && node.kube_proxy_version != expected {
            return Err(Error::VersionMismatch {
                node: node.name.clone(),
                component: "kube-proxy".to_string(),
                expected: expected.to_string(),
                found: node.kube_proxy_version.clone(),
            });
        }
    }
    Ok(())
}

/// Linux nodes only carry control-plane images tagged with the built version
pub fn check_ci_images(nodes: &[NodeStatus], version: &str) -> Result<()> {
    let tag = image_tag(version);
    for node in nodes.iter().filter(|n| n.os == LINUX) {
        let foreign: Vec<String> = node
            .images
            .iter()
            .filter(|image| image.starts_with(UPSTREAM_IMAGE_PREFIX))
            .filter(|image| match image.rsplit_once(':') {
                Some((_, image_tag)) => image_tag != tag,
                None => true,
            })
            .cloned()
            .collect();
        if !foreign.is_empty() {
            return Err(Error::NonCiImage {
                node: node.name.clone(),
                images: foreign,
            });
        }
    }
    Ok(())
}

/// Validate the running cluster against the expected version.
///
/// `ci_images` enables the image check, for clusters built from source.
pub async fn validate_cluster(
    api: &dyn ClusterApi,
    expected: &str,
    ci_images: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(expected = %expected, "Validating node versions");
    let nodes = retry(
        &RetryPolicy::with_max_attempts(5),
        "list nodes for validation",
        cancel,
        || api.list_nodes(),
    )
    .await?;
    check_versions(&nodes, expected)?;
    if ci_images {
        check_ci_images(&nodes, expected)?;
    }
    info!(nodes = nodes.len(), "Cluster validated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::error::ErrorKind;

    fn node(name: &str, os: &str, kubelet: &str, proxy: &str) -> NodeStatus {
        NodeStatus {
            name: name.to_string(),
            os: os.to_string(),
            kubelet_version: kubelet.to_string(),
            kube_proxy_version: proxy.to_string(),
            ready: true,
            ..Default::default()
        }
    }

    #[test]
    fn when_kubelet_differs_the_mismatch_names_node_and_versions() {
        let nodes = [
            node("capz-cp-0", "linux", "v1.27.0", "v1.27.0"),
            node("capz-win-a", "windows", "v1.27.1", ""),
        ];
        let err = check_versions(&nodes, "v1.27.0").unwrap_err();
        match &err {
            Error::VersionMismatch {
                node,
                component,
                expected,
                found,
            } => {
                assert_eq!(node, "capz-win-a");
                assert_eq!(component, "kubelet");
                assert_eq!(expected, "v1.27.0");
                assert_eq!(found, "v1.27.1");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_validation_failure());
    }

    #[test]
    fn empty_kube_proxy_version_is_not_checked() {
        let nodes = [node("capz-win-a", "windows", "v1.27.0", "")];
        assert!(check_versions(&nodes, "v1.27.0").is_ok());
    }

    #[test]
    fn kube_proxy_mismatch_is_reported() {
        let nodes = [node("capz-win-a", "windows", "v1.27.0", "v1.26.3")];
        let err = check_versions(&nodes, "v1.27.0").unwrap_err();
        assert!(err.to_string().contains("kube-proxy"));
    }

    #[test]
    fn upstream_images_with_another_tag_are_rejected_on_linux_only() {
        let version = "v1.30.0-alpha.1+abc";
        let mut linux = node("capz-cp-0", "linux", version, version);
        linux.images = vec![
            "registry.k8s.io/kube-apiserver:v1.30.0-alpha.1_abc".to_string(),
            "registry.k8s.io/kube-proxy:v1.28.4".to_string(),
            "registry.k8s.io/pause:3.9".to_string(),
        ];
        let mut windows = node("capz-win-a", "windows", version, "");
        windows.images = vec!["registry.k8s.io/kube-proxy:v1.28.4".to_string()];

        let err = check_ci_images(&[windows.clone()], version);
        assert!(err.is_ok());
        let err = check_ci_images(&[windows, linux], version).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonCiImage);
        assert!(err.to_string().contains("kube-proxy:v1.28.4"));
    }

    #[tokio::test]
    async fn validation_is_never_retried() {
        let mut api = MockClusterApi::new();
        api.expect_list_nodes()
            .times(1)
            .returning(|| Ok(vec![node("capz-win-a", "windows", "v1.27.1", "")]));
        let err = validate_cluster(&api, "v1.27.0", false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }
}
