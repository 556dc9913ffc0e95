//! Resource group lifecycle, tagging and location selection

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    wait_for_operation, CloudProvisioner, ResourceHandle, ResourceRef, UsageScope, SUCCEEDED,
};
use crate::error::{Error, ErrorKind, Result};
use crate::poll::{phase_readiness, poll_until_ready, PollSpec};
use crate::retry::{retry, RetryPolicy};

/// Tag every CI resource group carries, used by the reaper to find them
pub const CI_NAME_TAG: &str = "ciName";
/// Value of [`CI_NAME_TAG`] for this runner
pub const CI_NAME: &str = "k8s-sig-win-networking-prow-flannel-e2e";
/// Tag holding the creation time
pub const CREATION_TIMESTAMP_TAG: &str = "creationTimestamp";
/// Tag holding the Prow build id
pub const BUILD_ID_TAG: &str = "buildID";
/// Tag holding the Prow job name
pub const JOB_NAME_TAG: &str = "jobName";

const DO_NOT_DELETE_TAG: &str = "DO-NOT-DELETE";
const DO_NOT_DELETE_VALUE: &str = "RG spawned by the k8s-sig-win-networking CI";

/// Locations considered when picking the least used one
pub const AZURE_LOCATIONS: &[&str] = &[
    "canadacentral",
    "centralus",
    "eastus",
    "eastus2",
    "northeurope",
    "southcentralus",
    "uksouth",
    "westeurope",
    "westus2",
];

/// Compute quotas that bound a run
pub const COMPUTE_QUOTAS: &[&str] = &[
    "virtualMachines",
    "cores",
    "standardDSv3Family",
    "PremiumDiskCount",
];

/// Network quotas that bound a run
pub const NETWORK_QUOTAS: &[&str] = &[
    "VirtualNetworks",
    "NetworkInterfaces",
    "NetworkSecurityGroups",
    "LoadBalancers",
    "PublicIPAddresses",
    "RouteTables",
];

const CREATE_TIMEOUT: Duration = Duration::from_secs(600);
const DELETE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Tags identifying a resource group as created by this CI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceGroupTags {
    /// Creation time
    pub creation_timestamp: DateTime<Utc>,
    /// Prow build id, when running under Prow
    pub build_id: Option<String>,
    /// Prow job name, when running under Prow
    pub job_name: Option<String>,
}

impl ResourceGroupTags {
    /// Tags stamped with the current time
    pub fn new(build_id: Option<String>, job_name: Option<String>) -> Self {
        Self {
            creation_timestamp: Utc::now(),
            build_id: build_id.filter(|s| !s.is_empty()),
            job_name: job_name.filter(|s| !s.is_empty()),
        }
    }

    /// Tags as the flat map ARM expects
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(
            CREATION_TIMESTAMP_TAG.to_string(),
            self.creation_timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        tags.insert(CI_NAME_TAG.to_string(), CI_NAME.to_string());
        tags.insert(DO_NOT_DELETE_TAG.to_string(), DO_NOT_DELETE_VALUE.to_string());
        if let Some(build_id) = &self.build_id {
            tags.insert(BUILD_ID_TAG.to_string(), build_id.clone());
        }
        if let Some(job_name) = &self.job_name {
            tags.insert(JOB_NAME_TAG.to_string(), job_name.clone());
        }
        tags
    }

    /// Parse the creation timestamp tag of an existing group
    pub fn creation_time(handle: &ResourceHandle) -> Option<DateTime<Utc>> {
        let raw = handle.tag(CREATION_TIMESTAMP_TAG)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                // naive ISO timestamps written without an offset are UTC
                chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|t| t.and_utc())
            })
    }
}

/// Create a resource group and wait until it reports `Succeeded`.
pub async fn create_resource_group(
    cloud: &dyn CloudProvisioner,
    name: &str,
    location: &str,
    tags: &ResourceGroupTags,
    cancel: &CancellationToken,
) -> Result<ResourceHandle> {
    info!(resource_group = %name, location = %location, "Creating resource group");
    let reference = ResourceRef::resource_group(name);
    let body = resource_group_body(location, tags);

    retry(
        &RetryPolicy::with_max_attempts(5),
        "create_resource_group",
        cancel,
        || cloud.create_or_update(&reference, &body),
    )
    .await?;

    let spec = PollSpec::new(CREATE_TIMEOUT).max_interval(Duration::from_secs(30));
    poll_until_ready(
        &spec,
        &format!("resource group {}", name),
        cancel,
        || async {
            let state = cloud
                .get(&reference)
                .await?
                .and_then(|rg| rg.provisioning_state);
            phase_readiness(&reference.to_string(), state.as_deref(), SUCCEEDED, &[])
        },
    )
    .await?;

    cloud
        .get(&reference)
        .await?
        .ok_or_else(|| Error::not_found("resource group", name))
}

/// Delete a resource group. A group that does not exist is already deleted.
pub async fn delete_resource_group(
    cloud: &dyn CloudProvisioner,
    name: &str,
    wait: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(resource_group = %name, wait, "Deleting resource group");
    let reference = ResourceRef::resource_group(name);

    let accepted = retry(
        &RetryPolicy::with_max_attempts(5).terminal_on([ErrorKind::NotFound]),
        "delete_resource_group",
        cancel,
        || cloud.delete(&reference),
    )
    .await;

    let operation = match accepted {
        Ok(operation) => operation,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(resource_group = %name, "Resource group does not exist");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if wait {
        wait_for_operation(cloud, &operation, DELETE_TIMEOUT, cancel).await?;
    }
    Ok(())
}

/// Pick the location whose most consumed quota is the least consumed.
///
/// For each location the score is the highest `current / limit` across the
/// tracked compute and network counters; the lowest score wins, ties going
/// to the earlier entry of `locations`.
pub async fn least_used_location(
    cloud: &dyn CloudProvisioner,
    locations: &[&str],
    cancel: &CancellationToken,
) -> Result<String> {
    info!("Determining the least used Azure location");
    let policy = RetryPolicy::with_max_attempts(5);
    let mut best: Option<(f64, &str)> = None;

    for &location in locations {
        let mut score = 0.0_f64;
        for (scope, tracked) in [
            (UsageScope::Compute, COMPUTE_QUOTAS),
            (UsageScope::Network, NETWORK_QUOTAS),
        ] {
            let usages = retry(&policy, "list_usage", cancel, || {
                cloud.list_usage(scope, location)
            })
            .await?;
            score = usages
                .iter()
                .filter(|u| tracked.contains(&u.name.as_str()))
                .map(|u| u.ratio())
                .fold(score, f64::max);
        }
        info!(location = %location, usage = score, "Location quota usage");
        if best.map_or(true, |(best_score, _)| score < best_score) {
            best = Some((score, location));
        }
    }

    best.map(|(_, location)| location.to_string())
        .ok_or_else(|| Error::configuration("no Azure locations to choose from"))
}

/// Resource group body used by callers that need the raw request
pub fn resource_group_body(location: &str, tags: &ResourceGroupTags) -> Value {
    json!({ "location": location, "tags": tags.to_map() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockCloudProvisioner, Operation, OperationAction, Usage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn rg_handle(name: &str, state: &str) -> ResourceHandle {
        ResourceHandle::from_body(
            ResourceRef::resource_group(name),
            json!({"name": name, "properties": {"provisioningState": state}}),
        )
    }

    // ==========================================================================
    // Story: Deleting a resource group is idempotent
    // ==========================================================================

    #[tokio::test]
    async fn when_group_is_missing_delete_succeeds_first_and_every_time_after() {
        let mut cloud = MockCloudProvisioner::new();
        cloud
            .expect_delete()
            .times(2)
            .returning(|r| Err(Error::not_found("resource group", &r.name)));
        let cancel = CancellationToken::new();

        delete_resource_group(&cloud, "ci-bootstrap", true, &cancel)
            .await
            .unwrap();
        delete_resource_group(&cloud, "ci-bootstrap", true, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn when_waiting_delete_polls_until_the_group_is_gone() {
        let mut cloud = MockCloudProvisioner::new();
        cloud.expect_delete().times(1).returning(|r| {
            Ok(Operation {
                reference: r.clone(),
                action: OperationAction::Delete,
            })
        });
        let gets = Arc::new(AtomicU32::new(0));
        let g = gets.clone();
        cloud.expect_get().returning(move |_| {
            if g.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(Some(rg_handle("ci", "Deleting")))
            } else {
                Ok(None)
            }
        });

        delete_resource_group(&cloud, "ci", true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(gets.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn without_wait_delete_returns_once_accepted() {
        let mut cloud = MockCloudProvisioner::new();
        cloud.expect_delete().times(1).returning(|r| {
            Ok(Operation {
                reference: r.clone(),
                action: OperationAction::Delete,
            })
        });
        cloud.expect_get().never();

        delete_resource_group(&cloud, "ci", false, &CancellationToken::new())
            .await
            .unwrap();
    }

    // ==========================================================================
    // Story: Creating a resource group waits for Succeeded
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn create_polls_provisioning_state() {
        let mut cloud = MockCloudProvisioner::new();
        cloud
            .expect_create_or_update()
            .withf(|r, body| r.name == "ci" && body["tags"]["ciName"] == CI_NAME)
            .times(1)
            .returning(|r, _| {
                Ok(Operation {
                    reference: r.clone(),
                    action: OperationAction::CreateOrUpdate,
                })
            });
        let gets = Arc::new(AtomicU32::new(0));
        let g = gets.clone();
        cloud.expect_get().returning(move |_| {
            let state = if g.fetch_add(1, Ordering::SeqCst) < 1 {
                "Accepted"
            } else {
                "Succeeded"
            };
            Ok(Some(rg_handle("ci", state)))
        });

        let tags = ResourceGroupTags::new(Some("123".into()), None);
        let rg = create_resource_group(&cloud, "ci", "eastus", &tags, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rg.provisioning_state.as_deref(), Some("Succeeded"));
    }

    // ==========================================================================
    // Story: Tags identify CI-owned groups
    // ==========================================================================

    #[test]
    fn tags_include_ci_identity_and_optional_prow_metadata() {
        let tags = ResourceGroupTags::new(Some("8812".into()), Some(String::new())).to_map();
        assert_eq!(tags.get(CI_NAME_TAG).map(String::as_str), Some(CI_NAME));
        assert_eq!(tags.get(BUILD_ID_TAG).map(String::as_str), Some("8812"));
        assert!(!tags.contains_key(JOB_NAME_TAG));
        assert!(tags.contains_key(DO_NOT_DELETE_TAG));
    }

    #[test]
    fn creation_time_round_trips_through_the_tag() {
        let tags = ResourceGroupTags::new(None, None);
        let handle = ResourceHandle::from_body(
            ResourceRef::resource_group("ci"),
            json!({"tags": tags.to_map()}),
        );
        let parsed = ResourceGroupTags::creation_time(&handle).unwrap();
        assert_eq!(
            parsed.timestamp_micros(),
            tags.creation_timestamp.timestamp_micros()
        );
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let handle = ResourceHandle::from_body(
            ResourceRef::resource_group("ci"),
            json!({"tags": {"creationTimestamp": "2024-03-01T10:00:00.123456"}}),
        );
        let parsed = ResourceGroupTags::creation_time(&handle).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T10:00:00.123456+00:00");
    }

    // ==========================================================================
    // Story: The least used location is chosen by its busiest quota
    // ==========================================================================

    #[tokio::test]
    async fn least_used_location_minimises_the_maximum_ratio() {
        let mut cloud = MockCloudProvisioner::new();
        cloud.expect_list_usage().returning(|scope, location| {
            let (name, current) = match (scope, location) {
                (UsageScope::Compute, "eastus") => ("cores", 90.0),
                (UsageScope::Compute, _) => ("cores", 10.0),
                (UsageScope::Network, "westus2") => ("PublicIPAddresses", 80.0),
                (UsageScope::Network, _) => ("PublicIPAddresses", 20.0),
            };
            Ok(vec![
                Usage {
                    name: name.to_string(),
                    current,
                    limit: 100.0,
                },
                Usage {
                    name: "untracked".to_string(),
                    current: 100.0,
                    limit: 100.0,
                },
            ])
        });

        let location = least_used_location(
            &cloud,
            &["eastus", "westus2", "uksouth"],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(location, "uksouth");
    }
}
