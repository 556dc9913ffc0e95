//! Deletes resource groups leaked by CI runs
//!
//! Every resource group the runner creates carries the CI tags. A group is
//! reaped once the Prow job that created it is gone or no longer pending, or
//! once it is older than the maximum age.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::cloud::resource_group::{delete_resource_group, ResourceGroupTags, BUILD_ID_TAG};
use crate::cloud::{CloudProvisioner, ResourceHandle};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};

/// Label Prow puts on a job with its build id
pub const BUILD_ID_LABEL: &str = "prow.k8s.io/build-id";
/// State of a Prow job that is still running
pub const PENDING: &str = "pending";

const PROW_NAMESPACE: &str = "default";

/// Prow job lookup.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProwJobs: Send + Sync {
    /// `status.state` of the job with `build_id`, `None` when no such job exists
    async fn state(&self, build_id: &str) -> Result<Option<String>>;
}

/// State of the first job of a `kubectl get prowjob -o json` listing
pub fn prow_job_state(listing: &str) -> Result<Option<String>> {
    let listing: Value = serde_json::from_str(listing)?;
    Ok(listing
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .map(|job| {
            job.pointer("/status/state")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        }))
}

/// [`ProwJobs`] backed by `kubectl` against the Prow cluster.
pub struct KubectlProwJobs {
    kubectl: String,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl KubectlProwJobs {
    pub fn new(
        kubectl: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kubectl: kubectl.into(),
            runner,
            cancel,
        }
    }
}

#[async_trait]
impl ProwJobs for KubectlProwJobs {
    async fn state(&self, build_id: &str) -> Result<Option<String>> {
        let spec = CommandSpec::new(&self.kubectl).args([
            "get".to_string(),
            "prowjob".to_string(),
            "-n".to_string(),
            PROW_NAMESPACE.to_string(),
            "-o".to_string(),
            "json".to_string(),
            "-l".to_string(),
            format!("{}={}", BUILD_ID_LABEL, build_id),
        ]);
        let output = self.runner.run(&spec, &self.cancel).await?.check(&spec)?;
        prow_job_state(&output.stdout)
    }
}

/// Which groups to consider and when to delete them.
#[derive(Clone, Debug)]
pub struct ReapPolicy {
    pub tag_name: String,
    pub tag_value: String,
    pub max_age: Duration,
    /// Only report what would be deleted
    pub dry_run: bool,
}

/// Why a group is deleted or kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The job that created the group has finished
    JobFinished,
    /// The group is older than the maximum age
    Expired,
    Keep,
}

/// Finds and deletes leaked resource groups.
pub struct Reaper {
    cloud: Arc<dyn CloudProvisioner>,
    jobs: Arc<dyn ProwJobs>,
    policy: ReapPolicy,
    cancel: CancellationToken,
}

impl Reaper {
    pub fn new(
        cloud: Arc<dyn CloudProvisioner>,
        jobs: Arc<dyn ProwJobs>,
        policy: ReapPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cloud,
            jobs,
            policy,
            cancel,
        }
    }

    async fn job_finished(&self, group: &ResourceHandle) -> Result<bool> {
        let Some(build_id) = group.tag(BUILD_ID_TAG) else {
            warn!(resource_group = %group.reference.name, "Resource group has no build id tag");
            return Ok(false);
        };
        Ok(match self.jobs.state(build_id).await? {
            None => {
                info!(build_id, "The Prow job does not exist anymore");
                true
            }
            Some(state) if state != PENDING => {
                info!(build_id, state = %state, "The Prow job is not running anymore");
                true
            }
            Some(_) => false,
        })
    }

    fn expired(&self, group: &ResourceHandle, now: DateTime<Utc>) -> bool {
        let Some(created) = ResourceGroupTags::creation_time(group) else {
            warn!(resource_group = %group.reference.name, "Resource group has no creation timestamp tag");
            return false;
        };
        let age = now - created;
        if age > self.policy.max_age {
            info!(age_minutes = age.num_minutes(), "Resource group is older than the maximum age");
            true
        } else {
            false
        }
    }

    /// Decide the fate of one group
    pub async fn verdict(&self, group: &ResourceHandle, now: DateTime<Utc>) -> Result<Verdict> {
        if self.job_finished(group).await? {
            return Ok(Verdict::JobFinished);
        }
        if self.expired(group, now) {
            return Ok(Verdict::Expired);
        }
        Ok(Verdict::Keep)
    }

    /// Reap every tagged group and return the names deleted (or, on a dry
    /// run, the names that would be)
    pub async fn run(&self) -> Result<Vec<String>> {
        info!(
            tag = %self.policy.tag_name,
            value = %self.policy.tag_value,
            "Listing CI resource groups"
        );
        let groups = self
            .cloud
            .list_resource_groups(&self.policy.tag_name, &self.policy.tag_value)
            .await?;

        let now = Utc::now();
        let mut reaped = Vec::new();
        let mut failures = 0;
        for group in &groups {
            let name = &group.reference.name;
            info!(resource_group = %name, "Found resource group");
            match self.verdict(group, now).await {
                Ok(Verdict::Keep) => {}
                Ok(_) if self.policy.dry_run => {
                    info!(resource_group = %name, "Dry run: the resource group would be deleted");
                    reaped.push(name.clone());
                }
                Ok(_) => {
                    match delete_resource_group(self.cloud.as_ref(), name, false, &self.cancel).await {
                        Ok(()) => reaped.push(name.clone()),
                        Err(e) => {
                            warn!(resource_group = %name, error = %e, "Failed to delete resource group");
                            failures += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(resource_group = %name, error = %e, "Cannot decide whether to reap resource group");
                    failures += 1;
                }
            }
        }

        info!(found = groups.len(), reaped = reaped.len(), "Reaping finished");
        if failures > 0 {
            return Err(Error::cloud(
                "reap resource groups",
                format!("{} resource groups could not be reaped", failures),
            ));
        }
        Ok(reaped)
    }
}
