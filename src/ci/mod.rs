//! CI variants and the run sequence shared by all of them
//!
//! A variant knows how to build, bring up, test and tear down one kind of
//! cluster. [`Orchestrator`] runs the variant's steps in a fixed order and is
//! the only place where a failure turns into the shutdown sequence.

pub mod aks;
pub mod capz_flannel;
pub mod conformance;

use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Name of the run metadata file in the artifacts directory
pub const METADATA_FILE: &str = "metadata.json";

/// One kind of CI cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CiVariant: Send + Sync {
    /// Variant name, as given on the command line
    fn name(&self) -> &'static str;

    /// Build the requested components from source
    async fn build(&mut self) -> Result<()>;

    /// Create the cluster
    async fn up(&mut self) -> Result<()>;

    /// Reuse a running cluster
    async fn reclaim(&mut self) -> Result<()>;

    /// Install Windows patches on every Windows node
    async fn install_patches(&mut self) -> Result<()>;

    /// Run the conformance suite
    async fn test(&mut self) -> Result<()>;

    /// Collect node and bootstrap logs; never fails the run
    async fn collect_logs(&mut self);

    /// Delete every cloud resource of the run
    async fn down(&mut self) -> Result<()>;
}

/// Which steps a run performs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Steps {
    pub up: bool,
    pub install_patches: bool,
    pub test: bool,
    pub down: bool,
    /// Skip `down` when the run failed
    pub retain_on_failure: bool,
}

/// `metadata.json` contents
#[derive(Debug, Serialize)]
struct Metadata<'a> {
    #[serde(rename = "job-version")]
    job_version: &'a str,
    revision: &'a str,
}

/// Record the deployed Kubernetes version for the CI dashboard
pub fn write_metadata(artifacts_dir: &Path, kubernetes_version: &str) -> Result<()> {
    let metadata = Metadata {
        job_version: kubernetes_version,
        revision: kubernetes_version,
    };
    std::fs::create_dir_all(artifacts_dir)?;
    std::fs::write(
        artifacts_dir.join(METADATA_FILE),
        serde_json::to_string(&metadata)?,
    )?;
    Ok(())
}

/// Stop waiting on `step` once the run is interrupted
async fn interruptible<T>(
    interrupt: &CancellationToken,
    step: &str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = interrupt.cancelled() => Err(Error::cancelled(step)),
        outcome = work => outcome,
    }
}

/// Runs a variant's steps in order.
pub struct Orchestrator {
    variant: Box<dyn CiVariant>,
    steps: Steps,
    interrupt: CancellationToken,
}

impl Orchestrator {
    /// `interrupt` stops the main sequence; cleanup steps run regardless
    pub fn new(variant: Box<dyn CiVariant>, steps: Steps, interrupt: CancellationToken) -> Self {
        Self {
            variant,
            steps,
            interrupt,
        }
    }

    /// Run the sequence and return its first error
    pub async fn run(mut self) -> Result<()> {
        info!(ci = self.variant.name(), "Starting CI run");
        let outcome = self.run_steps().await;
        if let Err(e) = &outcome {
            error!(ci = self.variant.name(), error = %e, "CI run failed");
        }

        self.variant.collect_logs().await;

        if !self.steps.down {
            return outcome;
        }
        if outcome.is_err() && self.steps.retain_on_failure {
            warn!("Retaining the cluster of the failed run");
            return outcome;
        }
        match (outcome, self.variant.down().await) {
            (Err(e), Err(down)) => {
                error!(error = %down, "Failed to tear the cluster down");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), down) => down,
        }
    }

    async fn run_steps(&mut self) -> Result<()> {
        let interrupt = self.interrupt.clone();
        interruptible(&interrupt, "build", self.variant.build()).await?;
        if self.steps.up {
            interruptible(&interrupt, "up", self.variant.up()).await?;
        } else {
            interruptible(&interrupt, "reclaim", self.variant.reclaim()).await?;
        }
        if self.steps.install_patches {
            interruptible(&interrupt, "install patches", self.variant.install_patches()).await?;
        }
        if self.steps.test {
            interruptible(&interrupt, "test", self.variant.test()).await?;
        }
        Ok(())
    }
}
