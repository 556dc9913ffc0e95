//! AKS managed clusters
//!
//! Nothing is built and the nodes are not reachable over ssh, so the variant
//! only creates the cluster, tests it and deletes it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::conformance::{run_conformance, ConformanceOptions};
use super::{write_metadata, CiVariant};
use crate::builder::BuildManifest;
use crate::cloud::resource_group::{least_used_location, AZURE_LOCATIONS};
use crate::cluster::ClusterApi;
use crate::config::{AksArgs, RunArgs};
use crate::deployer::aks::{AksDeployer, LINUX_POOL_TAINT_KEY};
use crate::deployer::lifecycle::Lifecycle;
use crate::deployer::DeployEnv;
use crate::error::{Error, Result};
use crate::topology::LINUX;

/// The `aks` CI.
pub struct AksCi {
    run: RunArgs,
    args: AksArgs,
    env: DeployEnv,
    deployer: AksDeployer,
    lifecycle: Lifecycle,
    api: Option<Arc<dyn ClusterApi>>,
    http: reqwest::Client,
}

impl AksCi {
    /// Validate the inputs and pick a location; nothing is created
    pub async fn new(run: RunArgs, args: AksArgs, env: DeployEnv) -> Result<Self> {
        if !BuildManifest::parse(&run.build)?.is_empty() {
            return Err(Error::configuration(
                "the aks CI deploys the managed Kubernetes version and cannot build components",
            ));
        }
        if !run.install_patches.is_empty() {
            return Err(Error::configuration(
                "the aks CI has no ssh access to its nodes and cannot install patches",
            ));
        }

        let location = match &args.location {
            Some(location) => location.clone(),
            None => least_used_location(env.cloud.as_ref(), AZURE_LOCATIONS, &env.cancel).await?,
        };
        info!(location = %location, "Using Azure location");

        let deployer = AksDeployer::new(args.clone(), location, env.clone());
        let lifecycle = Lifecycle::new(&args.cluster_name);
        Ok(Self {
            run,
            args,
            env,
            deployer,
            lifecycle,
            api: None,
            http: reqwest::Client::new(),
        })
    }

    fn requested_version(&self) -> String {
        format!("v{}", self.args.aks_version)
    }

    fn api(&self) -> Result<&Arc<dyn ClusterApi>> {
        self.api.as_ref().ok_or_else(|| {
            Error::invalid_state(&self.args.cluster_name, self.lifecycle.state().to_string())
        })
    }

    /// Patch version AKS picked for the requested minor version
    async fn deployed_version(&self, api: &dyn ClusterApi) -> Result<String> {
        let nodes = api.list_nodes().await?;
        Ok(nodes
            .iter()
            .find(|node| node.os == LINUX && !node.kubelet_version.is_empty())
            .map(|node| node.kubelet_version.clone())
            .unwrap_or_else(|| self.requested_version()))
    }
}

#[async_trait]
impl CiVariant for AksCi {
    fn name(&self) -> &'static str {
        "aks"
    }

    async fn build(&mut self) -> Result<()> {
        Ok(())
    }

    async fn up(&mut self) -> Result<()> {
        write_metadata(&self.env.config.artifacts_dir, &self.requested_version())?;
        let api = self.deployer.bring_up(&self.lifecycle).await?;
        self.api = Some(api);
        Ok(())
    }

    async fn reclaim(&mut self) -> Result<()> {
        let api = self.deployer.reclaim(&self.lifecycle).await?;
        self.api = Some(api);
        Ok(())
    }

    async fn install_patches(&mut self) -> Result<()> {
        Ok(())
    }

    async fn test(&mut self) -> Result<()> {
        let api = self.api()?.clone();
        let opts = ConformanceOptions {
            kubernetes_version: self.deployed_version(api.as_ref()).await?,
            parallel_nodes: self.run.parallel_test_nodes,
            focus: self.run.test_focus_regex.clone(),
            skip: self.run.test_skip_regex.clone(),
            e2e_bin: self.run.e2e_bin.clone(),
            repo_list: self.run.repo_list.clone(),
            docker_config_file: self.env.config.docker_config_file.clone(),
            num_nodes: self.args.win_agents_count,
            linux_taint_key: LINUX_POOL_TAINT_KEY.to_string(),
            artifacts_dir: self.env.config.artifacts_dir.clone(),
        };
        run_conformance(
            api.as_ref(),
            &self.env.renderer,
            &self.http,
            &opts,
            &self.env.cancel,
        )
        .await
    }

    async fn collect_logs(&mut self) {
        info!("Node logs of managed clusters are not collected");
    }

    async fn down(&mut self) -> Result<()> {
        info!(cluster = %self.args.cluster_name, "Tearing down the AKS cluster");
        self.api = None;
        self.deployer.tear_down(&self.lifecycle).await
    }
}

/// Boxed variant, ready for the orchestrator
pub async fn variant(run: RunArgs, args: AksArgs, env: DeployEnv) -> Result<Box<dyn CiVariant>> {
    Ok(Box::new(AksCi::new(run, args, env).await?))
}
