//! Cluster API on Azure with Flannel networking
//!
//! Builds run on the bootstrap VM, which also hosts the kind management
//! cluster; the workload cluster has one Linux control plane and Windows
//! agents.

use async_trait::async_trait;
use tracing::{info, warn};

use super::conformance::{run_conformance, ConformanceOptions};
use super::{write_metadata, CiVariant};
use crate::builder::{BuildManifest, Builder};
use crate::cloud::resource_group::{least_used_location, AZURE_LOCATIONS};
use crate::config::{validate_gallery_name, CapzFlannelArgs, RunArgs};
use crate::deployer::bootstrap_vm::{BootstrapVm, BootstrapVmSpec};
use crate::deployer::capz::{CapzCluster, CapzDeployer};
use crate::deployer::lifecycle::{ClusterState, Lifecycle};
use crate::deployer::naming::ResourceNames;
use crate::deployer::DeployEnv;
use crate::error::{Error, Result};

/// Taint of the control-plane node, the only Linux node
pub const CONTROL_PLANE_TAINT_KEY: &str = "node-role.kubernetes.io/control-plane";

/// The `capz_flannel` CI.
pub struct CapzFlannelCi {
    run: RunArgs,
    args: CapzFlannelArgs,
    env: DeployEnv,
    deployer: CapzDeployer,
    vm: BootstrapVm,
    manifest: BuildManifest,
    lifecycle: Lifecycle,
    cluster: Option<CapzCluster>,
    http: reqwest::Client,
}

impl CapzFlannelCi {
    /// Validate the inputs and pick a location; nothing is created
    pub async fn new(run: RunArgs, args: CapzFlannelArgs, env: DeployEnv) -> Result<Self> {
        let manifest = BuildManifest::parse(&run.build)?;
        validate_gallery_name(&args.image_gallery)?;

        let location = match &args.location {
            Some(location) => location.clone(),
            None => least_used_location(env.cloud.as_ref(), AZURE_LOCATIONS, &env.cancel).await?,
        };
        info!(location = %location, "Using Azure location");

        let spec = BootstrapVmSpec {
            subscription_id: env.config.azure.subscription_id.clone(),
            location: location.clone(),
            vm_size: args.bootstrap_vm_size.clone(),
            tags: env.config.tags.clone(),
            ssh_public_key: env.config.ssh_public_key.clone(),
            ssh_private_key: env.config.ssh_private_key.clone(),
        };
        let vm = BootstrapVm::new(
            env.cloud.clone(),
            env.remote(),
            ResourceNames::new(&args.cluster_name),
            spec,
            env.scripts.clone(),
            env.cancel.clone(),
        );
        let deployer = CapzDeployer::new(args.clone(), location, env.clone());
        let lifecycle = Lifecycle::new(&args.cluster_name);

        Ok(Self {
            run,
            args,
            env,
            deployer,
            vm,
            manifest,
            lifecycle,
            cluster: None,
            http: reqwest::Client::new(),
        })
    }

    fn kubernetes_version(&self) -> &str {
        self.manifest.effective_version(&self.args.kubernetes_version)
    }

    fn cluster(&self) -> Result<&CapzCluster> {
        self.cluster
            .as_ref()
            .ok_or_else(|| Error::invalid_state(&self.args.cluster_name, self.lifecycle.state().to_string()))
    }

    async fn ensure_bootstrap_vm(&mut self) -> Result<()> {
        if self.vm.addresses().is_none() {
            self.vm.setup(&self.lifecycle).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CiVariant for CapzFlannelCi {
    fn name(&self) -> &'static str {
        "capz_flannel"
    }

    async fn build(&mut self) -> Result<()> {
        if self.manifest.is_empty() {
            return Ok(());
        }
        self.ensure_bootstrap_vm().await?;
        Builder::new(&self.vm, &self.run.repos)
            .build_all(&mut self.manifest)
            .await
    }

    async fn up(&mut self) -> Result<()> {
        write_metadata(&self.env.config.artifacts_dir, self.kubernetes_version())?;
        self.ensure_bootstrap_vm().await?;
        let cluster = self
            .deployer
            .bring_up(&self.vm, &self.manifest, &self.lifecycle)
            .await?;
        self.cluster = Some(cluster);
        Ok(())
    }

    async fn reclaim(&mut self) -> Result<()> {
        if self.vm.addresses().is_none() {
            match self.vm.attach().await {
                Ok(true) => {}
                Ok(false) => info!("No bootstrap VM found"),
                Err(e) => warn!(error = %e, "Failed to look up the bootstrap VM"),
            }
        }
        if self.lifecycle.state() != ClusterState::Absent {
            // only the bootstrap VM was provisioned, for the builds
            self.lifecycle.advance(ClusterState::Absent)?;
        }
        let cluster = self.deployer.reclaim(&self.lifecycle).await?;
        self.cluster = Some(cluster);
        Ok(())
    }

    async fn install_patches(&mut self) -> Result<()> {
        self.cluster()?
            .nodes
            .install_patches(&self.run.install_patches)
            .await
    }

    async fn test(&mut self) -> Result<()> {
        let cluster = self.cluster()?;
        let opts = ConformanceOptions {
            kubernetes_version: self.kubernetes_version().to_string(),
            parallel_nodes: self.run.parallel_test_nodes,
            focus: self.run.test_focus_regex.clone(),
            skip: self.run.test_skip_regex.clone(),
            e2e_bin: self.run.e2e_bin.clone(),
            repo_list: self.run.repo_list.clone(),
            docker_config_file: self.env.config.docker_config_file.clone(),
            num_nodes: self.args.win_agents_count,
            linux_taint_key: CONTROL_PLANE_TAINT_KEY.to_string(),
            artifacts_dir: self.env.config.artifacts_dir.clone(),
        };
        run_conformance(
            cluster.api.as_ref(),
            &self.env.renderer,
            &self.http,
            &opts,
            &self.env.cancel,
        )
        .await
    }

    async fn collect_logs(&mut self) {
        if self.vm.addresses().is_some() {
            self.deployer.collect_bootstrap_logs().await;
        }
        match &self.cluster {
            Some(cluster) => {
                cluster
                    .nodes
                    .collect_logs(&self.env.config.artifacts_dir)
                    .await;
            }
            None => info!("No cluster to collect logs from"),
        }
    }

    async fn down(&mut self) -> Result<()> {
        info!(cluster = %self.args.cluster_name, "Tearing down the CAPZ cluster");
        self.cluster = None;
        self.deployer.tear_down(&mut self.vm, &self.lifecycle).await
    }
}

/// Boxed variant, ready for the orchestrator
pub async fn variant(
    run: RunArgs,
    args: CapzFlannelArgs,
    env: DeployEnv,
) -> Result<Box<dyn CiVariant>> {
    Ok(Box::new(CapzFlannelCi::new(run, args, env).await?))
}
