//! Run command - build, deploy, test and tear down one CI cluster
//!
//! Usage: e2e-runner run [flags] <capz_flannel|aks> [variant flags]

use std::sync::Arc;

use clap::{Args, Subcommand};
use tracing::info;

use super::Shutdown;
use crate::ci::{aks, capz_flannel, CiVariant, Orchestrator, Steps};
use crate::cloud::azure::AzureCli;
use crate::cluster::client::KubeConnector;
use crate::config::{AksArgs, CapzFlannelArgs, CredentialArgs, RunArgs, RunConfig};
use crate::deployer::DeployEnv;
use crate::exec::{CommandRunner, LocalRunner};
use crate::scripts::ScriptDir;
use crate::template::TemplateRenderer;
use crate::Result;

/// Run one CI job
#[derive(Args, Debug)]
pub struct RunCommandArgs {
    #[command(flatten)]
    pub credentials: CredentialArgs,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub ci: Ci,
}

/// CI variants
#[derive(Subcommand, Debug)]
pub enum Ci {
    /// Cluster API on Azure with Flannel and Windows agents
    #[command(name = "capz_flannel")]
    CapzFlannel(CapzFlannelArgs),

    /// AKS managed cluster with a Windows node pool
    #[command(name = "aks")]
    Aks(AksArgs),
}

impl Ci {
    fn name(&self) -> &'static str {
        match self {
            Ci::CapzFlannel(_) => "capz_flannel",
            Ci::Aks(_) => "aks",
        }
    }
}

/// Steps requested on the command line
pub fn steps(run: &RunArgs) -> Steps {
    Steps {
        up: run.up,
        install_patches: !run.install_patches.is_empty(),
        test: run.test,
        down: run.down,
        retain_on_failure: run.retain_on_failure,
    }
}

pub async fn run(args: RunCommandArgs, shutdown: &Shutdown) -> Result<()> {
    let config = RunConfig::from_args(&args.credentials, &args.run)?;
    std::fs::create_dir_all(&config.artifacts_dir)?;
    info!(
        ci = args.ci.name(),
        artifacts = %config.artifacts_dir.display(),
        "Configuration validated"
    );

    let cancel = shutdown.abort.clone();
    let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner::new());
    let azure = AzureCli::new(runner.clone(), &config.azure.subscription_id, cancel.clone());
    azure.login(&config.azure).await?;

    let env = DeployEnv {
        cloud: Arc::new(azure),
        connector: Arc::new(KubeConnector::new(
            config.kubectl.clone(),
            runner.clone(),
            cancel.clone(),
        )),
        renderer: Arc::new(TemplateRenderer::new(
            config.templates_dir.iter().cloned().collect(),
        )),
        scripts: Arc::new(ScriptDir::materialize()?),
        config: Arc::new(config),
        runner,
        cancel,
    };

    let steps = steps(&args.run);
    let variant: Box<dyn CiVariant> = match args.ci {
        Ci::CapzFlannel(ci) => capz_flannel::variant(args.run, ci, env).await?,
        Ci::Aks(ci) => aks::variant(args.run, ci, env).await?,
    };
    Orchestrator::new(variant, steps, shutdown.interrupt.clone())
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlannelMode;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn parse(argv: &[&str]) -> RunCommandArgs {
        let mut full = vec!["e2e-runner", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn variant_flags_follow_the_variant_name() {
        let args = parse(&[
            "--up",
            "--down",
            "capz_flannel",
            "-c",
            "capz-e2e",
            "--flannel-mode",
            "vxlan",
        ]);
        let Ci::CapzFlannel(ci) = args.ci else {
            panic!("expected capz_flannel");
        };
        assert_eq!(ci.cluster_name, "capz-e2e");
        assert_eq!(ci.flannel_mode, FlannelMode::Overlay);
        assert!(args.run.up);
        assert!(args.run.down);
        assert!(!args.run.test);
    }

    #[test]
    fn patches_turn_on_the_install_step() {
        let args = parse(&[
            "--test=true",
            "--install-patch",
            "https://example.com/kb1.msu",
            "--install-patch",
            "https://example.com/kb2.msu",
            "aks",
            "-c",
            "aks-e2e",
        ]);
        let steps = steps(&args.run);
        assert!(steps.install_patches);
        assert!(steps.test);
        assert!(!steps.up);
        assert_eq!(args.run.install_patches.len(), 2);
    }

    #[test]
    fn bare_toggles_never_swallow_the_variant() {
        let args = parse(&[
            "--up",
            "--retain-on-failure",
            "--down=false",
            "--test",
            "capz_flannel",
            "-c",
            "capz-e2e",
            "--enable-win-dsr",
            "--flannel-mode",
            "host-gw",
        ]);
        let Ci::CapzFlannel(ci) = args.ci else {
            panic!("expected capz_flannel");
        };
        assert!(args.run.up);
        assert!(args.run.retain_on_failure);
        assert!(!args.run.down);
        assert!(args.run.test);
        assert!(ci.enable_win_dsr);
    }

    #[test]
    fn a_cluster_name_is_required() {
        assert!(Cli::try_parse_from(["e2e-runner", "run", "aks"]).is_err());
    }

    #[test]
    fn unknown_variants_are_rejected() {
        assert!(Cli::try_parse_from(["e2e-runner", "run", "gke", "-c", "x"]).is_err());
    }
}
