//! e2e-runner - ephemeral Kubernetes clusters on Azure for Windows CI
//!
//! A run builds the requested components, brings a cluster up (or reclaims a
//! running one), installs Windows patches, runs the Kubernetes conformance
//! suite and tears everything down again. Two cluster flavours exist:
//!
//! - `capz_flannel`: Cluster API on Azure driven from a bootstrap VM, with
//!   Flannel networking and Windows agents
//! - `aks`: an AKS managed cluster with a Windows node pool
//!
//! `reap` deletes resource groups that runs leaked.

pub mod builder;
pub mod ci;
pub mod cloud;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod deployer;
pub mod error;
pub mod exec;
pub mod poll;
pub mod pool;
pub mod reaper;
pub mod remote;
pub mod retry;
pub mod scripts;
pub mod template;
pub mod topology;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

use commands::Shutdown;

/// Kubernetes e2e runs for Windows on Azure
#[derive(Parser, Debug)]
#[command(name = "e2e-runner")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build, deploy, test and tear down a CI cluster
    Run(commands::run::RunCommandArgs),

    /// Delete resource groups leaked by CI runs
    Reap(commands::reap::ReapArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self, shutdown: &Shutdown) -> Result<()> {
        match self.command {
            Commands::Run(args) => commands::run::run(args, shutdown).await,
            Commands::Reap(args) => commands::reap::run(args, shutdown).await,
        }
    }
}
