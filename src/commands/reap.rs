//! Reap command - delete resource groups leaked by CI runs
//!
//! Usage: e2e-runner reap [--dry-run] [--max-age-minutes N]

use std::sync::Arc;

use clap::Args;
use tracing::info;

use super::Shutdown;
use crate::cloud::azure::AzureCli;
use crate::cloud::resource_group::{CI_NAME, CI_NAME_TAG};
use crate::config::CredentialArgs;
use crate::exec::{CommandRunner, LocalRunner};
use crate::reaper::{KubectlProwJobs, ReapPolicy, Reaper};
use crate::Result;

/// Delete leaked CI resource groups
#[derive(Args, Debug)]
pub struct ReapArgs {
    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Report what would be deleted without deleting it
    #[arg(long)]
    pub dry_run: bool,

    /// Tag selecting the CI resource groups
    #[arg(long, default_value = CI_NAME_TAG)]
    pub filter_tag_name: String,

    #[arg(long, default_value = CI_NAME)]
    pub filter_tag_value: String,

    /// Groups older than this are deleted even if their job still runs
    #[arg(long, default_value_t = 720)]
    pub max_age_minutes: i64,
}

impl ReapArgs {
    fn policy(&self) -> ReapPolicy {
        ReapPolicy {
            tag_name: self.filter_tag_name.clone(),
            tag_value: self.filter_tag_value.clone(),
            max_age: chrono::Duration::minutes(self.max_age_minutes),
            dry_run: self.dry_run,
        }
    }
}

pub async fn run(args: ReapArgs, shutdown: &Shutdown) -> Result<()> {
    let credentials = args.credentials.azure()?;
    let cancel = shutdown.interrupt.clone();
    let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner::new());

    let azure = AzureCli::new(runner.clone(), &credentials.subscription_id, cancel.clone());
    azure.login(&credentials).await?;
    let jobs = KubectlProwJobs::new(
        args.credentials.kubectl_path.clone(),
        runner,
        cancel.clone(),
    );

    let reaped = Reaper::new(Arc::new(azure), Arc::new(jobs), args.policy(), cancel)
        .run()
        .await?;
    for name in &reaped {
        info!(resource_group = %name, dry_run = args.dry_run, "Reaped");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn defaults_select_the_flannel_ci_groups_older_than_twelve_hours() {
        let cli = Cli::try_parse_from(["e2e-runner", "reap"]).unwrap();
        let Commands::Reap(args) = cli.command else {
            panic!("expected reap");
        };
        let policy = args.policy();
        assert_eq!(policy.tag_name, "ciName");
        assert_eq!(policy.tag_value, "k8s-sig-win-networking-prow-flannel-e2e");
        assert_eq!(policy.max_age, chrono::Duration::hours(12));
        assert!(!policy.dry_run);
    }

    #[test]
    fn dry_run_is_carried_into_the_policy() {
        let cli = Cli::try_parse_from(["e2e-runner", "reap", "--dry-run", "--max-age-minutes", "30"])
            .unwrap();
        let Commands::Reap(args) = cli.command else {
            panic!("expected reap");
        };
        let policy = args.policy();
        assert!(policy.dry_run);
        assert_eq!(policy.max_age, chrono::Duration::minutes(30));
    }
}
