//! Run configuration
//!
//! Every input of a run arrives through clap: flags for behaviour, `env =`
//! attributes for credentials and CI metadata. [`RunConfig::from_args`]
//! validates them once, before any cloud resource is touched, and the result
//! is passed down explicitly. Nothing below this module reads the process
//! environment.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, ValueEnum};

use crate::cloud::azure::AzureCredentials;
use crate::cloud::resource_group::ResourceGroupTags;
use crate::error::{Error, Result};

/// Kubernetes version deployed when nothing else is requested or built
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.28.4";
/// AKS orchestrator version used when none is requested
pub const DEFAULT_AKS_VERSION: &str = "1.27";
/// Compute gallery publishing the CAPZ reference images
pub const DEFAULT_IMAGE_GALLERY: &str = "ClusterAPI-f72ceb4f-5159-4c26-a0fe-2ea738f0d019";
/// Default conformance focus regex
pub const DEFAULT_TEST_FOCUS: &str = r"\[Conformance\]|\[NodeConformance\]|\[sig-windows\]";
/// Default conformance skip regex
pub const DEFAULT_TEST_SKIP: &str = r"\[LinuxOnly\]";
/// Image registry list consumed by the e2e suite
pub const DEFAULT_REPO_LIST: &str =
    "https://raw.githubusercontent.com/kubernetes-sigs/windows-testing/master/images/image-repo-list";

/// Credentials and CI metadata, read from the environment by clap.
#[derive(Args, Clone, Debug, Default)]
pub struct CredentialArgs {
    /// Azure subscription
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", hide_env_values = true, default_value = "")]
    pub subscription_id: String,

    /// Azure AD tenant
    #[arg(long, env = "AZURE_TENANT_ID", hide_env_values = true, default_value = "")]
    pub tenant_id: String,

    /// Service principal application id
    #[arg(long, env = "AZURE_CLIENT_ID", hide_env_values = true, default_value = "")]
    pub client_id: String,

    /// Service principal secret
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true, default_value = "")]
    pub client_secret: String,

    /// Private key used for every ssh hop
    #[arg(long, env = "SSH_PRIVATE_KEY_PATH")]
    pub ssh_private_key_path: Option<PathBuf>,

    /// Public key installed on the bootstrap VM and cluster nodes
    #[arg(long, env = "SSH_PUBLIC_KEY_PATH")]
    pub ssh_public_key_path: Option<PathBuf>,

    /// Docker config.json passed to the conformance image
    #[arg(long, env = "DOCKER_CONFIG_FILE")]
    pub docker_config_file: Option<PathBuf>,

    /// Token for clusterctl GitHub release lookups
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Prow build id, recorded as a resource group tag
    #[arg(long, env = "BUILD_ID")]
    pub build_id: Option<String>,

    /// Prow job name, recorded as a resource group tag
    #[arg(long, env = "JOB_NAME")]
    pub job_name: Option<String>,

    /// kubectl binary used for exec, cp and log streaming
    #[arg(long, env = "KUBECTL_PATH", default_value = "kubectl")]
    pub kubectl_path: String,

    /// Home directory holding `.kube/`
    #[arg(long, env = "HOME", hide = true, default_value = "/root")]
    pub home: PathBuf,
}

/// Flags shared by every CI variant.
#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Where logs, test results and metadata.json are written
    #[arg(long, default_value = "/tmp/ci_artifacts")]
    pub artifacts_directory: PathBuf,

    /// Windows KB patch URL to install on every Windows node (repeatable)
    #[arg(long = "install-patch")]
    pub install_patches: Vec<String>,

    /// Bring the cluster up (otherwise reclaim an existing one)
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub up: bool,

    /// Tear the cluster down at the end
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub down: bool,

    /// Run the conformance suite
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub test: bool,

    /// Keep every resource when the run fails
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub retain_on_failure: bool,

    /// Components to build from source (repeatable)
    #[arg(long = "build")]
    pub build: Vec<String>,

    /// URL of the e2e image repository list
    #[arg(long, default_value = DEFAULT_REPO_LIST)]
    pub repo_list: String,

    /// Ginkgo parallelism
    #[arg(long, default_value_t = 1)]
    pub parallel_test_nodes: u32,

    /// Ginkgo focus regex
    #[arg(long, default_value = DEFAULT_TEST_FOCUS)]
    pub test_focus_regex: String,

    /// Ginkgo skip regex
    #[arg(long, default_value = DEFAULT_TEST_SKIP)]
    pub test_skip_regex: String,

    /// Replacement e2e.test binary URL
    #[arg(long)]
    pub e2e_bin: Option<String>,

    /// Override search path for manifest templates
    #[arg(long)]
    pub templates_dir: Option<PathBuf>,

    #[command(flatten)]
    pub repos: RepoArgs,
}

/// Source repositories for `--build` targets.
#[derive(Args, Clone, Debug)]
pub struct RepoArgs {
    #[arg(long, default_value = "https://github.com/kubernetes/kubernetes")]
    pub k8s_repo: String,
    #[arg(long, default_value = DEFAULT_KUBERNETES_VERSION)]
    pub k8s_branch: String,
    #[arg(long, default_value = "https://github.com/containerd/containerd")]
    pub containerd_repo: String,
    #[arg(long, default_value = "master")]
    pub containerd_branch: String,
    #[arg(long, default_value = "https://github.com/microsoft/hcsshim")]
    pub containerd_shim_repo: String,
    #[arg(long, default_value = "master")]
    pub containerd_shim_branch: String,
    #[arg(long, default_value = "https://github.com/microsoft/windows-container-networking")]
    pub sdn_repo: String,
    #[arg(long, default_value = "master")]
    pub sdn_branch: String,
    #[arg(long, default_value = "https://github.com/kubernetes-sigs/cri-tools")]
    pub critools_repo: String,
    #[arg(long, default_value = "master")]
    pub critools_branch: String,
}

/// Flannel backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FlannelMode {
    /// VXLAN overlay
    #[value(name = "vxlan")]
    Overlay,
    /// L2 host gateway
    #[value(name = "host-gw")]
    HostGw,
}

impl FlannelMode {
    /// Backend type understood by the flannel chart
    pub fn backend(&self) -> &'static str {
        match self {
            FlannelMode::Overlay => "vxlan",
            FlannelMode::HostGw => "host-gw",
        }
    }

    /// Whether the cloud routes must be programmed by the cloud controller
    pub fn needs_cloud_routes(&self) -> bool {
        matches!(self, FlannelMode::HostGw)
    }
}

impl fmt::Display for FlannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.backend())
    }
}

/// Windows Server release of the agent image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WinOs {
    Ltsc2019,
    Ltsc2022,
    Ltsc2025,
}

impl WinOs {
    /// Year used in the CAPZ image name
    pub fn version(&self) -> &'static str {
        match self {
            WinOs::Ltsc2019 => "2019",
            WinOs::Ltsc2022 => "2022",
            WinOs::Ltsc2025 => "2025",
        }
    }
}

/// `capz_flannel` variant flags.
#[derive(Args, Clone, Debug)]
pub struct CapzFlannelArgs {
    /// Workload cluster name; every resource name derives from it
    #[arg(long, short = 'c')]
    pub cluster_name: String,

    #[arg(long, value_enum, default_value = "host-gw")]
    pub flannel_mode: FlannelMode,

    #[arg(long, default_value = DEFAULT_KUBERNETES_VERSION)]
    pub kubernetes_version: String,

    /// Enable Direct Server Return in Windows kube-proxy
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub enable_win_dsr: bool,

    #[arg(long, default_value = "10.244.0.0/16")]
    pub cluster_network_subnet: String,

    /// Azure location; the least used one is picked when absent
    #[arg(long)]
    pub location: Option<String>,

    #[arg(long, default_value = "10.0.0.0/8")]
    pub vnet_cidr_block: String,
    #[arg(long, default_value = "10.0.0.0/16")]
    pub control_plane_subnet_cidr_block: String,
    #[arg(long, default_value = "10.1.0.0/16")]
    pub node_subnet_cidr_block: String,

    #[arg(long, default_value = "Standard_D2s_v3")]
    pub bootstrap_vm_size: String,
    #[arg(long, default_value = "Standard_D2s_v3")]
    pub master_vm_size: String,
    #[arg(long, default_value = "Standard_D2s_v3")]
    pub win_agent_size: String,
    #[arg(long, default_value_t = 2)]
    pub win_agents_count: u32,

    #[arg(long, value_enum, default_value = "ltsc2019")]
    pub win_os: WinOs,

    /// Compute gallery holding the node images
    #[arg(long, default_value = DEFAULT_IMAGE_GALLERY)]
    pub image_gallery: String,

    #[arg(long, default_value = "v1.4.0")]
    pub cni_version: String,
    #[arg(long, default_value = "ghcr.io/kubernetes-sigs/sig-windows")]
    pub container_image_registry: String,
    #[arg(long, default_value = "hostprocess")]
    pub container_image_tag: String,
}

/// `aks` variant flags.
#[derive(Args, Clone, Debug)]
pub struct AksArgs {
    #[arg(long, short = 'c')]
    pub cluster_name: String,

    #[arg(long, default_value = DEFAULT_AKS_VERSION)]
    pub aks_version: String,

    #[arg(long)]
    pub location: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub linux_agents_count: u32,
    #[arg(long, default_value = "Standard_D2s_v3")]
    pub linux_agents_size: String,
    #[arg(long, default_value_t = 2)]
    pub win_agents_count: u32,
    #[arg(long, default_value = "Standard_D2s_v3")]
    pub win_agents_size: String,
    #[arg(long, default_value = "Windows2022")]
    pub win_agents_sku: String,
}

/// Validated inputs of a run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub azure: AzureCredentials,
    pub ssh_private_key: PathBuf,
    /// Contents of the public key file, trimmed
    pub ssh_public_key: String,
    pub docker_config_file: Option<PathBuf>,
    pub github_token: Option<String>,
    pub tags: ResourceGroupTags,
    pub kubectl: String,
    /// `~/.kube`
    pub kube_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub templates_dir: Option<PathBuf>,
}

fn required(name: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::configuration(format!("{} is not set", name)));
    }
    Ok(value.to_string())
}

fn readable(name: &str, path: Option<&Path>) -> Result<PathBuf> {
    let path = path.ok_or_else(|| Error::configuration(format!("{} is not set", name)))?;
    std::fs::metadata(path).map_err(|e| {
        Error::configuration(format!("{} {} is not readable: {}", name, path.display(), e))
    })?;
    Ok(path.to_path_buf())
}

impl CredentialArgs {
    /// Service principal credentials; every field must be set
    pub fn azure(&self) -> Result<AzureCredentials> {
        Ok(AzureCredentials {
            subscription_id: required("AZURE_SUBSCRIPTION_ID", &self.subscription_id)?,
            tenant_id: required("AZURE_TENANT_ID", &self.tenant_id)?,
            client_id: required("AZURE_CLIENT_ID", &self.client_id)?,
            client_secret: required("AZURE_CLIENT_SECRET", &self.client_secret)?,
        })
    }
}

impl RunConfig {
    /// Validate credentials and build the run configuration
    pub fn from_args(credentials: &CredentialArgs, run: &RunArgs) -> Result<Self> {
        let azure = credentials.azure()?;
        let ssh_private_key = readable(
            "SSH_PRIVATE_KEY_PATH",
            credentials.ssh_private_key_path.as_deref(),
        )?;
        let public_key_path = readable(
            "SSH_PUBLIC_KEY_PATH",
            credentials.ssh_public_key_path.as_deref(),
        )?;
        let ssh_public_key = std::fs::read_to_string(&public_key_path)?.trim().to_string();
        if ssh_public_key.is_empty() {
            return Err(Error::configuration(format!(
                "ssh public key {} is empty",
                public_key_path.display()
            )));
        }
        let docker_config_file = match &credentials.docker_config_file {
            Some(path) => Some(readable("DOCKER_CONFIG_FILE", Some(path))?),
            None => None,
        };

        Ok(Self {
            azure,
            ssh_private_key,
            ssh_public_key,
            docker_config_file,
            github_token: credentials.github_token.clone().filter(|t| !t.is_empty()),
            tags: ResourceGroupTags::new(
                credentials.build_id.clone().filter(|v| !v.is_empty()),
                credentials.job_name.clone().filter(|v| !v.is_empty()),
            ),
            kubectl: credentials.kubectl_path.clone(),
            kube_dir: credentials.home.join(".kube"),
            artifacts_dir: run.artifacts_directory.clone(),
            templates_dir: run.templates_dir.clone(),
        })
    }
}

/// Reject gallery names Azure would refuse, before anything is provisioned
pub fn validate_gallery_name(gallery: &str) -> Result<()> {
    let valid = !gallery.is_empty()
        && gallery
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "malformed compute gallery name {:?}",
            gallery
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use clap::Parser;
    use std::io::Write;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        credentials: CredentialArgs,
        #[command(flatten)]
        run: RunArgs,
    }

    fn key_files() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let private = tempfile::NamedTempFile::new().unwrap();
        let mut public = tempfile::NamedTempFile::new().unwrap();
        writeln!(public, "ssh-rsa AAAAB3Nza ci@runner").unwrap();
        (private, public)
    }

    fn credentials(private: &Path, public: &Path) -> CredentialArgs {
        CredentialArgs {
            subscription_id: "sub".into(),
            tenant_id: "tenant".into(),
            client_id: "client".into(),
            client_secret: "secret".into(),
            ssh_private_key_path: Some(private.to_path_buf()),
            ssh_public_key_path: Some(public.to_path_buf()),
            kubectl_path: "kubectl".into(),
            home: PathBuf::from("/home/prow"),
            ..Default::default()
        }
    }

    fn run_args() -> RunArgs {
        TestCli::parse_from(["test"]).run
    }

    #[test]
    fn bool_flags_accept_bare_and_explicit_values() {
        let cli = TestCli::parse_from(["test", "--up", "--down=false", "--test=true"]);
        assert!(cli.run.up);
        assert!(!cli.run.down);
        assert!(cli.run.test);
        assert!(!cli.run.retain_on_failure);
    }

    #[test]
    fn repeatable_flags_accumulate() {
        let cli = TestCli::parse_from([
            "test",
            "--build",
            "k8sbins",
            "--build",
            "sdncnibins",
            "--install-patch",
            "https://example.com/kb1.msu",
        ]);
        assert_eq!(cli.run.build, vec!["k8sbins", "sdncnibins"]);
        assert_eq!(cli.run.install_patches.len(), 1);
        assert_eq!(cli.run.repos.k8s_branch, DEFAULT_KUBERNETES_VERSION);
    }

    #[test]
    fn valid_inputs_build_a_config_with_the_public_key_contents() {
        let (private, public) = key_files();
        let config =
            RunConfig::from_args(&credentials(private.path(), public.path()), &run_args()).unwrap();
        assert_eq!(config.ssh_public_key, "ssh-rsa AAAAB3Nza ci@runner");
        assert_eq!(config.kube_dir, PathBuf::from("/home/prow/.kube"));
        assert_eq!(config.artifacts_dir, PathBuf::from("/tmp/ci_artifacts"));
    }

    #[test]
    fn when_a_credential_is_missing_then_configuration_error_names_it() {
        let (private, public) = key_files();
        let mut creds = credentials(private.path(), public.path());
        creds.client_secret = "  ".into();
        let err = RunConfig::from_args(&creds, &run_args()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("AZURE_CLIENT_SECRET"));
    }

    #[test]
    fn when_a_key_file_is_unreadable_then_configuration_error() {
        let (private, public) = key_files();
        let mut creds = credentials(private.path(), public.path());
        creds.ssh_private_key_path = Some(PathBuf::from("/nonexistent/id_rsa"));
        let err = RunConfig::from_args(&creds, &run_args()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("SSH_PRIVATE_KEY_PATH"));
    }

    #[test]
    fn gallery_names_are_checked() {
        assert!(validate_gallery_name(DEFAULT_IMAGE_GALLERY).is_ok());
        assert_eq!(
            validate_gallery_name("bad/gallery").unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn flannel_modes_map_to_backends() {
        assert_eq!(FlannelMode::Overlay.backend(), "vxlan");
        assert!(FlannelMode::HostGw.needs_cloud_routes());
        assert_eq!(WinOs::Ltsc2022.version(), "2022");
    }
}
