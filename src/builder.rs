//! Source builds on the bootstrap VM
//!
//! Each [`BuildTarget`] is cloned under the VM's GOPATH, built for its
//! platforms and copied into the nginx share, where the cluster templates
//! pick the binaries up. The [`BuildManifest`] records what was built and
//! the Kubernetes version the build produced.

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::config::RepoArgs;
use crate::deployer::bootstrap_vm::{BootstrapVm, ARTIFACTS_DIR, GO_PATH};
use crate::error::{Error, ErrorKind, Result};
use crate::template::flag;

/// Puts the Go toolchain installed by `install-golang.sh` on the path
const GO_ENV: &str = "export GOPATH=\"$HOME/go\" PATH=\"/usr/local/go/bin:$HOME/go/bin:$PATH\"";

/// A component that can be built from source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuildTarget {
    K8sBins,
    ContainerdBins,
    ContainerdShim,
    CriTools,
    SdnCniBins,
}

impl BuildTarget {
    pub const ALL: [BuildTarget; 5] = [
        BuildTarget::K8sBins,
        BuildTarget::ContainerdBins,
        BuildTarget::ContainerdShim,
        BuildTarget::CriTools,
        BuildTarget::SdnCniBins,
    ];

    /// Name on the command line, also the artifact directory name
    pub fn name(&self) -> &'static str {
        match self {
            BuildTarget::K8sBins => "k8sbins",
            BuildTarget::ContainerdBins => "containerdbins",
            BuildTarget::ContainerdShim => "containerdshim",
            BuildTarget::CriTools => "critools",
            BuildTarget::SdnCniBins => "sdncnibins",
        }
    }

    /// Checkout directory on the VM
    fn source_dir(&self) -> String {
        let path = match self {
            BuildTarget::K8sBins => "k8s.io/kubernetes",
            BuildTarget::ContainerdBins => "github.com/containerd/containerd",
            BuildTarget::ContainerdShim => "github.com/Microsoft/hcsshim",
            BuildTarget::CriTools => "github.com/kubernetes-sigs/cri-tools",
            BuildTarget::SdnCniBins => "github.com/Microsoft/windows-container-networking",
        };
        format!("{}/src/{}", GO_PATH, path)
    }

    fn artifacts_dir(&self) -> String {
        format!("{}/{}", ARTIFACTS_DIR, self.name())
    }

    /// Build and copy commands, run inside [`source_dir`](Self::source_dir)
    fn build_script(&self) -> Vec<String> {
        let out = self.artifacts_dir();
        let mut lines = vec![GO_ENV.to_string(), format!("mkdir -p {}", out)];
        match self {
            BuildTarget::K8sBins => lines.extend([
                "make WHAT=\"cmd/kubectl cmd/kubelet cmd/kubeadm\" KUBE_BUILD_PLATFORMS=\"linux/amd64\"".to_string(),
                "make WHAT=\"cmd/kubectl cmd/kubelet cmd/kubeadm cmd/kube-proxy\" KUBE_BUILD_PLATFORMS=\"windows/amd64\"".to_string(),
                "KUBE_FASTBUILD=true KUBE_BUILD_CONFORMANCE=y make quick-release-images".to_string(),
                format!("mkdir -p {}/images", out),
                format!("cp _output/local/bin/linux/amd64/{{kubeadm,kubelet,kubectl}} {}/", out),
                format!("cp _output/local/bin/windows/amd64/{{kubelet,kubeadm,kubectl,kube-proxy}}.exe {}/", out),
                format!(
                    "cp _output/release-images/amd64/{{kube-apiserver,kube-controller-manager,kube-proxy,kube-scheduler}}.tar {}/images/",
                    out
                ),
            ]),
            BuildTarget::ContainerdBins => lines.extend([
                "GOOS=windows make binaries".to_string(),
                format!("cp bin/containerd.exe bin/ctr.exe {}/", out),
            ]),
            BuildTarget::ContainerdShim => lines.extend([
                "GOOS=windows GO111MODULE=on go build -mod=vendor -o containerd-shim-runhcs-v1.exe ./cmd/containerd-shim-runhcs-v1".to_string(),
                format!("cp containerd-shim-runhcs-v1.exe {}/", out),
            ]),
            BuildTarget::CriTools => lines.extend([
                "GOOS=windows make binaries".to_string(),
                format!("cp build/bin/windows/amd64/crictl.exe build/bin/windows/amd64/critest.exe {}/", out),
            ]),
            BuildTarget::SdnCniBins => lines.extend([
                "GOOS=windows make all".to_string(),
                format!("cp out/nat.exe out/sdnbridge.exe out/sdnoverlay.exe {}/", out),
            ]),
        }
        lines
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BuildTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BuildTarget::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| Error::build_failed(s, "unknown build target"))
    }
}

/// Where a build put its output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub target: BuildTarget,
    /// Directory on the bootstrap VM
    pub remote_dir: String,
    /// Path under the artifact share URL
    pub url_path: String,
}

/// Requested and completed builds of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildManifest {
    pub requested: Vec<BuildTarget>,
    pub built: Vec<BuildTarget>,
    /// Kubernetes version reported by the built kubeadm
    pub version: Option<String>,
    pub artifacts: Vec<ArtifactLocation>,
}

impl BuildManifest {
    /// Parse `--build` values; unknown names fail with [`Error::BuildFailed`]
    pub fn parse(names: &[String]) -> Result<Self> {
        let mut requested = Vec::new();
        for name in names {
            let target = name.parse::<BuildTarget>()?;
            if !requested.contains(&target) {
                requested.push(target);
            }
        }
        Ok(Self {
            requested,
            ..Default::default()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }

    pub fn has_built(&self, target: BuildTarget) -> bool {
        self.built.contains(&target)
    }

    fn record(&mut self, target: BuildTarget) {
        if !self.built.contains(&target) {
            self.built.push(target);
        }
        self.artifacts.push(ArtifactLocation {
            target,
            remote_dir: target.artifacts_dir(),
            url_path: target.name().to_string(),
        });
    }

    /// Kubernetes version the cluster should run
    pub fn effective_version<'a>(&'a self, requested: &'a str) -> &'a str {
        self.version.as_deref().unwrap_or(requested)
    }

    /// Template switches telling the node bootstrap which binaries to fetch
    pub fn template_flags(&self) -> [(&'static str, String); 4] {
        [
            ("k8s_bins", flag(self.has_built(BuildTarget::K8sBins))),
            ("sdn_cni_bins", flag(self.has_built(BuildTarget::SdnCniBins))),
            ("containerd_bins", flag(self.has_built(BuildTarget::ContainerdBins))),
            (
                "containerd_shim_bins",
                flag(self.has_built(BuildTarget::ContainerdShim)),
            ),
        ]
    }
}

/// Source location of one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoSource {
    pub url: String,
    pub branch: String,
}

fn source_for(repos: &RepoArgs, target: BuildTarget) -> RepoSource {
    let (url, branch) = match target {
        BuildTarget::K8sBins => (&repos.k8s_repo, &repos.k8s_branch),
        BuildTarget::ContainerdBins => (&repos.containerd_repo, &repos.containerd_branch),
        BuildTarget::ContainerdShim => (&repos.containerd_shim_repo, &repos.containerd_shim_branch),
        BuildTarget::CriTools => (&repos.critools_repo, &repos.critools_branch),
        BuildTarget::SdnCniBins => (&repos.sdn_repo, &repos.sdn_branch),
    };
    RepoSource {
        url: url.clone(),
        branch: branch.clone(),
    }
}

/// Runs builds on the bootstrap VM.
pub struct Builder<'a> {
    vm: &'a BootstrapVm,
    repos: &'a RepoArgs,
}

impl<'a> Builder<'a> {
    pub fn new(vm: &'a BootstrapVm, repos: &'a RepoArgs) -> Self {
        Self { vm, repos }
    }

    /// Build every requested target not built yet, in request order
    pub async fn build_all(&self, manifest: &mut BuildManifest) -> Result<()> {
        for target in manifest.requested.clone() {
            if manifest.has_built(target) {
                continue;
            }
            let version = self.build(target).await.map_err(|e| match e.kind() {
                ErrorKind::Cancelled | ErrorKind::BuildFailed => e,
                _ => Error::build_failed(target.name(), e.to_string()),
            })?;
            if version.is_some() {
                manifest.version = version;
            }
            manifest.record(target);
        }
        Ok(())
    }

    /// Build one target; k8sbins reports the version it produced
    async fn build(&self, target: BuildTarget) -> Result<Option<String>> {
        let source = source_for(self.repos, target);
        let dir = target.source_dir();
        info!(target = %target, repo = %source.url, branch = %source.branch, "Building");
        self.vm.clone_repo(&source.url, &source.branch, &dir).await?;
        self.vm.exec(&target.build_script(), Some(&dir)).await?;

        if target != BuildTarget::K8sBins {
            return Ok(None);
        }
        let output = self
            .vm
            .exec(
                &["./_output/local/bin/linux/amd64/kubeadm version -o=short"],
                Some(&dir),
            )
            .await?;
        let version = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(String::from)
            .ok_or_else(|| Error::build_failed(target.name(), "kubeadm reported no version"))?;
        info!(version = %version, "Built Kubernetes");
        Ok(Some(version))
    }
}
