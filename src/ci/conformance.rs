//! Upstream Kubernetes conformance suite
//!
//! The suite runs in a pod on a Linux node next to a helper pod sharing its
//! `/output` host directory, so results can be copied out after the suite
//! pod has terminated.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::Taint;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterApi, POD_TERMINAL_PHASES};
use crate::error::{Error, Result};
use crate::poll::{poll_until_ready, PollSpec, Readiness};
use crate::retry::{retry, RetryPolicy};
use crate::template::{context, TemplateRenderer, CONFORMANCE_TEMPLATE};

/// Namespace of the conformance pods
pub const NAMESPACE: &str = "default";
/// Pod holding the results directory
pub const HELPER_POD: &str = "alpine";
/// Pod running ginkgo
pub const CONFORMANCE_POD: &str = "conformance-tests";

const REPO_LIST_CONFIG_MAP: &str = "repo-list";
const REPO_LIST_KEY: &str = "repos.yaml";
const DOCKER_CREDS_SECRET: &str = "docker-creds";
const DOCKER_CREDS_KEY: &str = "config.json";
const LINUX_NODES: &str = "kubernetes.io/os=linux";
const OUTPUT_DIR: &str = "/output";
const POD_START_TIMEOUT: Duration = Duration::from_secs(600);
const SUITE_TIMEOUT: Duration = Duration::from_secs(3 * 3600);

/// Inputs of one conformance run.
#[derive(Clone, Debug)]
pub struct ConformanceOptions {
    /// Version of the cluster under test
    pub kubernetes_version: String,
    pub parallel_nodes: u32,
    pub focus: String,
    pub skip: String,
    /// Replacement `e2e.test` binary
    pub e2e_bin: Option<String>,
    /// URL of the test image repository list
    pub repo_list: String,
    /// Registry credentials made available to the suite
    pub docker_config_file: Option<PathBuf>,
    /// Number of schedulable nodes the suite expects
    pub num_nodes: u32,
    /// Taint keeping test workloads off Linux nodes
    pub linux_taint_key: String,
    pub artifacts_dir: PathBuf,
}

/// Conformance image matching a Kubernetes version
pub fn conformance_image(kubernetes_version: &str) -> String {
    format!(
        "registry.k8s.io/conformance:{}",
        kubernetes_version.replace('+', "_")
    )
}

/// Whether ginkgo v2 flag names apply (Kubernetes 1.25 onwards)
fn uses_ginkgo_v2(kubernetes_version: &str) -> bool {
    let mut parts = kubernetes_version.trim_start_matches('v').split('.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| {
        let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>().ok()
    });
    match (major, minor) {
        (Some(major), Some(minor)) => (major, minor) >= (1, 25),
        _ => true,
    }
}

fn render_flags(flags: &[(&str, String)]) -> Vec<String> {
    flags
        .iter()
        .map(|(name, value)| format!("--{}={}", name, shell_escape::escape(Cow::from(value.as_str()))))
        .collect()
}

/// Ginkgo flags, quoted for the suite's shell
pub fn ginkgo_flags(opts: &ConformanceOptions) -> Vec<String> {
    let mut flags = vec![
        ("progress", "true".to_string()),
        ("trace", "true".to_string()),
        ("v", "true".to_string()),
        ("nodes", opts.parallel_nodes.to_string()),
        ("focus", opts.focus.clone()),
        ("skip", opts.skip.clone()),
    ];
    if uses_ginkgo_v2(&opts.kubernetes_version) {
        flags.push(("no-color", "true".to_string()));
        flags.push(("slow-spec-threshold", "5m".to_string()));
    } else {
        flags.push(("noColor", "true".to_string()));
        flags.push(("slowSpecThreshold", "300.0".to_string()));
    }
    render_flags(&flags)
}

/// e2e.test flags, quoted for the suite's shell
pub fn e2e_flags(opts: &ConformanceOptions) -> Vec<String> {
    let mut flags = vec![
        ("provider", "skeleton".to_string()),
        ("report-dir", OUTPUT_DIR.to_string()),
        ("e2e-output-dir", format!("{}/e2e-output", OUTPUT_DIR)),
        ("num-nodes", opts.num_nodes.to_string()),
        ("node-os-distro", "windows".to_string()),
        ("non-blocking-taints", opts.linux_taint_key.clone()),
        ("test.timeout", "2h".to_string()),
        ("prepull-images", "true".to_string()),
        ("disable-log-dump", "true".to_string()),
    ];
    if opts.docker_config_file.is_some() {
        flags.push((
            "docker-config-file",
            format!("/{}/{}", DOCKER_CREDS_SECRET, DOCKER_CREDS_KEY),
        ));
    }
    render_flags(&flags)
}

/// Rendered conformance manifest
pub fn render_manifest(renderer: &TemplateRenderer, opts: &ConformanceOptions) -> Result<String> {
    let ctx = context([
        ("conformance_image", conformance_image(&opts.kubernetes_version)),
        ("e2e_bin_url", opts.e2e_bin.clone().unwrap_or_default()),
        (
            "docker_config_file",
            opts.docker_config_file
                .as_ref()
                .map(|_| "true".to_string())
                .unwrap_or_default(),
        ),
        ("ginkgo_flags", serde_json::to_string(&ginkgo_flags(opts))?),
        ("e2e_flags", serde_json::to_string(&e2e_flags(opts))?),
    ]);
    renderer.render(CONFORMANCE_TEMPLATE, &ctx)
}

/// Download the image repository list
pub async fn fetch_repo_list(
    http: &reqwest::Client,
    url: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    retry(
        &RetryPolicy::with_max_attempts(5),
        "download repo list",
        cancel,
        || async {
            let response = http
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::command_failed(format!("GET {}: {}", url, e)))?;
            response
                .text()
                .await
                .map_err(|e| Error::command_failed(format!("GET {}: {}", url, e)))
        },
    )
    .await
}

/// Repository list ConfigMap, registry secret and Linux node taints
pub async fn prepare(
    api: &dyn ClusterApi,
    repo_list: &str,
    opts: &ConformanceOptions,
) -> Result<()> {
    info!("Preparing the cluster for the conformance tests");
    api.create_config_map(
        NAMESPACE,
        REPO_LIST_CONFIG_MAP,
        BTreeMap::from([(REPO_LIST_KEY.to_string(), repo_list.to_string())]),
    )
    .await?;

    if let Some(path) = &opts.docker_config_file {
        let creds = tokio::fs::read_to_string(path).await?;
        api.create_secret(
            NAMESPACE,
            DOCKER_CREDS_SECRET,
            BTreeMap::from([(DOCKER_CREDS_KEY.to_string(), creds)]),
        )
        .await?;
    }

    let taint = Taint {
        key: opts.linux_taint_key.clone(),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    };
    api.taint_nodes(LINUX_NODES, &taint).await
}

/// Local copy of the suite's `/output`
pub fn results_dir(artifacts_dir: &Path) -> PathBuf {
    artifacts_dir.join("output")
}

async fn wait_pod_started(
    api: &dyn ClusterApi,
    pod: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let spec = PollSpec::new(POD_START_TIMEOUT).max_interval(Duration::from_secs(10));
    poll_until_ready(&spec, &format!("pod {} to run", pod), cancel, || async {
        let phase = api.pod_phase(NAMESPACE, pod).await?;
        Ok(match phase.as_deref() {
            Some("Running") => Readiness::Ready,
            Some(p) if POD_TERMINAL_PHASES.contains(&p) => Readiness::Ready,
            other => Readiness::not_ready(format!("pod {} is {}", pod, other.unwrap_or("missing"))),
        })
    })
    .await
}

async fn final_phase(api: &dyn ClusterApi, cancel: &CancellationToken) -> Result<String> {
    let spec = PollSpec::new(SUITE_TIMEOUT).max_interval(Duration::from_secs(30));
    poll_until_ready(&spec, "the conformance tests to finish", cancel, || async {
        let phase = api.pod_phase(NAMESPACE, CONFORMANCE_POD).await?;
        Ok(match phase.as_deref() {
            Some(p) if POD_TERMINAL_PHASES.contains(&p) => Readiness::Ready,
            other => Readiness::not_ready(format!("suite pod is {}", other.unwrap_or("missing"))),
        })
    })
    .await?;
    Ok(api
        .pod_phase(NAMESPACE, CONFORMANCE_POD)
        .await?
        .unwrap_or_default())
}

/// Start the suite, stream its log, copy its results and check its verdict
pub async fn execute(
    api: &dyn ClusterApi,
    renderer: &TemplateRenderer,
    opts: &ConformanceOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(image = %conformance_image(&opts.kubernetes_version), "Starting the conformance tests");
    api.apply(&render_manifest(renderer, opts)?).await?;
    wait_pod_started(api, HELPER_POD, cancel).await?;
    wait_pod_started(api, CONFORMANCE_POD, cancel).await?;

    if let Err(e) = api
        .follow_logs(NAMESPACE, CONFORMANCE_POD, CONFORMANCE_POD)
        .await
    {
        warn!(error = %e, "Conformance log stream ended early");
    }
    let phase = final_phase(api, cancel).await?;

    let results = results_dir(&opts.artifacts_dir);
    if let Err(e) = api
        .copy_from_pod(NAMESPACE, HELPER_POD, OUTPUT_DIR, &results)
        .await
    {
        warn!(error = %e, "Failed to copy the conformance results");
    }

    if phase != "Succeeded" {
        return Err(Error::ConformanceTestsFailed { phase });
    }
    info!("The conformance tests passed");
    Ok(())
}

/// Prepare the cluster and run the suite
pub async fn run_conformance(
    api: &dyn ClusterApi,
    renderer: &TemplateRenderer,
    http: &reqwest::Client,
    opts: &ConformanceOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let repo_list = fetch_repo_list(http, &opts.repo_list, cancel).await?;
    prepare(api, &repo_list, opts).await?;
    execute(api, renderer, opts, cancel).await
}
