//! Manifest rendering
//!
//! Templates are minijinja sources named `*.yaml.j2`. They are looked up in
//! the configured search paths first and fall back to the copies embedded in
//! the binary, so a run works without a checkout while a CI job can still
//! override a manifest by pointing `--templates-dir` at its own copy.
//!
//! The context is a flat map of strings. Booleans go through [`flag`] and
//! render as `"true"`/`"false"`; lists are passed as JSON and read back with
//! the `from_json` filter. Undefined variables are an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Rendering context
pub type TemplateContext = BTreeMap<String, String>;

/// Workload cluster (Cluster API on Azure) manifest
pub const CLUSTER_TEMPLATE: &str = "cluster.yaml.j2";
/// Flannel DaemonSet for Windows nodes
pub const FLANNEL_WINDOWS_TEMPLATE: &str = "kube-flannel-windows.yaml.j2";
/// kube-proxy DaemonSet for Windows nodes
pub const KUBE_PROXY_WINDOWS_TEMPLATE: &str = "kube-proxy-windows.yaml.j2";
/// Conformance helper and test pods
pub const CONFORMANCE_TEMPLATE: &str = "conformance.yaml.j2";

const EMBEDDED: &[(&str, &str)] = &[
    (
        CLUSTER_TEMPLATE,
        include_str!("../templates/cluster.yaml.j2"),
    ),
    (
        FLANNEL_WINDOWS_TEMPLATE,
        include_str!("../templates/kube-flannel-windows.yaml.j2"),
    ),
    (
        KUBE_PROXY_WINDOWS_TEMPLATE,
        include_str!("../templates/kube-proxy-windows.yaml.j2"),
    ),
    (
        CONFORMANCE_TEMPLATE,
        include_str!("../templates/conformance.yaml.j2"),
    ),
];

/// Render a boolean the way manifests expect it
pub fn flag(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn from_json(value: &str) -> std::result::Result<Value, minijinja::Error> {
    serde_json::from_str::<serde_json::Value>(value)
        .map(|v| Value::from_serialize(&v))
        .map_err(|e| {
            minijinja::Error::new(
                ErrorKind::InvalidOperation,
                format!("from_json: {}", e),
            )
        })
}

fn base64_encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Renders manifests from search paths or embedded defaults.
pub struct TemplateRenderer {
    search_paths: Vec<PathBuf>,
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl TemplateRenderer {
    /// Create a renderer that looks in `search_paths` before the embedded set
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("from_json", from_json);
        env.add_filter("base64_encode", base64_encode);
        Self { search_paths, env }
    }

    fn source(&self, name: &str) -> Result<String> {
        for dir in &self.search_paths {
            let candidate = dir.join(name);
            if candidate.is_file() {
                debug!(template = %candidate.display(), "Using template from search path");
                return Ok(std::fs::read_to_string(candidate)?);
            }
        }
        EMBEDDED
            .iter()
            .find(|(embedded, _)| *embedded == name)
            .map(|(_, source)| source.to_string())
            .ok_or_else(|| Error::not_found("template", name))
    }

    /// Render template `name` with `context`
    pub fn render(&self, name: &str, context: &TemplateContext) -> Result<String> {
        let source = self.source(name)?;
        Ok(self.env.render_str(&source, context)?)
    }

    /// Render template `name` into `output`
    pub fn render_to_file(
        &self,
        name: &str,
        context: &TemplateContext,
        output: &Path,
    ) -> Result<()> {
        let rendered = self.render(name, context)?;
        std::fs::write(output, rendered)?;
        Ok(())
    }
}

/// Build a [`TemplateContext`] from key/value pairs
pub fn context<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> TemplateContext
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind as RunnerErrorKind;

    fn kube_proxy_context(dsr: bool) -> TemplateContext {
        context([
            ("cni_version", "v1.4.0".to_string()),
            ("kube_proxy_from_host", flag(false)),
            ("container_image_tag", "v1.28.4".to_string()),
            ("container_image_registry", "ghcr.io/e2e".to_string()),
            ("enable_win_dsr", flag(dsr)),
        ])
    }

    #[test]
    fn flags_render_as_lowercase_words() {
        assert_eq!(flag(true), "true");
        assert_eq!(flag(false), "false");
    }

    #[test]
    fn kube_proxy_manifest_carries_the_dsr_flag() {
        let renderer = TemplateRenderer::default();
        let on = renderer
            .render(KUBE_PROXY_WINDOWS_TEMPLATE, &kube_proxy_context(true))
            .unwrap();
        let off = renderer
            .render(KUBE_PROXY_WINDOWS_TEMPLATE, &kube_proxy_context(false))
            .unwrap();
        assert!(on.contains("WinDSR=true"));
        assert!(off.contains("WinDSR=false"));
        assert!(on.contains("ghcr.io/e2e"));
    }

    #[test]
    fn when_a_variable_is_missing_rendering_fails() {
        let renderer = TemplateRenderer::default();
        let err = renderer
            .render(KUBE_PROXY_WINDOWS_TEMPLATE, &TemplateContext::new())
            .unwrap_err();
        assert_eq!(err.kind(), RunnerErrorKind::Template);
    }

    #[test]
    fn unknown_templates_are_not_found() {
        let err = TemplateRenderer::default()
            .render("nope.yaml.j2", &TemplateContext::new())
            .unwrap_err();
        assert_eq!(err.kind(), RunnerErrorKind::NotFound);
    }

    #[test]
    fn search_paths_take_precedence_over_embedded_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(KUBE_PROXY_WINDOWS_TEMPLATE),
            "dsr: {{ enable_win_dsr }}",
        )
        .unwrap();
        let renderer = TemplateRenderer::new(vec![dir.path().to_path_buf()]);
        let out = renderer
            .render(KUBE_PROXY_WINDOWS_TEMPLATE, &kube_proxy_context(true))
            .unwrap();
        assert_eq!(out, "dsr: true");
    }

    #[test]
    fn json_lists_are_iterable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("list.j2"),
            "{% for f in flags | from_json %}[{{ f }}]{% endfor %}",
        )
        .unwrap();
        let renderer = TemplateRenderer::new(vec![dir.path().to_path_buf()]);
        let out = renderer
            .render("list.j2", &context([("flags", r#"["--a=1","--b"]"#)]))
            .unwrap();
        assert_eq!(out, "[--a=1][--b]");
    }

    #[test]
    fn render_to_file_writes_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("kube-proxy.yaml");
        TemplateRenderer::default()
            .render_to_file(KUBE_PROXY_WINDOWS_TEMPLATE, &kube_proxy_context(false), &out)
            .unwrap();
        assert!(std::fs::read_to_string(out).unwrap().contains("kube-proxy"));
    }
}
