//! Azure Resource Manager adapter over the `az` CLI
//!
//! Requests go through `az rest`, which handles token acquisition for the
//! service principal logged in by [`AzureCli::login`]. Responses are raw ARM
//! JSON; a 404 shows up as a non-zero exit with a `NotFound` code on stderr.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    CloudProvisioner, GalleryImage, Operation, OperationAction, ResourceHandle, ResourceKind,
    ResourceRef, Usage, UsageScope,
};
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const AZ_TIMEOUT: Duration = Duration::from_secs(300);
const COMPUTE_API_VERSION: &str = "2023-07-01";
const NETWORK_API_VERSION: &str = "2023-05-01";
const GALLERY_API_VERSION: &str = "2022-03-03";

/// ARM error codes meaning the addressed resource does not exist.
///
/// Codes such as `SubscriptionNotFound` or `ParentResourceNotFound` describe a
/// broken environment and must surface as errors.
const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFound",
    "ResourceGroupNotFound",
    "NotFound",
];

/// Service principal credentials.
#[derive(Clone)]
pub struct AzureCredentials {
    /// Subscription all resources live in
    pub subscription_id: String,
    /// AAD tenant
    pub tenant_id: String,
    /// Application (client) id
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
}

impl std::fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// [`CloudProvisioner`] backed by `az rest`.
pub struct AzureCli {
    runner: Arc<dyn CommandRunner>,
    subscription_id: String,
    cancel: CancellationToken,
}

/// Whether `az` reported one of [`NOT_FOUND_CODES`] as the error code
fn is_not_found(output: &CommandOutput) -> bool {
    let stderr = output.stderr.replace(['"', ' '], "");
    NOT_FOUND_CODES.iter().any(|code| {
        stderr.contains(&format!("({})", code))
            || stderr.contains(&format!("code:{}", code))
            || stderr.contains(&format!("Code:{}", code))
    })
}

impl AzureCli {
    /// Create an adapter for `subscription_id`
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        subscription_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            subscription_id: subscription_id.into(),
            cancel,
        }
    }

    /// Log the CLI in as the service principal and select the subscription
    pub async fn login(&self, credentials: &AzureCredentials) -> Result<()> {
        info!(client_id = %credentials.client_id, "Logging in to Azure");
        let login = CommandSpec::new("az")
            .args([
                "login",
                "--service-principal",
                "--username",
                credentials.client_id.as_str(),
                "--password",
                credentials.client_secret.as_str(),
                "--tenant",
                credentials.tenant_id.as_str(),
                "--output",
                "none",
            ])
            .redacted()
            .timeout(AZ_TIMEOUT);
        self.runner.run(&login, &self.cancel).await?.check(&login)?;

        let select = CommandSpec::new("az")
            .args([
                "account",
                "set",
                "--subscription",
                credentials.subscription_id.as_str(),
            ])
            .timeout(AZ_TIMEOUT);
        self.runner.run(&select, &self.cancel).await?.check(&select)?;
        Ok(())
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}api-version={}",
            MANAGEMENT_ENDPOINT, path, separator, api_version
        )
    }

    /// Run `az rest`; `Ok(None)` on a 404
    async fn rest(&self, method: &str, url: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let mut spec = CommandSpec::new("az")
            .args(["rest", "--method", method, "--url", url])
            .timeout(AZ_TIMEOUT);
        if let Some(body) = body {
            spec = spec.args(["--body".to_string(), body.to_string()]);
        }
        debug!(method = %method, url = %url, "ARM request");

        let output = self.runner.run(&spec, &self.cancel).await?;
        if !output.success() {
            if is_not_found(&output) {
                return Ok(None);
            }
            return Err(Error::cloud(
                format!("{} {}", method, url),
                output.stderr.trim().to_string(),
            ));
        }
        let text = output.stdout_trimmed();
        if text.is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_str(text)?))
    }

    /// GET every page of a collection
    async fn list_values(&self, url: String) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let page = self.rest("get", &url, None).await?.unwrap_or(Value::Null);
            if let Some(values) = page.get("value").and_then(Value::as_array) {
                items.extend(values.iter().cloned());
            }
            next = page
                .get("nextLink")
                .and_then(Value::as_str)
                .map(String::from);
        }
        Ok(items)
    }

    fn child_reference(kind: ResourceKind, resource_group: &str, parent: Option<&str>, body: &Value) -> ResourceRef {
        let name = body
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match parent {
            Some(parent) => ResourceRef::nested(kind, resource_group, parent, name),
            None if kind == ResourceKind::ResourceGroup => ResourceRef::resource_group(name),
            None => ResourceRef::new(kind, resource_group, name),
        }
    }
}

#[async_trait]
impl CloudProvisioner for AzureCli {
    async fn create_or_update(&self, reference: &ResourceRef, body: &Value) -> Result<Operation> {
        let url = self.url(&reference.id(&self.subscription_id), reference.kind.api_version());
        self.rest("put", &url, Some(body)).await?.ok_or_else(|| {
            Error::cloud(
                "create_or_update",
                format!("parent of {} does not exist", reference),
            )
        })?;
        Ok(Operation {
            reference: reference.clone(),
            action: OperationAction::CreateOrUpdate,
        })
    }

    async fn get(&self, reference: &ResourceRef) -> Result<Option<ResourceHandle>> {
        let url = self.url(&reference.id(&self.subscription_id), reference.kind.api_version());
        Ok(self
            .rest("get", &url, None)
            .await?
            .map(|body| ResourceHandle::from_body(reference.clone(), body)))
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<Operation> {
        if self.get(reference).await?.is_none() {
            return Err(Error::not_found(reference.kind.to_string(), &reference.name));
        }
        let url = self.url(&reference.id(&self.subscription_id), reference.kind.api_version());
        self.rest("delete", &url, None)
            .await?
            .ok_or_else(|| Error::not_found(reference.kind.to_string(), &reference.name))?;
        Ok(Operation {
            reference: reference.clone(),
            action: OperationAction::Delete,
        })
    }

    async fn list(
        &self,
        kind: ResourceKind,
        resource_group: &str,
        parent: Option<String>,
    ) -> Result<Vec<ResourceHandle>> {
        let path = kind.collection_path(&self.subscription_id, resource_group, parent.as_deref());
        let values = self.list_values(self.url(&path, kind.api_version())).await?;
        Ok(values
            .into_iter()
            .map(|body| {
                let reference =
                    Self::child_reference(kind, resource_group, parent.as_deref(), &body);
                ResourceHandle::from_body(reference, body)
            })
            .collect())
    }

    async fn list_usage(&self, scope: UsageScope, location: &str) -> Result<Vec<Usage>> {
        let (provider, api_version) = match scope {
            UsageScope::Compute => ("Microsoft.Compute", COMPUTE_API_VERSION),
            UsageScope::Network => ("Microsoft.Network", NETWORK_API_VERSION),
        };
        let path = format!(
            "/subscriptions/{}/providers/{}/locations/{}/usages",
            self.subscription_id, provider, location
        );
        let values = self.list_values(self.url(&path, api_version)).await?;
        Ok(values
            .iter()
            .filter_map(|v| {
                Some(Usage {
                    name: v.pointer("/name/value")?.as_str()?.to_string(),
                    current: v.get("currentValue")?.as_f64()?,
                    limit: v.get("limit")?.as_f64()?,
                })
            })
            .collect())
    }

    async fn list_resource_groups(&self, tag: &str, value: &str) -> Result<Vec<ResourceHandle>> {
        let path = format!(
            "/subscriptions/{}/resourcegroups?$filter=tagName eq '{}' and tagValue eq '{}'",
            self.subscription_id, tag, value
        );
        let values = self
            .list_values(self.url(&path, ResourceKind::ResourceGroup.api_version()))
            .await?;
        Ok(values
            .into_iter()
            .map(|body| {
                let reference =
                    Self::child_reference(ResourceKind::ResourceGroup, "", None, &body);
                ResourceHandle::from_body(reference, body)
            })
            .collect())
    }

    async fn invoke(&self, reference: &ResourceRef, action: &str) -> Result<Value> {
        let path = format!("{}/{}", reference.id(&self.subscription_id), action);
        let url = self.url(&path, reference.kind.api_version());
        self.rest("post", &url, None)
            .await?
            .ok_or_else(|| Error::not_found(reference.kind.to_string(), &reference.name))
    }

    async fn latest_gallery_image_version(
        &self,
        image: &GalleryImage,
        prefix: &str,
    ) -> Result<String> {
        let path = format!(
            "/subscriptions/{}/providers/Microsoft.Compute/locations/{}/communityGalleries/{}/images/{}/versions",
            self.subscription_id, image.location, image.gallery, image.image
        );
        let values = self.list_values(self.url(&path, GALLERY_API_VERSION)).await?;
        latest_version_with_prefix(
            values
                .iter()
                .filter_map(|v| v.get("name").and_then(Value::as_str)),
            prefix,
        )
        .ok_or_else(|| {
            Error::not_found(
                "gallery image version",
                format!("{}/{} with prefix {}", image.gallery, image.image, prefix),
            )
        })
    }
}

/// Highest version (by dotted numeric order) among `versions` starting with `prefix`
pub fn latest_version_with_prefix<'a>(
    versions: impl Iterator<Item = &'a str>,
    prefix: &str,
) -> Option<String> {
    fn numeric(v: &str) -> Vec<u64> {
        v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    }
    versions
        .filter(|v| v.starts_with(prefix))
        .max_by_key(|v| numeric(v))
        .map(String::from)
}
