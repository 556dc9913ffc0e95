//! Kubeconfig helpers
//!
//! The runner only ever needs two things from a kubeconfig: the API server
//! endpoint of its first cluster, and the ability to point that cluster at a
//! different server (the management kubeconfig is generated on the bootstrap
//! VM with a loopback address).

use std::fmt;
use std::path::Path;

use serde_yaml::Value;

use crate::error::{Error, Result};

/// Host and port of a Kubernetes API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse an API server URL into an [`Endpoint`].
///
/// A URL without a port gets the scheme default (80 for http, 443 for https).
/// Any other scheme is a configuration error.
pub fn parse_server(server: &str) -> Result<Endpoint> {
    let (scheme, rest) = server
        .split_once("://")
        .ok_or_else(|| Error::configuration(format!("invalid server URL: {}", server)))?;

    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        other => {
            return Err(Error::configuration(format!(
                "found endpoint scheme {}, but only http or https are valid",
                other
            )))
        }
    };

    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| Error::configuration(format!("invalid IPv6 host in {}", server)))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(Error::configuration(format!("no host in server URL {}", server)));
    }

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| Error::configuration(format!("invalid port in server URL {}", server)))?,
        None => default_port,
    };

    Ok(Endpoint::new(host, port))
}

fn first_cluster_mut(config: &mut Value) -> Option<&mut Value> {
    config
        .get_mut("clusters")?
        .as_sequence_mut()?
        .first_mut()?
        .get_mut("cluster")
}

/// API server URL of the first cluster in a kubeconfig document
pub fn server_url(kubeconfig: &str) -> Result<String> {
    let config: Value = serde_yaml::from_str(kubeconfig)?;
    config
        .get("clusters")
        .and_then(Value::as_sequence)
        .and_then(|clusters| clusters.first())
        .and_then(|c| c.get("cluster"))
        .and_then(|c| c.get("server"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::configuration("kubeconfig has no cluster server"))
}

/// API server endpoint of the kubeconfig file at `path`
pub fn read_endpoint(path: &Path) -> Result<Endpoint> {
    let contents = std::fs::read_to_string(path)?;
    parse_server(&server_url(&contents)?)
}

/// Return `kubeconfig` with the first cluster pointed at `server`
pub fn with_server(kubeconfig: &str, server: &str) -> Result<String> {
    let mut config: Value = serde_yaml::from_str(kubeconfig)?;
    let cluster = first_cluster_mut(&mut config)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| Error::configuration("kubeconfig has no clusters"))?;
    cluster.insert(Value::from("server"), Value::from(server));
    Ok(serde_yaml::to_string(&config)?)
}

/// Rewrite the kubeconfig file at `path` in place to use `server`
pub fn rewrite_server(path: &Path, server: &str) -> Result<()> {
    let contents = std::fs::read_to_string(path)?;
    std::fs::write(path, with_server(&contents, server)?)?;
    Ok(())
}

/// Write a kubeconfig readable only by the current user
pub fn write_private(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const KIND_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: Zm9v
    server: https://127.0.0.1:36243
  name: kind-kind
contexts:
- context:
    cluster: kind-kind
    user: kind-kind
  name: kind-kind
current-context: kind-kind
users:
- name: kind-kind
  user:
    token: abc
"#;

    #[test]
    fn explicit_ports_are_kept() {
        assert_eq!(
            parse_server("https://20.1.2.3:6443").unwrap(),
            Endpoint::new("20.1.2.3", 6443)
        );
    }

    #[test]
    fn missing_ports_default_per_scheme() {
        assert_eq!(parse_server("https://capz.example.com").unwrap().port, 443);
        assert_eq!(parse_server("http://capz.example.com/").unwrap().port, 80);
    }

    #[test]
    fn ipv6_hosts_are_unbracketed() {
        assert_eq!(
            parse_server("https://[fd00::1]:6443").unwrap(),
            Endpoint::new("fd00::1", 6443)
        );
    }

    #[test]
    fn unknown_schemes_are_configuration_errors() {
        let err = parse_server("ftp://10.0.0.1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn server_rewrite_keeps_everything_else() {
        let rewritten = with_server(KIND_KUBECONFIG, "https://52.10.0.9:6443").unwrap();
        assert_eq!(server_url(&rewritten).unwrap(), "https://52.10.0.9:6443");
        assert!(rewritten.contains("certificate-authority-data"));
        assert!(rewritten.contains("kind-kind"));
    }

    #[test]
    fn endpoint_is_read_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        write_private(&path, KIND_KUBECONFIG).unwrap();
        assert_eq!(read_endpoint(&path).unwrap(), Endpoint::new("127.0.0.1", 36243));
    }
}
