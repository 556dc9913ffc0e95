//! Error types for the e2e runner
//!
//! Errors carry enough context (target host, resource name, versions) to be
//! actionable from a CI log alone. Each variant maps to an [`ErrorKind`] which
//! retry policies use to decide between retrying and failing fast.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using the runner [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`], used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A remote command ran and exited non-zero
    RemoteCommandFailed,
    /// The transport could not reach the remote host
    ConnectionFailed,
    /// A command exceeded its wall-clock budget
    CommandTimeout,
    /// A poll did not observe readiness within its budget
    PollTimeout,
    /// The run was cancelled externally
    Cancelled,
    /// A node reports an unexpected component version
    VersionMismatch,
    /// A node runs container images that were not built by this run
    NonCiImage,
    /// The conformance suite did not succeed
    ConformanceTestsFailed,
    /// A build step failed or an unknown build target was requested
    BuildFailed,
    /// Missing or malformed configuration
    Configuration,
    /// A resource entered a state it cannot recover from
    InvalidState,
    /// Cloud provisioning API failure
    Cloud,
    /// A resource does not exist
    NotFound,
    /// Cluster control-plane API failure
    ControlPlane,
    /// A local command failed
    CommandFailed,
    /// Manifest rendering failed
    Template,
    /// Local filesystem failure
    Io,
    /// Serialization or parsing failure
    Serialization,
}

/// Main error type for runner operations
#[derive(Debug, Error)]
pub enum Error {
    /// A remote command ran and returned a non-zero exit status
    #[error("remote command failed on {target} (exit code {exit_code}): {stderr}")]
    RemoteCommandFailed {
        /// Remote host the command ran on
        target: String,
        /// Exit status reported by the remote shell
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// The transport could not establish or keep a connection
    #[error("connection to {target} failed: {message}")]
    ConnectionFailed {
        /// Host that could not be reached
        target: String,
        /// Transport diagnostic
        message: String,
    },

    /// A command ran longer than its timeout
    #[error("command `{command}` exceeded timeout of {timeout:?}")]
    CommandTimeout {
        /// Command line that timed out
        command: String,
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// A poll did not observe readiness in time
    #[error("timed out after {timeout:?} waiting for {description}: {last_reason}")]
    PollTimeout {
        /// What was being waited for
        description: String,
        /// Poll budget
        timeout: Duration,
        /// Last not-ready reason observed
        last_reason: String,
    },

    /// The run was cancelled
    #[error("cancelled while running {operation}")]
    Cancelled {
        /// Operation in flight when cancellation was observed
        operation: String,
    },

    /// An operation kept failing until its retry budget ran out
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Operation name
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        #[source]
        source: Box<Error>,
    },

    /// One or more per-node operations failed
    #[error("{operation} failed on {failed:?}: {first}")]
    NodeFailures {
        /// Operation name
        operation: String,
        /// Nodes that failed
        failed: Vec<String>,
        /// First failure observed
        first: Box<Error>,
    },

    /// A node reports a component version different from the expected one
    #[error("wrong {component} version on node {node}: expected {expected}, but found {found}")]
    VersionMismatch {
        /// Node name
        node: String,
        /// Component (kubelet or kube-proxy)
        component: String,
        /// Expected version string
        expected: String,
        /// Version reported by the node
        found: String,
    },

    /// A node carries control-plane images not built by this run
    #[error("found non-CI container images on node {node}: {images:?}")]
    NonCiImage {
        /// Node name
        node: String,
        /// Offending image names
        images: Vec<String>,
    },

    /// The conformance suite finished without success
    #[error("the end-to-end conformance tests failed (pod phase {phase})")]
    ConformanceTestsFailed {
        /// Final phase of the conformance pod
        phase: String,
    },

    /// A build failed or was not recognised
    #[error("build failed [{target}]: {message}")]
    BuildFailed {
        /// Build target name
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Missing or malformed configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what is wrong
        message: String,
    },

    /// A resource reached an unrecoverable state
    #[error("{resource} entered invalid state '{state}'")]
    InvalidState {
        /// Resource description
        resource: String,
        /// Observed state
        state: String,
    },

    /// Cloud provisioning API failure
    #[error("cloud error [{context}]: {message}")]
    Cloud {
        /// Operation context (e.g. "create_resource_group")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Cluster control-plane failure outside kube-rs
    #[error("kubernetes error [{context}]: {message}")]
    ControlPlane {
        /// Operation context
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A local command failed
    #[error("command failed: {message}")]
    CommandFailed {
        /// Description of what failed
        message: String,
    },

    /// Manifest rendering error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify this error. Wrapping variants report the kind of the error they wrap.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RemoteCommandFailed { .. } => ErrorKind::RemoteCommandFailed,
            Error::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Error::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            Error::PollTimeout { .. } => ErrorKind::PollTimeout,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::RetriesExhausted { source, .. } => source.kind(),
            Error::NodeFailures { first, .. } => first.kind(),
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::NonCiImage { .. } => ErrorKind::NonCiImage,
            Error::ConformanceTestsFailed { .. } => ErrorKind::ConformanceTestsFailed,
            Error::BuildFailed { .. } => ErrorKind::BuildFailed,
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::Cloud { .. } => ErrorKind::Cloud,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::ControlPlane { .. } | Error::Kube { .. } => ErrorKind::ControlPlane,
            Error::CommandFailed { .. } => ErrorKind::CommandFailed,
            Error::Template(_) => ErrorKind::Template,
            Error::Io(_) => ErrorKind::Io,
            Error::Yaml(_) | Error::Json(_) => ErrorKind::Serialization,
        }
    }

    /// Whether this error is a hard validation failure that must never be retried
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::VersionMismatch | ErrorKind::NonCiImage | ErrorKind::ConformanceTestsFailed
        )
    }

    /// Whether this error is a Kubernetes 404
    pub fn is_kube_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cloud API error with context
    pub fn cloud(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cloud {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a control-plane error with context
    pub fn control_plane(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ControlPlane {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a local command failure
    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::CommandFailed {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a cancellation error for the named operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a build failure
    pub fn build_failed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BuildFailed {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(resource: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidState {
            resource: resource.into(),
            state: state.into(),
        }
    }
}

/// Extension trait to convert errors with Display into [`Error::CommandFailed`].
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story: Errors carry the context a CI log reader needs
    // ==========================================================================

    #[test]
    fn story_version_mismatch_names_node_and_both_versions() {
        let err = Error::VersionMismatch {
            node: "capz-win-abc12".to_string(),
            component: "kubelet".to_string(),
            expected: "v1.27.1".to_string(),
            found: "v1.27.0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("capz-win-abc12"));
        assert!(msg.contains("v1.27.1"));
        assert!(msg.contains("v1.27.0"));
        assert!(err.is_validation_failure());
    }

    #[test]
    fn story_remote_failures_keep_exit_code_and_stderr() {
        let err = Error::RemoteCommandFailed {
            target: "capi@10.1.0.4".to_string(),
            exit_code: 2,
            stderr: "make: *** No rule to make target".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RemoteCommandFailed);
        assert!(err.to_string().contains("exit code 2"));
        assert!(err.to_string().contains("No rule to make target"));
    }

    // ==========================================================================
    // Story: Wrapping errors keep the classification of what they wrap
    // ==========================================================================

    #[test]
    fn when_retries_exhausted_kind_is_the_last_error_kind() {
        let err = Error::RetriesExhausted {
            operation: "ssh".to_string(),
            attempts: 5,
            source: Box::new(Error::ConnectionFailed {
                target: "capi@20.1.2.3".to_string(),
                message: "Connection refused".to_string(),
            }),
        };
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(err.to_string().contains("5 attempts"));
        assert!(err.to_string().contains("Connection refused"));
    }

    #[test]
    fn when_node_failures_aggregate_kind_is_the_first_failure_kind() {
        let err = Error::NodeFailures {
            operation: "install patches".to_string(),
            failed: vec!["10.1.0.4".to_string(), "10.1.0.5".to_string()],
            first: Box::new(Error::cancelled("scp")),
        };
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.to_string().contains("10.1.0.5"));
    }

    #[test]
    fn when_converting_display_errors_cmd_err_uses_command_failed() {
        let result: std::result::Result<(), &str> = Err("helm: not found");
        let err = result.cmd_err().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert!(err.to_string().contains("helm: not found"));
    }

    #[test]
    fn configuration_errors_are_not_validation_failures() {
        let err = Error::configuration("AZURE_CLIENT_SECRET is empty");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_validation_failure());
    }
}
