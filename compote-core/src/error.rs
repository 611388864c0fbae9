//! Error types for compote.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for compote operations.
pub type Result<T> = std::result::Result<T, CompoteError>;

/// Main error type for compote.
#[derive(Error, Debug)]
pub enum CompoteError {
    // Manifest errors
    #[error("compose file defines no services")]
    NoServices,

    #[error("compose parse error: {reason}")]
    ManifestParse { reason: String },

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("circular dependency: {path}")]
    CircularDependency { path: String },

    #[error(
        "missing dependency: service '{service}' depends on '{dependency}' which does not exist"
    )]
    MissingDependency { service: String, dependency: String },

    #[error("service '{service}' references undefined {kind} '{reference}'")]
    UnresolvedReference { service: String, kind: &'static str, reference: String },

    #[error("external {kind} '{name}' is not supported")]
    ExternalNotSupported { kind: &'static str, name: String },

    #[error("malformed environment file {file} at line {line}: {reason}")]
    EnvFileParse { file: String, line: usize, reason: String },

    // Grammar errors
    #[error("invalid port mapping '{spec}': expected [hostIP:]hostPort:containerPort[/proto]")]
    InvalidPortFormat { spec: String },

    #[error("unsupported protocol '{proto}' in port mapping '{spec}'")]
    UnsupportedProtocol { spec: String, proto: String },

    #[error("invalid mount spec '{spec}': expected src[:dst[:ro]]")]
    InvalidMount { spec: String },

    #[error("invalid service selector '{selector}': expected service[#replica]")]
    InvalidServiceSelector { selector: String },

    #[error("invalid scale target '{target}': expected service=replicas")]
    InvalidScale { target: String },

    // Lifecycle misuse
    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("service '{service}' is not running (use `up` or `start` to run it)")]
    ServiceNotRunning { service: String },

    #[error("replica {replica} of service '{service}' does not exist (scale up to create it)")]
    ServiceReplicaNotFound { service: String, replica: u32 },

    // Capability errors
    #[error("failed to start service '{service}': {source}")]
    FailedToStart {
        service: String,
        #[source]
        source: Box<CompoteError>,
    },

    #[error("failed to stop service '{service}': {source}")]
    FailedToStop {
        service: String,
        #[source]
        source: Box<CompoteError>,
    },

    #[error("port forwarding failed: {detail}")]
    PortForwardingFailed { detail: String },

    #[error("relay tool '{tool}' not found on PATH (install it or adjust PATH)")]
    RelayToolMissing { tool: String },

    #[error("runtime command `{command}` failed: {detail}")]
    RuntimeCommand { command: String, detail: String },

    // Healthcheck errors
    #[error("service '{service}' failed its healthcheck")]
    Unhealthy { service: String },

    #[error("timed out waiting for service '{service}' to become healthy")]
    HealthTimeout { service: String },

    // State errors
    #[error("project state error: {reason}")]
    State { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompoteError {
    /// Wrap a cause into a `FailedToStart` for the given service.
    pub fn failed_to_start(service: impl Into<String>, cause: CompoteError) -> Self {
        Self::FailedToStart { service: service.into(), source: Box::new(cause) }
    }

    /// Wrap a cause into a `FailedToStop` for the given service.
    pub fn failed_to_stop(service: impl Into<String>, cause: CompoteError) -> Self {
        Self::FailedToStop { service: service.into(), source: Box::new(cause) }
    }
}
