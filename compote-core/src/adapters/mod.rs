//! Runtime capability abstractions.
//!
//! The orchestration core never touches the VM, image registry, or host
//! network directly; every runtime effect goes through one of these injected
//! traits. The shipped implementation (`container` CLI shell-out) lives in
//! [`container`]; tests substitute in-memory fakes.

use crate::error::{CompoteError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod container;

pub use container::{ContainerTool, FsVolumeStore, HostSupervisor};

/// Default container root filesystem size.
pub const DEFAULT_ROOTFS_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Image store capability: pull, build, and push images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Ensure `reference` is available locally and return the reference the
    /// runtime should create containers from. Idempotent; the reference is
    /// accepted verbatim (no short-name rewriting in the core).
    async fn pull(&self, reference: &str) -> Result<String>;

    /// Build an image from a context directory and tag it.
    async fn build(
        &self,
        context: &Path,
        dockerfile: &str,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Push a local image to its registry.
    async fn push(&self, reference: &str) -> Result<()>;
}

/// Named volume capability.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Create a named volume (idempotent) and return its host path.
    async fn create(&self, name: &str, driver: &str, external: bool) -> Result<PathBuf>;

    /// Remove a named volume. No-op if absent; external volumes are skipped.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Network capability.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Create a network (idempotent).
    async fn create(&self, name: &str, driver: &str) -> Result<()>;

    /// Attach a container to a network, returning its assigned address.
    async fn connect(&self, container_id: &str, network: &str) -> Result<IpAddr>;

    /// Remove a network. Warns (does not fail) if still non-empty.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// One line from a container log stream.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub text: String,
    /// Whether the line came from stderr.
    pub stderr: bool,
}

/// A handle to one container this process has created or attached to.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Container id.
    fn id(&self) -> &str;

    async fn start(&self) -> Result<()>;

    /// Graceful stop with the given timeout before the runtime force-kills.
    async fn stop(&self, timeout: Duration) -> Result<()>;

    async fn delete(&self) -> Result<()>;

    /// Block until the container exits; returns its exit code.
    async fn wait(&self) -> Result<i64>;

    /// Run a command inside the container; returns its exit code. Output is
    /// streamed into the container's log buffer.
    async fn exec(&self, argv: &[String], env: &[String]) -> Result<i64>;

    /// Stream log lines: the last `tail` buffered lines (all when `None`),
    /// continuing live when `follow`.
    async fn logs(&self, tail: Option<usize>, follow: bool) -> Result<mpsc::Receiver<LogLine>>;

    async fn is_running(&self) -> bool;
}

/// Container runtime capability: create containers and re-attach to existing
/// ones.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return a handle to it. The container is created
    /// stopped; call [`ContainerHandle::start`] to run it.
    async fn create(
        &self,
        id: &str,
        image: &str,
        rootfs_bytes: u64,
        read_only: bool,
        config: &ContainerConfig,
    ) -> Result<Arc<dyn ContainerHandle>>;

    /// Attach to a container created by another process. Returns `None` when
    /// the runtime no longer knows the id.
    async fn attach(&self, id: &str) -> Result<Option<Arc<dyn ContainerHandle>>>;
}

/// Supervisor for host-side helper processes (port relays).
pub trait ProcessSupervisor: Send + Sync {
    /// Spawn a detached child with null stdio; returns its pid.
    fn spawn(&self, argv: &[String]) -> Result<u32>;

    /// Send a graceful termination signal. Best-effort: a dead or foreign pid
    /// is not an error.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Whether `tool` resolves on PATH.
    fn which(&self, tool: &str) -> bool;
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Display name.
    pub name: String,

    /// Hostname inside the container.
    pub hostname: String,

    /// Entrypoint override (empty: image default).
    pub entrypoint: Vec<String>,

    /// Command override (empty: image default).
    pub command: Vec<String>,

    /// `KEY=VALUE` environment entries, sorted.
    pub env: Vec<String>,

    pub working_dir: Option<String>,
    pub user: Option<String>,

    /// Resolved filesystem mounts.
    pub mounts: Vec<ResolvedMount>,

    /// Tmpfs targets.
    pub tmpfs: Vec<String>,

    /// Whole-core CPU limit.
    pub cpus: Option<u32>,

    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,

    /// Static hosts table entries, sorted by name.
    pub hosts: Vec<HostEntry>,

    /// Network to attach to.
    pub network: String,

    /// Address assigned by the network capability.
    pub ip: Option<IpAddr>,

    pub labels: BTreeMap<String, String>,
}

/// One `/etc/hosts` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub name: String,
}

/// A mount resolved to a concrete host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// A raw `src[:dst[:ro]]` mount spec from the manifest.
///
/// A source beginning with `/`, `.`, or `~` is a bind mount; any other source
/// names a volume. A single-element spec mounts an anonymous volume at the
/// given path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    /// Parse a mount spec.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || CompoteError::InvalidMount { spec: spec.to_string() };

        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [target] => (None, *target, false),
            [source, target] => (Some(*source), *target, false),
            [source, target, "ro"] => (Some(*source), *target, true),
            [source, target, "rw"] => (Some(*source), *target, false),
            _ => return Err(invalid()),
        };

        if target.is_empty() || source.map(str::is_empty).unwrap_or(false) {
            return Err(invalid());
        }

        Ok(Self {
            source: source.map(str::to_string),
            target: target.to_string(),
            read_only,
        })
    }

    /// Whether the source is a host path rather than a volume name.
    pub fn is_bind(&self) -> bool {
        self.source
            .as_deref()
            .map(|s| s.starts_with('/') || s.starts_with('.') || s.starts_with('~'))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_spec_bind() {
        let spec = MountSpec::parse("./data:/data").unwrap();
        assert_eq!(spec.source.as_deref(), Some("./data"));
        assert_eq!(spec.target, "/data");
        assert!(!spec.read_only);
        assert!(spec.is_bind());
    }

    #[test]
    fn test_mount_spec_named_readonly() {
        let spec = MountSpec::parse("pgdata:/var/lib/postgresql/data:ro").unwrap();
        assert_eq!(spec.source.as_deref(), Some("pgdata"));
        assert!(spec.read_only);
        assert!(!spec.is_bind());
    }

    #[test]
    fn test_mount_spec_home_and_absolute_are_binds() {
        assert!(MountSpec::parse("~/src:/src").unwrap().is_bind());
        assert!(MountSpec::parse("/etc/ssl:/etc/ssl:ro").unwrap().is_bind());
    }

    #[test]
    fn test_mount_spec_anonymous() {
        let spec = MountSpec::parse("/var/cache").unwrap();
        assert_eq!(spec.source, None);
        assert_eq!(spec.target, "/var/cache");
    }

    #[test]
    fn test_mount_spec_invalid() {
        for bad in ["", "a:b:rx", "a:b:c:d", ":/data"] {
            assert!(
                matches!(MountSpec::parse(bad), Err(CompoteError::InvalidMount { .. })),
                "expected parse failure for {bad:?}"
            );
        }
    }
}
