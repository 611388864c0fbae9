//! Capability implementations backed by the host `container` CLI.
//!
//! Thin wrappers: each call shells out to one `container` subcommand via
//! `tokio::process` and maps failures to typed errors. The binary name can be
//! overridden with `COMPOTE_RUNTIME_BIN`.

use super::{
    ContainerConfig, ContainerHandle, ContainerRuntime, ImageStore, LogLine, NetworkBackend,
    ProcessSupervisor, VolumeStore,
};
use crate::error::{CompoteError, Result};
use crate::paths;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Default runtime binary.
const DEFAULT_RUNTIME_BIN: &str = "container";

/// Runtime driven through the `container` CLI.
///
/// Implements the image, network, and container capabilities; named volumes
/// are handled by [`FsVolumeStore`] and host processes by [`HostSupervisor`].
#[derive(Clone)]
pub struct ContainerTool {
    bin: String,
}

impl ContainerTool {
    pub fn new() -> Self {
        let bin = std::env::var("COMPOTE_RUNTIME_BIN")
            .unwrap_or_else(|_| DEFAULT_RUNTIME_BIN.to_string());
        Self { bin }
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Run a subcommand to completion, returning trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        run_capture(&self.bin, args).await
    }
}

impl Default for ContainerTool {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_capture(bin: &str, args: &[&str]) -> Result<String> {
    let rendered = format!("{} {}", bin, args.join(" "));
    debug!(command = %rendered, "Running runtime command");

    let output = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CompoteError::RuntimeCommand {
            command: rendered.clone(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CompoteError::RuntimeCommand {
            command: rendered,
            detail: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether a failed idempotent operation can be treated as success.
fn already_satisfied(err: &CompoteError, needle: &str) -> bool {
    matches!(err, CompoteError::RuntimeCommand { detail, .. } if detail.contains(needle))
}

#[async_trait]
impl ImageStore for ContainerTool {
    #[instrument(skip(self))]
    async fn pull(&self, reference: &str) -> Result<String> {
        self.run(&["image", "pull", reference]).await?;
        Ok(reference.to_string())
    }

    #[instrument(skip(self, build_args))]
    async fn build(
        &self,
        context: &Path,
        dockerfile: &str,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> Result<String> {
        let context = context.to_string_lossy().to_string();
        let mut args = vec!["build", "-t", tag, "-f", dockerfile];

        let rendered: Vec<String> =
            build_args.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        for arg in &rendered {
            args.push("--build-arg");
            args.push(arg);
        }
        args.push(&context);

        self.run(&args).await?;
        Ok(tag.to_string())
    }

    #[instrument(skip(self))]
    async fn push(&self, reference: &str) -> Result<()> {
        self.run(&["image", "push", reference]).await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkBackend for ContainerTool {
    #[instrument(skip(self))]
    async fn create(&self, name: &str, driver: &str) -> Result<()> {
        match self.run(&["network", "create", "--driver", driver, name]).await {
            Ok(_) => Ok(()),
            Err(e) if already_satisfied(&e, "already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn connect(&self, container_id: &str, network: &str) -> Result<IpAddr> {
        self.run(&["network", "connect", network, container_id]).await?;

        let inspected = self.run(&["inspect", container_id]).await?;
        let value: Value = serde_json::from_str(&inspected).map_err(|e| {
            CompoteError::Internal(format!("unparseable inspect output for {container_id}: {e}"))
        })?;

        find_ip(&value).ok_or_else(|| {
            CompoteError::Internal(format!("no address reported for {container_id} on {network}"))
        })
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<()> {
        if let Err(e) = self.run(&["network", "rm", name]).await {
            if already_satisfied(&e, "not found") {
                return Ok(());
            }
            warn!(network = %name, error = %e, "Failed to remove network");
        }
        Ok(())
    }
}

/// Find the first IP-looking value in an inspect document, tolerating both
/// `address` and `IPAddress`-style keys and CIDR-suffixed values.
fn find_ip(value: &Value) -> Option<IpAddr> {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let lowered = key.to_ascii_lowercase();
                if lowered.contains("address") {
                    if let Some(ip) = v.as_str().and_then(parse_ip) {
                        return Some(ip);
                    }
                }
            }
            map.values().find_map(find_ip)
        }
        Value::Array(items) => items.iter().find_map(find_ip),
        _ => None,
    }
}

fn parse_ip(s: &str) -> Option<IpAddr> {
    let bare = s.split('/').next().unwrap_or(s);
    bare.parse().ok()
}

#[async_trait]
impl ContainerRuntime for ContainerTool {
    #[instrument(skip(self, config), fields(name = %config.name))]
    async fn create(
        &self,
        id: &str,
        image: &str,
        rootfs_bytes: u64,
        read_only: bool,
        config: &ContainerConfig,
    ) -> Result<Arc<dyn ContainerHandle>> {
        let rootfs = rootfs_bytes.to_string();
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            id.into(),
            "--hostname".into(),
            config.hostname.clone(),
            "--rootfs-size".into(),
            rootfs,
        ];

        if read_only {
            args.push("--read-only".into());
        }
        if let Some(dir) = &config.working_dir {
            args.push("-w".into());
            args.push(dir.clone());
        }
        if let Some(user) = &config.user {
            args.push("-u".into());
            args.push(user.clone());
        }
        for entry in &config.env {
            args.push("-e".into());
            args.push(entry.clone());
        }
        for mount in &config.mounts {
            let mut spec = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.push("-v".into());
            args.push(spec);
        }
        for target in &config.tmpfs {
            args.push("--tmpfs".into());
            args.push(target.clone());
        }
        if let Some(cpus) = config.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(memory) = config.memory_bytes {
            args.push("--memory".into());
            args.push(memory.to_string());
        }
        if !config.network.is_empty() {
            args.push("--network".into());
            args.push(config.network.clone());
        }
        if let Some(ip) = config.ip {
            args.push("--ip".into());
            args.push(ip.to_string());
        }
        for host in &config.hosts {
            args.push("--add-host".into());
            args.push(format!("{}:{}", host.name, host.ip));
        }
        for (key, value) in &config.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        if !config.entrypoint.is_empty() {
            args.push("--entrypoint".into());
            args.push(config.entrypoint.join(" "));
        }

        args.push(image.to_string());
        args.extend(config.command.iter().cloned());

        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&borrowed).await?;

        Ok(Arc::new(CliContainerHandle { bin: self.bin.clone(), id: id.to_string() }))
    }

    #[instrument(skip(self))]
    async fn attach(&self, id: &str) -> Result<Option<Arc<dyn ContainerHandle>>> {
        match self.run(&["inspect", id]).await {
            Ok(_) => Ok(Some(Arc::new(CliContainerHandle {
                bin: self.bin.clone(),
                id: id.to_string(),
            }))),
            Err(e) if already_satisfied(&e, "not found") => Ok(None),
            Err(e) => {
                debug!(container = %id, error = %e, "Inspect failed, treating as not attached");
                Ok(None)
            }
        }
    }
}

/// Handle to one CLI-managed container.
struct CliContainerHandle {
    bin: String,
    id: String,
}

#[async_trait]
impl ContainerHandle for CliContainerHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        run_capture(&self.bin, &["start", &self.id]).await?;
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        run_capture(&self.bin, &["stop", "--time", &secs, &self.id]).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        run_capture(&self.bin, &["delete", &self.id]).await?;
        Ok(())
    }

    async fn wait(&self) -> Result<i64> {
        let out = run_capture(&self.bin, &["wait", &self.id]).await?;
        out.trim().parse().map_err(|_| {
            CompoteError::Internal(format!("unexpected wait output for {}: {out:?}", self.id))
        })
    }

    async fn exec(&self, argv: &[String], env: &[String]) -> Result<i64> {
        let rendered = format!("{} exec {}", self.bin, self.id);
        let mut command = Command::new(&self.bin);
        command.arg("exec");
        for entry in env {
            command.arg("-e").arg(entry);
        }
        command.arg(&self.id).args(argv).stdin(Stdio::null());

        let output = command.output().await.map_err(|e| CompoteError::RuntimeCommand {
            command: rendered.clone(),
            detail: e.to_string(),
        })?;

        debug!(
            container = %self.id,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Exec finished"
        );

        Ok(output.status.code().unwrap_or(-1) as i64)
    }

    async fn logs(&self, tail: Option<usize>, follow: bool) -> Result<mpsc::Receiver<LogLine>> {
        let rendered = format!("{} logs {}", self.bin, self.id);
        let mut command = Command::new(&self.bin);
        command.arg("logs");
        if let Some(n) = tail {
            command.arg("-n").arg(n.to_string());
        }
        if follow {
            command.arg("--follow");
        }
        command
            .arg(&self.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| CompoteError::RuntimeCommand {
            command: rendered,
            detail: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(256);

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    if tx.send(LogLine { text, stderr: false }).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    if tx.send(LogLine { text, stderr: true }).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Reap the child once its streams close.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(rx)
    }

    async fn is_running(&self) -> bool {
        match run_capture(&self.bin, &["inspect", &self.id]).await {
            Ok(out) => serde_json::from_str::<Value>(&out)
                .ok()
                .and_then(|v| find_status(&v))
                .map(|status| status.eq_ignore_ascii_case("running"))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn find_status(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if key.eq_ignore_ascii_case("status") || key.eq_ignore_ascii_case("state") {
                    if let Some(s) = v.as_str() {
                        return Some(s.to_string());
                    }
                }
            }
            map.values().find_map(find_status)
        }
        Value::Array(items) => items.iter().find_map(find_status),
        _ => None,
    }
}

/// Named volumes as plain directories under the compote data root.
///
/// The runtime mounts them as binds; `remove` deletes the backing directory
/// unless the volume is external.
pub struct FsVolumeStore {
    root: PathBuf,
    external: std::sync::Mutex<std::collections::BTreeSet<String>>,
}

impl FsVolumeStore {
    pub fn new() -> Self {
        Self::at_root(paths::volumes_dir())
    }

    pub fn at_root(root: PathBuf) -> Self {
        Self { root, external: std::sync::Mutex::new(Default::default()) }
    }
}

impl Default for FsVolumeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeStore for FsVolumeStore {
    #[instrument(skip(self))]
    async fn create(&self, name: &str, _driver: &str, external: bool) -> Result<PathBuf> {
        let path = self.root.join(name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| CompoteError::IoError { path: path.clone(), source: e })?;

        if external {
            self.external.lock().expect("volume registry lock").insert(name.to_string());
        }

        Ok(path)
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<()> {
        if self.external.lock().expect("volume registry lock").contains(name) {
            debug!(volume = %name, "Skipping removal of external volume");
            return Ok(());
        }

        let path = self.root.join(name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CompoteError::IoError { path, source: e }),
        }
    }
}

/// Host process supervisor for port relays.
pub struct HostSupervisor;

impl ProcessSupervisor for HostSupervisor {
    fn spawn(&self, argv: &[String]) -> Result<u32> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| CompoteError::Internal("empty relay argv".to_string()))?;

        let child = std::process::Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CompoteError::PortForwardingFailed {
                detail: format!("failed to spawn {}: {}", program, e),
            })?;

        Ok(child.id())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH: the process is already gone. That is success for us.
            debug!(pid, error = %err, "Termination signal not delivered");
        }
        Ok(())
    }

    fn which(&self, tool: &str) -> bool {
        let Some(path) = std::env::var_os("PATH") else {
            return false;
        };

        std::env::split_paths(&path).any(|dir| {
            let candidate = dir.join(tool);
            is_executable(&candidate)
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_ip_from_nested_inspect() {
        let doc: Value = serde_json::from_str(
            r#"{
                "status": "running",
                "networks": [
                    { "network": "demo_default", "address": "192.168.64.10/24" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(find_ip(&doc), Some("192.168.64.10".parse().unwrap()));
    }

    #[test]
    fn test_find_ip_absent() {
        let doc: Value = serde_json::from_str(r#"{ "status": "created" }"#).unwrap();
        assert_eq!(find_ip(&doc), None);
    }

    #[test]
    fn test_find_status() {
        let doc: Value =
            serde_json::from_str(r#"{ "configuration": {}, "status": "running" }"#).unwrap();
        assert_eq!(find_status(&doc).as_deref(), Some("running"));
    }

    #[tokio::test]
    async fn test_fs_volume_store_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsVolumeStore::at_root(dir.path().to_path_buf());

        let path = store.create("demo_pgdata", "local", false).await.unwrap();
        assert!(path.exists());

        // Idempotent create returns the same path.
        let again = store.create("demo_pgdata", "local", false).await.unwrap();
        assert_eq!(path, again);

        store.remove("demo_pgdata").await.unwrap();
        assert!(!path.exists());

        // Removing a missing volume is a no-op.
        store.remove("demo_pgdata").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_volume_store_external_skip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsVolumeStore::at_root(dir.path().to_path_buf());

        let path = store.create("shared", "local", true).await.unwrap();
        store.remove("shared").await.unwrap();
        assert!(path.exists(), "external volume must survive removal");
    }

    #[test]
    fn test_which_finds_shell() {
        let supervisor = HostSupervisor;
        assert!(supervisor.which("sh"));
        assert!(!supervisor.which("definitely-not-a-tool-42"));
    }

    #[test]
    fn test_terminate_dead_pid_is_ok() {
        let supervisor = HostSupervisor;
        // Huge pid that cannot exist; the signal fails but the call succeeds.
        assert!(supervisor.terminate(4_000_000).is_ok());
    }
}
