//! Persistent project state.
//!
//! Each project owns one JSON document at
//! `<data-dir>/state/<project>.json` recording containers, networks, volumes,
//! and live port-forward relays. Writes go to a temp file in the same
//! directory and are renamed into place, so a crashed writer never leaves a
//! torn document. Read-modify-write helpers serialize within the process
//! through an exclusive lock; separate processes are expected to issue
//! commands serially (the rename keeps them safe from torn writes, not from
//! lost updates).

use crate::error::{CompoteError, Result};
use crate::paths;
use crate::ports::Protocol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// A container recorded in project state.
///
/// `service_name`/`replica_index` are optional for compatibility with records
/// persisted before replica awareness; readers fall back to treating `name`
/// as the service name with replica 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    /// Container id (`{project}_{service}_{replica}`).
    pub id: String,

    /// Display name (`service` for replica 1, `{service}-{replica}` otherwise).
    pub name: String,

    /// Image reference the container was created from, verbatim.
    pub image_reference: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_index: Option<u32>,

    pub created_at: DateTime<Utc>,
}

impl ContainerInfo {
    /// Service this container belongs to, tolerating legacy records.
    pub fn service(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.name)
    }

    /// Replica index, tolerating legacy records.
    pub fn replica(&self) -> u32 {
        self.replica_index.unwrap_or(1)
    }
}

/// A project network recorded in state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub name: String,
    pub driver: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// A named volume recorded in state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub mount_path: PathBuf,
    pub is_external: bool,
}

/// A live port-forward relay recorded in state.
///
/// The pid is valid while the recording process's children are alive; foreign
/// processes treat it as best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardInfo {
    /// Deterministic id: `{service}#{replica}#{proto}#{hostPort}`.
    pub id: String,
    pub service_name: String,
    pub replica_index: u32,
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub target_ip: IpAddr,
    pub target_port: u16,
    pub proto: Protocol,
    pub pid: u32,
}

/// The persisted catalog for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectState {
    pub containers: BTreeMap<String, ContainerInfo>,
    pub networks: BTreeMap<String, NetworkInfo>,
    pub volumes: BTreeMap<String, VolumeInfo>,
    pub port_forwards: BTreeMap<String, PortForwardInfo>,
}

/// Store for one project's persistent state.
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    /// Store rooted at the default state directory.
    pub fn for_project(project: &str) -> Self {
        Self::at_path(paths::state_file(project))
    }

    /// Store at an explicit path (used by tests).
    pub fn at_path(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    /// The backing file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the project state. A missing file is an empty state.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<ProjectState> {
        let _guard = self.lock.lock().await;
        self.read()
    }

    /// Replace the project state on disk.
    #[instrument(skip(self, state))]
    pub async fn save(&self, state: &ProjectState) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(state)
    }

    /// Delete the state file.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CompoteError::IoError { path: self.path.clone(), source: e }),
        }
    }

    /// Read-modify-write under the store lock.
    pub async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ProjectState),
    {
        let _guard = self.lock.lock().await;
        let mut state = self.read()?;
        f(&mut state);
        self.write(&state)
    }

    pub async fn update_container(&self, info: ContainerInfo) -> Result<()> {
        self.mutate(|state| {
            state.containers.insert(info.id.clone(), info);
        })
        .await
    }

    pub async fn remove_container(&self, id: &str) -> Result<()> {
        self.mutate(|state| {
            state.containers.remove(id);
        })
        .await
    }

    pub async fn update_network(&self, info: NetworkInfo) -> Result<()> {
        self.mutate(|state| {
            state.networks.insert(info.name.clone(), info);
        })
        .await
    }

    pub async fn remove_network(&self, name: &str) -> Result<()> {
        self.mutate(|state| {
            state.networks.remove(name);
        })
        .await
    }

    pub async fn update_volume(&self, info: VolumeInfo) -> Result<()> {
        self.mutate(|state| {
            state.volumes.insert(info.name.clone(), info);
        })
        .await
    }

    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        self.mutate(|state| {
            state.volumes.remove(name);
        })
        .await
    }

    pub async fn update_port_forward(&self, info: PortForwardInfo) -> Result<()> {
        self.mutate(|state| {
            state.port_forwards.insert(info.id.clone(), info);
        })
        .await
    }

    pub async fn remove_port_forward(&self, id: &str) -> Result<()> {
        self.mutate(|state| {
            state.port_forwards.remove(id);
        })
        .await
    }

    fn read(&self) -> Result<ProjectState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting empty");
                return Ok(ProjectState::default());
            }
            Err(e) => {
                return Err(CompoteError::IoError { path: self.path.clone(), source: e })
            }
        };

        serde_json::from_str(&content).map_err(|e| CompoteError::State {
            reason: format!("failed to parse {}: {}", self.path.display(), e),
        })
    }

    fn write(&self, state: &ProjectState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CompoteError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| CompoteError::State { reason: format!("failed to serialize: {}", e) })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| CompoteError::IoError { path: tmp.clone(), source: e })?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| CompoteError::IoError { path: self.path.clone(), source: e })?;

        Ok(())
    }

}
