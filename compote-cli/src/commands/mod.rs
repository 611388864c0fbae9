//! CLI command handlers.

use anyhow::{Context, Result};
use compote_core::adapters::{ContainerTool, FsVolumeStore, HostSupervisor};
use compote_core::{Capabilities, ComposeParser, Orchestrator, StateStore};
use std::path::Path;
use std::sync::Arc;

pub mod down;
pub mod exec;
pub mod images;
pub mod lifecycle;
pub mod logs;
pub mod ps;
pub mod up;

/// Resolved compose file and project name, shared by every command.
pub struct ProjectContext {
    pub file: String,
    pub project: String,
}

impl ProjectContext {
    /// Resolve the project name: explicit flag, else the compose file's
    /// directory name.
    pub fn resolve(file: &str, project: Option<String>) -> Result<Self> {
        let project = match project {
            Some(name) => name,
            None => Path::new(file)
                .canonicalize()
                .ok()
                .and_then(|p| p.parent().and_then(|d| d.file_name()).map(|n| n.to_string_lossy().to_string()))
                .unwrap_or_else(|| "default".to_string()),
        };

        Ok(Self { file: file.to_string(), project })
    }

    /// Parse the manifest and build an orchestrator over the live runtime.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let compose = ComposeParser::parse_file(&self.file)
            .with_context(|| format!("failed to load compose file {}", self.file))?;

        let tool = Arc::new(ContainerTool::new());
        let caps = Capabilities {
            images: tool.clone(),
            volumes: Arc::new(FsVolumeStore::new()),
            networks: tool.clone(),
            runtime: tool,
            processes: Arc::new(HostSupervisor),
        };

        let store = Arc::new(StateStore::for_project(&self.project));
        Orchestrator::new(&self.project, compose, caps, store)
            .context("failed to initialize orchestrator")
    }
}
