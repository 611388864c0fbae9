//! Per-replica lifecycle: create, revive, pause, and remove.

use super::{container_id, display_name, resource_name, Core};
use crate::adapters::{ContainerConfig, HostEntry, MountSpec, ResolvedMount, DEFAULT_ROOTFS_BYTES};
use crate::error::{CompoteError, Result};
use crate::events::{Event, EventKind};
use crate::manifest::{env, Service};
use crate::ports::PortSpec;
use crate::state::{ContainerInfo, NetworkInfo, VolumeInfo};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

impl Core {
    /// Drive one replica to running. Revives a retained stopped handle, or
    /// walks the full create path: ensure image, resolve config, attach to
    /// the project network, create, start, and stand up port forwards.
    ///
    /// Failures wrap the cause as `FailedToStart(service, cause)`. Partial
    /// progress is not rolled back; `down` is the canonical cleanup.
    pub(crate) async fn start_service(&self, name: &str, replica: u32) -> Result<()> {
        self.start_replica(name, replica)
            .await
            .map_err(|e| CompoteError::failed_to_start(name, e))
    }

    #[instrument(skip(self), fields(project = %self.project))]
    async fn start_replica(&self, name: &str, replica: u32) -> Result<()> {
        let service = self
            .compose
            .service(name)
            .ok_or_else(|| CompoteError::ServiceNotFound { service: name.to_string() })?;

        // Grammar errors fail before any runtime call.
        let port_specs = PortSpec::parse_all(&service.ports)?;

        // A retained handle means the replica was stopped in this process;
        // revive it rather than recreating state.
        let retained = { self.registry.lock().await.handle(name, replica) };
        if let Some(handle) = retained {
            if handle.is_running().await {
                debug!(service = %name, replica, "Replica already running");
                return Ok(());
            }

            handle.start().await?;
            let ip = { self.registry.lock().await.ip(name, replica) };
            if let Some(ip) = ip {
                self.forwards.establish(name, replica, ip, &port_specs).await?;
            }

            info!(service = %name, replica, "Replica restarted");
            self.events.publish(
                Event::new(EventKind::ServiceStarted, &self.project, display_name(name, replica))
                    .with_service(name)
                    .with_replica(replica),
            );
            return Ok(());
        }

        let image_reference = self.ensure_image(name, service).await?;

        let id = container_id(&self.project, name, replica);
        let display = display_name(name, replica);

        let environment = self.resolve_environment(service)?;
        let mounts = self.resolve_mounts(service).await?;

        let network = resource_name(&self.project, "default");
        let ip = self.caps.networks.connect(&id, &network).await?;
        { self.registry.lock().await.record_ip(name, replica, ip) };

        let hosts = self.hosts_table().await;

        let config = ContainerConfig {
            name: display.clone(),
            hostname: service.hostname.clone().unwrap_or_else(|| name.to_string()),
            entrypoint: service.entrypoint.as_ref().map(|c| c.to_args()).unwrap_or_default(),
            command: service.command.as_ref().map(|c| c.to_args()).unwrap_or_default(),
            env: environment,
            working_dir: service.working_dir.clone(),
            user: service.user.clone(),
            mounts,
            tmpfs: service.tmpfs.as_ref().map(|t| t.to_vec()).unwrap_or_default(),
            cpus: service.deploy.as_ref().and_then(|d| d.resources.as_ref()).and_then(|r| r.cpu_count()),
            memory_bytes: service
                .deploy
                .as_ref()
                .and_then(|d| d.resources.as_ref())
                .and_then(|r| r.memory_bytes()),
            hosts,
            network,
            ip: Some(ip),
            labels: service.labels.clone(),
        };

        let handle = self
            .caps
            .runtime
            .create(&id, &image_reference, DEFAULT_ROOTFS_BYTES, false, &config)
            .await?;
        handle.start().await?;

        self.forwards.establish(name, replica, ip, &port_specs).await?;

        let info = ContainerInfo {
            id: id.clone(),
            name: display.clone(),
            image_reference,
            service_name: Some(name.to_string()),
            replica_index: Some(replica),
            created_at: Utc::now(),
        };
        self.store.update_container(info.clone()).await?;
        {
            let mut registry = self.registry.lock().await;
            registry.insert_handle(name, replica, handle);
            registry.record_known(name, replica, info);
        }

        info!(service = %name, replica, ip = %ip, "Replica started");
        self.events.publish(
            Event::new(EventKind::ServiceStarted, &self.project, display)
                .with_service(name)
                .with_replica(replica),
        );

        Ok(())
    }

    /// Make the service's image available, returning the reference containers
    /// are created from. Manifest references flow through verbatim so `pull`
    /// and `push` agree on the stored reference.
    async fn ensure_image(&self, name: &str, service: &Service) -> Result<String> {
        match (&service.image, &service.build) {
            (Some(image), _) => self.caps.images.pull(image).await,
            (None, Some(build)) => {
                let tag = format!("{}_{}:latest", self.project, name);
                self.caps
                    .images
                    .build(Path::new(build.context()), build.dockerfile(), &tag, &build.args())
                    .await
            }
            (None, None) => Err(CompoteError::ManifestParse {
                reason: format!("service '{}' has neither image nor build", name),
            }),
        }
    }

    /// Layer env files under the `environment` section, interpolating the
    /// declared values against the calling process environment.
    fn resolve_environment(&self, service: &Service) -> Result<Vec<String>> {
        let process = env::process_env();
        let mut layers = Vec::new();

        if let Some(files) = &service.env_file {
            for path in files.to_vec() {
                layers.push(env::load_env_file(&path)?);
            }
        }

        let declared: BTreeMap<String, String> = service
            .environment
            .to_map()
            .into_iter()
            .map(|(key, value)| (key, env::interpolate(&value, &process)))
            .collect();
        layers.push(declared);

        Ok(env::merge(&layers).into_iter().map(|(k, v)| format!("{}={}", k, v)).collect())
    }

    /// Expand mount specs, config mounts, and secret mounts into host paths.
    async fn resolve_mounts(&self, service: &Service) -> Result<Vec<ResolvedMount>> {
        let mut mounts = Vec::new();

        for raw in &service.volumes {
            let spec = MountSpec::parse(raw)?;

            if spec.is_bind() {
                let source = spec.source.as_deref().expect("bind mounts have a source");
                mounts.push(ResolvedMount {
                    source: expand_bind_source(source),
                    target: spec.target,
                    read_only: spec.read_only,
                });
            } else {
                let volume = match &spec.source {
                    Some(source) => resource_name(&self.project, source),
                    None => resource_name(&self.project, &sanitize_path(&spec.target)),
                };
                let host_path = self.caps.volumes.create(&volume, "local", false).await?;
                mounts.push(ResolvedMount {
                    source: host_path,
                    target: spec.target,
                    read_only: spec.read_only,
                });
            }
        }

        for reference in &service.configs {
            let def = self.compose.configs.get(reference.source()).ok_or_else(|| {
                CompoteError::Internal(format!("config '{}' vanished", reference.source()))
            })?;
            let file = def.file.as_ref().ok_or_else(|| CompoteError::ManifestParse {
                reason: format!("config '{}' has no file", reference.source()),
            })?;
            let target = reference
                .target()
                .map(str::to_string)
                .unwrap_or_else(|| format!("/{}", reference.source()));
            mounts.push(ResolvedMount { source: PathBuf::from(file), target, read_only: true });
        }

        for reference in &service.secrets {
            let def = self.compose.secrets.get(reference.source()).ok_or_else(|| {
                CompoteError::Internal(format!("secret '{}' vanished", reference.source()))
            })?;
            let file = def.file.as_ref().ok_or_else(|| CompoteError::ManifestParse {
                reason: format!("secret '{}' has no file", reference.source()),
            })?;
            let target = reference
                .target()
                .map(str::to_string)
                .unwrap_or_else(|| format!("/run/secrets/{}", reference.source()));
            mounts.push(ResolvedMount { source: PathBuf::from(file), target, read_only: true });
        }

        Ok(mounts)
    }

    /// Service-discovery hosts table: one entry per known `(service,
    /// replica, ip)`, sorted by name.
    async fn hosts_table(&self) -> Vec<HostEntry> {
        let mut entries: Vec<HostEntry> = self
            .registry
            .lock()
            .await
            .all_ips()
            .into_iter()
            .map(|(service, replica, ip)| HostEntry { ip, name: display_name(&service, replica) })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Stop a running replica without deleting it: the handle, container
    /// state, and address stay behind so `start` can revive it.
    #[instrument(skip(self), fields(project = %self.project))]
    pub(crate) async fn pause_replica(
        &self,
        name: &str,
        replica: u32,
        timeout: Duration,
    ) -> Result<()> {
        let retained = { self.registry.lock().await.handle(name, replica) };
        let Some(handle) = retained else {
            return Ok(());
        };

        if handle.is_running().await {
            handle
                .stop(timeout)
                .await
                .map_err(|e| CompoteError::failed_to_stop(name, e))?;
        }

        self.forwards.remove_for_replica(name, replica).await?;

        info!(service = %name, replica, "Replica stopped");
        self.events.publish(
            Event::new(EventKind::ServiceStopped, &self.project, display_name(name, replica))
                .with_service(name)
                .with_replica(replica),
        );

        Ok(())
    }

    /// Remove a replica entirely: stop (best effort), delete, drop its
    /// forwards, and erase it from project state and the registry.
    #[instrument(skip(self), fields(project = %self.project))]
    pub(crate) async fn remove_replica(
        &self,
        name: &str,
        replica: u32,
        timeout: Duration,
    ) -> Result<()> {
        let id = container_id(&self.project, name, replica);

        let retained = { self.registry.lock().await.handle(name, replica) };
        let handle = match retained {
            Some(handle) => Some(handle),
            // Created by another process: re-attach if the runtime still
            // knows the id, otherwise only the state record remains.
            None => self.caps.runtime.attach(&id).await?,
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.stop(timeout).await {
                debug!(container = %id, error = %e, "Graceful stop failed, deleting anyway");
            }
            handle.delete().await.map_err(|e| CompoteError::failed_to_stop(name, e))?;
        }

        self.store.remove_container(&id).await?;
        self.forwards.remove_for_replica(name, replica).await?;
        { self.registry.lock().await.remove_replica(name, replica) };

        info!(service = %name, replica, "Replica removed");
        self.events.publish(
            Event::new(EventKind::ServiceStopped, &self.project, display_name(name, replica))
                .with_service(name)
                .with_replica(replica),
        );

        Ok(())
    }

    /// Create the project networks (idempotent) and record them.
    pub(crate) async fn ensure_networks(&self) -> Result<()> {
        let mut wanted: Vec<(String, String)> = Vec::new();

        if !self.compose.networks.contains_key("default") {
            wanted.push((resource_name(&self.project, "default"), "bridge".to_string()));
        }
        for (key, def) in &self.compose.networks {
            if def.external.is_external() {
                continue;
            }
            let name =
                def.name.clone().unwrap_or_else(|| resource_name(&self.project, key));
            wanted.push((name, def.driver().to_string()));
        }

        for (name, driver) in wanted {
            self.caps.networks.create(&name, &driver).await?;
            self.store
                .update_network(NetworkInfo { name, driver, subnet: None, gateway: None })
                .await?;
        }

        Ok(())
    }

    /// Create the declared named volumes (idempotent) and record them.
    pub(crate) async fn ensure_volumes(&self) -> Result<()> {
        for (key, def) in &self.compose.volumes {
            let external = def.external.is_external();
            let name = if external {
                def.external
                    .alias()
                    .map(str::to_string)
                    .or_else(|| def.name.clone())
                    .unwrap_or_else(|| key.clone())
            } else {
                def.name.clone().unwrap_or_else(|| resource_name(&self.project, key))
            };

            let mount_path = self.caps.volumes.create(&name, def.driver(), external).await?;
            self.store
                .update_volume(VolumeInfo {
                    name,
                    driver: def.driver().to_string(),
                    mount_path,
                    is_external: external,
                })
                .await?;
        }

        Ok(())
    }

    /// Remove project-scoped volumes: the compose-declared ones plus anything
    /// persisted under the project prefix. External volumes survive.
    pub(crate) async fn remove_project_volumes(&self) -> Result<()> {
        let prefix = format!("{}_", self.project);
        let state = self.store.load().await?;

        let mut names: Vec<String> = state
            .volumes
            .values()
            .filter(|v| !v.is_external && v.name.starts_with(&prefix))
            .map(|v| v.name.clone())
            .collect();

        for (key, def) in &self.compose.volumes {
            if def.external.is_external() {
                continue;
            }
            let name = def.name.clone().unwrap_or_else(|| resource_name(&self.project, key));
            if !names.contains(&name) {
                names.push(name);
            }
        }

        for name in names {
            self.caps.volumes.remove(&name).await?;
            self.store.remove_volume(&name).await?;
        }

        Ok(())
    }
}

/// Expand a bind source: `~` to the home directory; `.`-relative paths stay
/// relative to the invocation directory.
fn expand_bind_source(source: &str) -> PathBuf {
    if let Some(rest) = source.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(source)
}

/// Turn a mount target into a volume-name fragment.
fn sanitize_path(target: &str) -> String {
    target.trim_matches('/').replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_conventions() {
        assert_eq!(container_id("demo", "web", 1), "demo_web_1");
        assert_eq!(container_id("demo", "worker", 3), "demo_worker_3");
        assert_eq!(display_name("web", 1), "web");
        assert_eq!(display_name("worker", 2), "worker-2");
        assert_eq!(resource_name("demo", "default"), "demo_default");
    }

    #[test]
    fn test_expand_bind_source() {
        assert_eq!(expand_bind_source("/etc/ssl"), PathBuf::from("/etc/ssl"));
        assert_eq!(expand_bind_source("./data"), PathBuf::from("./data"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_bind_source("~/src"), home.join("src"));
        }
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/var/cache"), "var-cache");
        assert_eq!(sanitize_path("/data"), "data");
    }
}
