//! The compose orchestrator.
//!
//! Drives every user-facing command (`up`, `down`, `start`, `stop`,
//! `restart`, `scale`, `pull`, `push`, `exec`, `logs`, `ps`) against the
//! injected runtime capabilities. The orchestrator is a single logical actor:
//! commands take `&mut self` so no two public commands interleave, while
//! intra-batch fan-out clones the inner core (all shared pieces are behind
//! `Arc`s) into parallel tasks.

use crate::adapters::{
    ContainerHandle, ContainerRuntime, ImageStore, NetworkBackend, ProcessSupervisor, VolumeStore,
};
use crate::error::{CompoteError, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::forwarder::ForwardSupervisor;
use crate::graph;
use crate::health::{HealthMonitor, HealthcheckSpec};
use crate::manifest::{ComposeFile, ComposeParser};
use crate::registry::ServiceRegistry;
use crate::selector::{self, ReplicaSelection, ServiceSelector};
use crate::state::StateStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

mod service;

/// Grace timeout used where a command does not take one (e.g. `down`).
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Container id: `{project}_{service}_{replica}` (1-based replica index).
pub fn container_id(project: &str, service: &str, replica: u32) -> String {
    format!("{}_{}_{}", project, service, replica)
}

/// Display name: the service name for replica 1, `{service}-{replica}` after.
pub fn display_name(service: &str, replica: u32) -> String {
    if replica == 1 {
        service.to_string()
    } else {
        format!("{}-{}", service, replica)
    }
}

/// Log label: the service name for replica 1, `{service}#{replica}` after.
pub fn log_label(service: &str, replica: u32) -> String {
    if replica == 1 {
        service.to_string()
    } else {
        format!("{}#{}", service, replica)
    }
}

/// Per-project resource name for networks and named volumes.
pub fn resource_name(project: &str, name: &str) -> String {
    format!("{}_{}", project, name)
}

/// Derived view of one service, combining live and persisted knowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub is_running: bool,
    pub is_known: bool,
    pub running_replicas: usize,
    pub known_replicas: usize,
}

/// The injected runtime capabilities.
#[derive(Clone)]
pub struct Capabilities {
    pub images: Arc<dyn ImageStore>,
    pub volumes: Arc<dyn VolumeStore>,
    pub networks: Arc<dyn NetworkBackend>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub processes: Arc<dyn ProcessSupervisor>,
}

/// Shared inner state, cloned into batch fan-out tasks.
#[derive(Clone)]
pub(crate) struct Core {
    pub(crate) project: String,
    pub(crate) compose: Arc<ComposeFile>,
    pub(crate) caps: Capabilities,
    pub(crate) store: Arc<StateStore>,
    pub(crate) registry: Arc<Mutex<ServiceRegistry>>,
    pub(crate) health: HealthMonitor,
    pub(crate) forwards: ForwardSupervisor,
    pub(crate) events: EventBus,
}

/// The compose orchestrator for one project.
pub struct Orchestrator {
    core: Core,
}

impl Orchestrator {
    /// Build an orchestrator over a validated manifest.
    ///
    /// Validation failures (no services, missing or circular dependencies,
    /// unresolvable config/secret references) surface here, before any
    /// runtime call is made.
    pub fn new(
        project: &str,
        compose: ComposeFile,
        caps: Capabilities,
        store: Arc<StateStore>,
    ) -> Result<Self> {
        ComposeParser::validate(&compose)?;

        let events = EventBus::new();
        let forwards =
            ForwardSupervisor::new(project, caps.processes.clone(), store.clone(), events.clone());

        Ok(Self {
            core: Core {
                project: project.to_string(),
                compose: Arc::new(compose),
                caps,
                store,
                registry: Arc::new(Mutex::new(ServiceRegistry::new())),
                health: HealthMonitor::new(),
                forwards,
                events,
            },
        })
    }

    /// The event bus for this orchestrator.
    pub fn events(&self) -> EventBus {
        self.core.events.clone()
    }

    /// Lazily hydrate the registry from persisted state. Runs once per
    /// orchestrator instance; failures are observational (logged, empty).
    async fn ensure_hydrated(&self) {
        let mut registry = self.core.registry.lock().await;
        if registry.is_hydrated() {
            return;
        }

        match self.core.store.load().await {
            Ok(state) => registry.hydrate(&state),
            Err(e) => {
                warn!(project = %self.core.project, error = %e, "State hydration failed");
                self.core.events.publish(
                    Event::new(EventKind::HydrationFailed, &self.core.project, "hydration failed")
                        .with_error(&e),
                );
                registry.hydrate(&Default::default());
            }
        }
    }

    fn command_event(&self, kind: EventKind, command: &str) {
        self.core.events.publish(Event::new(kind, &self.core.project, command));
    }

    /// Bring services up: networks and volumes first, then dependency-ordered
    /// batches with parallel fan-out inside each batch. Services that gate a
    /// `service_healthy` dependent are health-checked after their batch; a
    /// failed check aborts the command. Without `detach`, blocks until every
    /// started container exits.
    #[instrument(skip(self), fields(project = %self.core.project))]
    pub async fn up(&mut self, services: Option<&[String]>, detach: bool) -> Result<()> {
        self.ensure_hydrated().await;
        self.command_event(EventKind::CommandStarted, "up");

        self.core.ensure_networks().await?;
        self.core.ensure_volumes().await?;

        let batches = graph::resolve_startup_order_for(&self.core.compose, services)?;
        let health_deps = graph::health_dependencies(&self.core.compose);
        let subset: BTreeSet<String> = batches.iter().flatten().cloned().collect();

        for batch in &batches {
            self.await_health_gates(batch, &subset).await?;

            self.core.events.publish(Event::new(
                EventKind::BatchStarted,
                &self.core.project,
                batch.join(", "),
            ));

            let mut set = JoinSet::new();
            for name in batch {
                let core = self.core.clone();
                let name = name.clone();
                set.spawn(async move {
                    let replicas = core
                        .compose
                        .service(&name)
                        .map(|s| s.replicas())
                        .unwrap_or(1);
                    for replica in 1..=replicas {
                        core.start_service(&name, replica).await?;
                    }
                    Ok::<(), CompoteError>(())
                });
            }

            // Let the whole batch settle before surfacing the first error.
            let mut first_error = None;
            while let Some(joined) = set.join_next().await {
                let outcome = joined
                    .map_err(|e| CompoteError::Internal(format!("batch task panicked: {e}")))
                    .and_then(|r| r);
                if let Err(e) = outcome {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            self.core.events.publish(Event::new(
                EventKind::BatchCompleted,
                &self.core.project,
                batch.join(", "),
            ));

            self.run_gating_healthchecks(batch, &health_deps).await?;
        }

        if !detach {
            self.wait_for_exits(&batches).await;
        }

        self.command_event(EventKind::CommandCompleted, "up");
        Ok(())
    }

    /// Before a batch starts, block on any `service_healthy` gates its
    /// members declared. Gates on services without a healthcheck pass once
    /// the dependency has started. Dependencies outside `subset` are not
    /// started by this invocation (a filtered `up` drops those edges when
    /// batching), so their gates are not awaited either: health status is
    /// recorded per process, and a gate on a service this invocation never
    /// checks would otherwise always time out.
    async fn await_health_gates(&self, batch: &[String], subset: &BTreeSet<String>) -> Result<()> {
        for name in batch {
            let Some(service) = self.core.compose.service(name) else { continue };
            for dep in service.dependencies() {
                if !subset.contains(dep) {
                    continue;
                }
                if !service.depends_on.requires_healthy(dep) {
                    continue;
                }
                let spec = self
                    .core
                    .compose
                    .service(dep)
                    .and_then(|s| s.healthcheck.as_ref())
                    .and_then(HealthcheckSpec::resolve);
                if let Some(spec) = spec {
                    self.core.health.wait_healthy(dep, spec.deadline()).await?;
                }
            }
        }
        Ok(())
    }

    /// Run healthcheck loops for just-started services that gate a dependent.
    async fn run_gating_healthchecks(
        &self,
        batch: &[String],
        health_deps: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        for name in batch {
            if !health_deps.contains_key(name) {
                continue;
            }
            let Some(spec) = self
                .core
                .compose
                .service(name)
                .and_then(|s| s.healthcheck.as_ref())
                .and_then(HealthcheckSpec::resolve)
            else {
                continue;
            };

            let handles = { self.core.registry.lock().await.handles(name) };
            for (replica, handle) in handles {
                match self.core.health.run(name, handle, &spec).await {
                    Ok(()) => {
                        self.core.events.publish(
                            Event::new(
                                EventKind::HealthcheckPassed,
                                &self.core.project,
                                name.clone(),
                            )
                            .with_service(name)
                            .with_replica(replica),
                        );
                    }
                    Err(e) => {
                        self.core.events.publish(
                            Event::new(
                                EventKind::HealthcheckFailed,
                                &self.core.project,
                                name.clone(),
                            )
                            .with_service(name)
                            .with_replica(replica)
                            .with_error(&e),
                        );
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait for every attached container of the given batches to exit,
    /// emitting an exit event per container.
    async fn wait_for_exits(&self, batches: &[Vec<String>]) {
        let mut set = JoinSet::new();

        for name in batches.iter().flatten() {
            let handles = { self.core.registry.lock().await.handles(name) };
            for (replica, handle) in handles {
                let core = self.core.clone();
                let name = name.clone();
                set.spawn(async move {
                    let code = handle.wait().await.unwrap_or(-1);
                    info!(service = %name, replica, code, "Container exited");
                    core.events.publish(
                        Event::new(
                            EventKind::ContainerExited,
                            &core.project,
                            format!("exit code {code}"),
                        )
                        .with_service(&name)
                        .with_replica(replica),
                    );
                });
            }
        }

        while set.join_next().await.is_some() {}
    }

    /// Start known-but-stopped replicas. Services are visited in batch order;
    /// within a batch, replicas start sequentially so retries behave the same
    /// every time. No healthcheck gating here (use `up` for that).
    #[instrument(skip(self, selectors), fields(project = %self.core.project))]
    pub async fn start(&mut self, selectors: &[ServiceSelector]) -> Result<()> {
        self.ensure_hydrated().await;
        self.command_event(EventKind::CommandStarted, "start");

        let selection = self.resolve_selection(selectors).await?;
        let batches = graph::resolve_startup_order(&self.core.compose)?;

        for batch in &batches {
            for name in batch {
                let Some(wanted) = selection.get(name) else { continue };
                let indices = { self.core.registry.lock().await.known_replica_indices(name) };
                for replica in indices {
                    if !wanted.contains(replica) {
                        continue;
                    }
                    let handle = { self.core.registry.lock().await.handle(name, replica) };
                    let running = match handle {
                        Some(handle) => handle.is_running().await,
                        None => false,
                    };
                    if !running {
                        self.core.start_service(name, replica).await?;
                    }
                }
            }
        }

        self.command_event(EventKind::CommandCompleted, "start");
        Ok(())
    }

    /// Stop selected running replicas, batch order reversed, keeping handles
    /// and container state so `start` can revive them.
    #[instrument(skip(self, selectors), fields(project = %self.core.project))]
    pub async fn stop(&mut self, selectors: &[ServiceSelector], timeout: Duration) -> Result<()> {
        self.ensure_hydrated().await;
        self.command_event(EventKind::CommandStarted, "stop");

        let selection = self.resolve_selection(selectors).await?;
        let batches = graph::resolve_startup_order(&self.core.compose)?;

        for batch in batches.iter().rev() {
            let mut set = JoinSet::new();

            for name in batch {
                let Some(wanted) = selection.get(name) else { continue };
                let handles = { self.core.registry.lock().await.handles(name) };
                for (replica, _) in handles {
                    if !wanted.contains(replica) {
                        continue;
                    }
                    let core = self.core.clone();
                    let name = name.clone();
                    set.spawn(async move { core.pause_replica(&name, replica, timeout).await });
                }
            }

            let mut first_error = None;
            while let Some(joined) = set.join_next().await {
                let outcome = joined
                    .map_err(|e| CompoteError::Internal(format!("stop task panicked: {e}")))
                    .and_then(|r| r);
                if let Err(e) = outcome {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        self.command_event(EventKind::CommandCompleted, "stop");
        Ok(())
    }

    /// `stop` then `start` with the same selectors.
    #[instrument(skip(self, selectors), fields(project = %self.core.project))]
    pub async fn restart(
        &mut self,
        selectors: &[ServiceSelector],
        timeout: Duration,
    ) -> Result<()> {
        self.stop(selectors, timeout).await?;
        self.start(selectors).await
    }

    /// Tear the project down: delete containers batch-reversed, sweep orphan
    /// forwards, remove project networks, and optionally project volumes.
    #[instrument(skip(self), fields(project = %self.core.project))]
    pub async fn down(&mut self, remove_volumes: bool) -> Result<()> {
        self.ensure_hydrated().await;
        self.command_event(EventKind::CommandStarted, "down");

        let batches = graph::resolve_startup_order(&self.core.compose)?;

        for batch in batches.iter().rev() {
            let mut set = JoinSet::new();

            for name in batch {
                let indices = { self.core.registry.lock().await.known_replica_indices(name) };
                if indices.is_empty() {
                    continue;
                }
                let core = self.core.clone();
                let name = name.clone();
                set.spawn(async move {
                    for replica in indices.into_iter().rev() {
                        core.remove_replica(&name, replica, DEFAULT_STOP_TIMEOUT).await?;
                    }
                    Ok::<(), CompoteError>(())
                });
            }

            let mut first_error = None;
            while let Some(joined) = set.join_next().await {
                let outcome = joined
                    .map_err(|e| CompoteError::Internal(format!("down task panicked: {e}")))
                    .and_then(|r| r);
                if let Err(e) = outcome {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        // Containers persisted for services the manifest no longer names.
        let leftovers: Vec<String> = {
            let registry = self.core.registry.lock().await;
            registry
                .services()
                .into_iter()
                .filter(|s| !self.core.compose.services.contains_key(s))
                .collect()
        };
        for name in leftovers {
            let indices = { self.core.registry.lock().await.known_replica_indices(&name) };
            for replica in indices.into_iter().rev() {
                self.core.remove_replica(&name, replica, DEFAULT_STOP_TIMEOUT).await?;
            }
        }

        self.core.forwards.remove_all().await?;

        let networks = self.core.store.load().await?.networks;
        for name in networks.keys() {
            self.core.caps.networks.remove(name).await?;
            self.core.store.remove_network(name).await?;
        }

        if remove_volumes {
            self.core.remove_project_volumes().await?;
        }

        self.command_event(EventKind::CommandCompleted, "down");
        Ok(())
    }

    /// Scale a service to exactly `replicas` instances. Scale-up materializes
    /// missing indices ascending (replica 1 first when absent); scale-down
    /// removes from the highest index.
    #[instrument(skip(self), fields(project = %self.core.project))]
    pub async fn scale(&mut self, service: &str, replicas: u32) -> Result<()> {
        self.ensure_hydrated().await;

        if !self.core.compose.services.contains_key(service) {
            return Err(CompoteError::ServiceNotFound { service: service.to_string() });
        }

        self.command_event(EventKind::CommandStarted, "scale");
        self.core.ensure_networks().await?;
        self.core.ensure_volumes().await?;

        let current = { self.core.registry.lock().await.known_replica_indices(service) };

        if replicas as usize > current.len() {
            for index in 1..=replicas {
                if !current.contains(&index) {
                    self.core.start_service(service, index).await?;
                }
            }
        } else if (replicas as usize) < current.len() {
            let current_max = current.iter().max().copied().unwrap_or(0);
            for index in (replicas + 1..=current_max).rev() {
                if current.contains(&index) {
                    self.core.remove_replica(service, index, DEFAULT_STOP_TIMEOUT).await?;
                }
            }
        }

        self.command_event(EventKind::CommandCompleted, "scale");
        Ok(())
    }

    /// Pull the image of every (filtered) service that has one.
    #[instrument(skip(self), fields(project = %self.core.project))]
    pub async fn pull(&mut self, services: Option<&[String]>) -> Result<()> {
        self.ensure_hydrated().await;

        for name in self.selected_services(services)? {
            let service = &self.core.compose.services[&name];
            if let Some(image) = &service.image {
                info!(service = %name, image = %image, "Pulling image");
                self.core.caps.images.pull(image).await?;
            }
        }
        Ok(())
    }

    /// Push every (filtered) service image. Built images push under the
    /// project tag.
    #[instrument(skip(self), fields(project = %self.core.project))]
    pub async fn push(&mut self, services: Option<&[String]>) -> Result<()> {
        self.ensure_hydrated().await;

        for name in self.selected_services(services)? {
            let service = &self.core.compose.services[&name];
            let reference = match (&service.image, &service.build) {
                (Some(image), _) => image.clone(),
                (None, Some(_)) => format!("{}_{}:latest", self.core.project, name),
                (None, None) => continue,
            };
            info!(service = %name, image = %reference, "Pushing image");
            self.core.caps.images.push(&reference).await?;
        }
        Ok(())
    }

    fn selected_services(&self, filter: Option<&[String]>) -> Result<Vec<String>> {
        match filter {
            Some(names) => {
                for name in names {
                    if !self.core.compose.services.contains_key(name) {
                        return Err(CompoteError::ServiceNotFound { service: name.clone() });
                    }
                }
                Ok(names.to_vec())
            }
            None => Ok(self.core.compose.service_names()),
        }
    }

    /// Run a command in a running replica and return its exit code. With no
    /// replica given, the lowest-indexed running replica is used.
    #[instrument(skip(self, command, env), fields(project = %self.core.project))]
    pub async fn exec(
        &mut self,
        service: &str,
        replica: Option<u32>,
        command: &[String],
        env: &[String],
    ) -> Result<i64> {
        self.ensure_hydrated().await;

        let (in_manifest, known) = {
            let registry = self.core.registry.lock().await;
            (
                self.core.compose.services.contains_key(service),
                !registry.known_replica_indices(service).is_empty(),
            )
        };
        if !in_manifest && !known {
            return Err(CompoteError::ServiceNotFound { service: service.to_string() });
        }

        let handle = match replica {
            Some(index) => {
                let handle = { self.core.registry.lock().await.handle(service, index) };
                match handle {
                    Some(handle) => {
                        if !handle.is_running().await {
                            return Err(CompoteError::ServiceNotRunning {
                                service: service.to_string(),
                            });
                        }
                        handle
                    }
                    None => {
                        let known_replica = {
                            self.core
                                .registry
                                .lock()
                                .await
                                .known_replica_indices(service)
                                .contains(&index)
                        };
                        return Err(if known_replica {
                            CompoteError::ServiceNotRunning { service: service.to_string() }
                        } else {
                            CompoteError::ServiceReplicaNotFound {
                                service: service.to_string(),
                                replica: index,
                            }
                        });
                    }
                }
            }
            None => {
                let handles = { self.core.registry.lock().await.handles(service) };
                let mut running = None;
                for (_, handle) in handles {
                    if handle.is_running().await {
                        running = Some(handle);
                        break;
                    }
                }
                running.ok_or_else(|| CompoteError::ServiceNotRunning {
                    service: service.to_string(),
                })?
            }
        };

        handle.exec(command, env).await
    }

    /// Multiplex log streams of the selected running replicas into one
    /// channel, each line prefixed with its source label. The stream finishes
    /// when every source finishes.
    #[instrument(skip(self, selectors), fields(project = %self.core.project))]
    pub async fn logs(
        &mut self,
        selectors: &[ServiceSelector],
        include_stderr: bool,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<mpsc::Receiver<String>> {
        self.ensure_hydrated().await;

        let selection = self.resolve_selection(selectors).await?;

        let mut sources: Vec<(String, Arc<dyn ContainerHandle>)> = Vec::new();
        for (name, wanted) in &selection {
            let handles = { self.core.registry.lock().await.handles(name) };
            let mut matched = false;
            for (replica, handle) in handles {
                if wanted.contains(replica) && handle.is_running().await {
                    matched = true;
                    sources.push((log_label(name, replica), handle));
                }
            }
            if !matched {
                warn!(service = %name, "No attached running replicas to stream logs from");
            }
        }

        if sources.is_empty() {
            let service = selection.keys().next().cloned().unwrap_or_default();
            return Err(CompoteError::ServiceNotRunning { service });
        }

        let (tx, rx) = mpsc::channel(256);
        for (label, handle) in sources {
            let mut stream = handle.logs(tail, follow).await?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(line) = stream.recv().await {
                    if line.stderr && !include_stderr {
                        continue;
                    }
                    if tx.send(format!("[{}] {}", label, line.text)).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(rx)
    }

    /// Status of every manifest and known service, sorted by name.
    #[instrument(skip(self), fields(project = %self.core.project))]
    pub async fn ps(&mut self) -> Result<Vec<ServiceStatus>> {
        self.ensure_hydrated().await;

        let registry = self.core.registry.lock().await;
        let mut names = registry.services();
        names.extend(self.core.compose.services.keys().cloned());

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let running = registry.running_replica_count(&name).await;
            let known = registry.known_replica_indices(&name).len();
            statuses.push(ServiceStatus {
                is_running: running > 0,
                is_known: known > 0,
                running_replicas: running,
                known_replicas: known,
                name,
            });
        }

        Ok(statuses)
    }

    /// Resolve selectors into per-service replica sets. Empty selectors mean
    /// every manifest and known service. Service names must exist in the
    /// manifest or in persisted state; explicit replica indices must be known.
    async fn resolve_selection(
        &self,
        selectors: &[ServiceSelector],
    ) -> Result<BTreeMap<String, ReplicaSelection>> {
        let registry = self.core.registry.lock().await;

        if selectors.is_empty() {
            let mut all = registry.services();
            all.extend(self.core.compose.services.keys().cloned());
            return Ok(all.into_iter().map(|name| (name, ReplicaSelection::All)).collect());
        }

        let selection = selector::aggregate(selectors);
        for (name, wanted) in &selection {
            let known = registry.known_replica_indices(name);
            if !self.core.compose.services.contains_key(name) && known.is_empty() {
                return Err(CompoteError::ServiceNotFound { service: name.clone() });
            }
            if let ReplicaSelection::Indices(indices) = wanted {
                for index in indices {
                    if !known.contains(index) {
                        return Err(CompoteError::ServiceReplicaNotFound {
                            service: name.clone(),
                            replica: *index,
                        });
                    }
                }
            }
        }

        Ok(selection)
    }
}
