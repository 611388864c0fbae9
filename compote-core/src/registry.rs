//! In-memory service registry.
//!
//! A replica-aware cache of the persisted project state: container handles
//! this process has attached to (`runtime`), the hydrated snapshot of
//! persisted containers (`known`), and the addresses recorded on network
//! attach (`service_ips`). Reads hydrate once per orchestrator instance;
//! writes go through the state store first and then update this cache.

use crate::adapters::ContainerHandle;
use crate::state::{ContainerInfo, ProjectState};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

/// Replica-keyed maps for one orchestrator instance.
#[derive(Default)]
pub struct ServiceRegistry {
    runtime: BTreeMap<String, BTreeMap<u32, Arc<dyn ContainerHandle>>>,
    known: BTreeMap<String, BTreeMap<u32, ContainerInfo>>,
    service_ips: BTreeMap<String, BTreeMap<u32, IpAddr>>,
    hydrated: bool,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the one-shot hydration has run.
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Populate `known` from persisted state, grouping containers by
    /// `(serviceName ?? name, replicaIndex ?? 1)` so that records written by
    /// older versions still land on the right service.
    pub fn hydrate(&mut self, state: &ProjectState) {
        for info in state.containers.values() {
            self.known
                .entry(info.service().to_string())
                .or_default()
                .insert(info.replica(), info.clone());
        }
        self.hydrated = true;
    }

    pub fn insert_handle(&mut self, service: &str, replica: u32, handle: Arc<dyn ContainerHandle>) {
        self.runtime.entry(service.to_string()).or_default().insert(replica, handle);
    }

    pub fn handle(&self, service: &str, replica: u32) -> Option<Arc<dyn ContainerHandle>> {
        self.runtime.get(service).and_then(|replicas| replicas.get(&replica)).cloned()
    }

    /// Handles for a service, ascending by replica index.
    pub fn handles(&self, service: &str) -> Vec<(u32, Arc<dyn ContainerHandle>)> {
        self.runtime
            .get(service)
            .map(|replicas| replicas.iter().map(|(r, h)| (*r, h.clone())).collect())
            .unwrap_or_default()
    }

    pub fn record_known(&mut self, service: &str, replica: u32, info: ContainerInfo) {
        self.known.entry(service.to_string()).or_default().insert(replica, info);
    }

    pub fn known_info(&self, service: &str, replica: u32) -> Option<&ContainerInfo> {
        self.known.get(service).and_then(|replicas| replicas.get(&replica))
    }

    pub fn record_ip(&mut self, service: &str, replica: u32, ip: IpAddr) {
        self.service_ips.entry(service.to_string()).or_default().insert(replica, ip);
    }

    pub fn ip(&self, service: &str, replica: u32) -> Option<IpAddr> {
        self.service_ips.get(service).and_then(|replicas| replicas.get(&replica)).copied()
    }

    /// Every recorded `(service, replica, ip)`, for hosts-table construction.
    pub fn all_ips(&self) -> Vec<(String, u32, IpAddr)> {
        self.service_ips
            .iter()
            .flat_map(|(service, replicas)| {
                replicas.iter().map(move |(r, ip)| (service.clone(), *r, *ip))
            })
            .collect()
    }

    /// Drop every trace of a replica (handle, snapshot, address).
    pub fn remove_replica(&mut self, service: &str, replica: u32) {
        if let Some(replicas) = self.runtime.get_mut(service) {
            replicas.remove(&replica);
            if replicas.is_empty() {
                self.runtime.remove(service);
            }
        }
        if let Some(replicas) = self.known.get_mut(service) {
            replicas.remove(&replica);
            if replicas.is_empty() {
                self.known.remove(service);
            }
        }
        if let Some(replicas) = self.service_ips.get_mut(service) {
            replicas.remove(&replica);
            if replicas.is_empty() {
                self.service_ips.remove(service);
            }
        }
    }

    /// Known replica indices: the union of attached handles and the hydrated
    /// snapshot.
    pub fn known_replica_indices(&self, service: &str) -> BTreeSet<u32> {
        let mut indices = BTreeSet::new();
        if let Some(replicas) = self.runtime.get(service) {
            indices.extend(replicas.keys().copied());
        }
        if let Some(replicas) = self.known.get(service) {
            indices.extend(replicas.keys().copied());
        }
        indices
    }

    /// Number of replicas whose handle reports running.
    pub async fn running_replica_count(&self, service: &str) -> usize {
        let mut count = 0;
        for (_, handle) in self.handles(service) {
            if handle.is_running().await {
                count += 1;
            }
        }
        count
    }

    /// Every service the registry knows about, from either map.
    pub fn services(&self) -> BTreeSet<String> {
        self.runtime.keys().chain(self.known.keys()).cloned().collect()
    }
}
