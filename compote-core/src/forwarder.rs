//! Port-forward supervision.
//!
//! Each published port of a running replica is served by one long-lived host
//! relay child process bridging `{hostIP}:{hostPort}` to the replica's
//! `{ip}:{containerPort}`. The supervisor spawns relays, records them in
//! project state under a deterministic id, and terminates them when the
//! replica stops. Pids recorded by another process are signaled best-effort.

use crate::adapters::ProcessSupervisor;
use crate::error::{CompoteError, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::ports::{PortSpec, Protocol};
use crate::state::{PortForwardInfo, StateStore};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// The host relay tool spawned per mapping.
pub const RELAY_TOOL: &str = "compote-relay";

/// Deterministic forward id: `{service}#{replica}#{proto}#{hostPort}`.
pub fn forward_id(service: &str, replica: u32, proto: Protocol, host_port: u16) -> String {
    format!("{}#{}#{}#{}", service, replica, proto, host_port)
}

/// Supervises relay processes for one project.
#[derive(Clone)]
pub struct ForwardSupervisor {
    project: String,
    processes: Arc<dyn ProcessSupervisor>,
    store: Arc<StateStore>,
    events: EventBus,
}

impl ForwardSupervisor {
    pub fn new(
        project: &str,
        processes: Arc<dyn ProcessSupervisor>,
        store: Arc<StateStore>,
        events: EventBus,
    ) -> Self {
        Self { project: project.to_string(), processes, store, events }
    }

    /// Stand up one relay per mapping, targeting the replica's address.
    #[instrument(skip(self, specs), fields(project = %self.project))]
    pub async fn establish(
        &self,
        service: &str,
        replica: u32,
        target_ip: IpAddr,
        specs: &[PortSpec],
    ) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }

        if !self.processes.which(RELAY_TOOL) {
            return Err(CompoteError::RelayToolMissing { tool: RELAY_TOOL.to_string() });
        }

        for spec in specs {
            let argv = vec![
                RELAY_TOOL.to_string(),
                spec.protocol.to_string(),
                format!("{}:{}", spec.host_ip, spec.host_port),
                format!("{}:{}", target_ip, spec.container_port),
            ];

            let pid = self.processes.spawn(&argv)?;
            let id = forward_id(service, replica, spec.protocol, spec.host_port);

            info!(
                service = %service,
                replica,
                host_port = spec.host_port,
                target = %target_ip,
                pid,
                "Port forward established"
            );

            self.store
                .update_port_forward(PortForwardInfo {
                    id: id.clone(),
                    service_name: service.to_string(),
                    replica_index: replica,
                    host_ip: spec.host_ip,
                    host_port: spec.host_port,
                    target_ip,
                    target_port: spec.container_port,
                    proto: spec.protocol,
                    pid,
                })
                .await?;

            self.events.publish(
                Event::new(EventKind::PortForwardSpawned, &self.project, id)
                    .with_service(service)
                    .with_replica(replica),
            );
        }

        Ok(())
    }

    /// Terminate and drop every forward recorded for one replica.
    #[instrument(skip(self), fields(project = %self.project))]
    pub async fn remove_for_replica(&self, service: &str, replica: u32) -> Result<()> {
        let state = self.store.load().await?;

        let owned: Vec<PortForwardInfo> = state
            .port_forwards
            .values()
            .filter(|f| f.service_name == service && f.replica_index == replica)
            .cloned()
            .collect();

        for forward in owned {
            self.terminate_and_drop(&forward).await?;
        }

        Ok(())
    }

    /// Orphan sweep: terminate and drop every forward in project state.
    #[instrument(skip(self), fields(project = %self.project))]
    pub async fn remove_all(&self) -> Result<()> {
        let state = self.store.load().await?;

        for forward in state.port_forwards.values() {
            self.terminate_and_drop(forward).await?;
        }

        Ok(())
    }

    async fn terminate_and_drop(&self, forward: &PortForwardInfo) -> Result<()> {
        // The pid may belong to a previous process; signal and proceed.
        if let Err(e) = self.processes.terminate(forward.pid) {
            debug!(id = %forward.id, pid = forward.pid, error = %e, "Relay signal failed");
        }

        self.store.remove_port_forward(&forward.id).await?;

        self.events.publish(
            Event::new(EventKind::PortForwardTerminated, &self.project, forward.id.clone())
                .with_service(&forward.service_name)
                .with_replica(forward.replica_index),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records spawned argvs and terminated pids; can hide the relay tool.
    struct FakeSupervisor {
        available: bool,
        spawned: Mutex<Vec<Vec<String>>>,
        terminated: Mutex<Vec<u32>>,
        next_pid: Mutex<u32>,
    }

    impl FakeSupervisor {
        fn new(available: bool) -> Self {
            Self {
                available,
                spawned: Mutex::new(Vec::new()),
                terminated: Mutex::new(Vec::new()),
                next_pid: Mutex::new(1000),
            }
        }
    }

    impl ProcessSupervisor for FakeSupervisor {
        fn spawn(&self, argv: &[String]) -> Result<u32> {
            self.spawned.lock().unwrap().push(argv.to_vec());
            let mut pid = self.next_pid.lock().unwrap();
            *pid += 1;
            Ok(*pid)
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }

        fn which(&self, _tool: &str) -> bool {
            self.available
        }
    }

    fn setup(available: bool) -> (TempDir, Arc<FakeSupervisor>, ForwardSupervisor) {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeSupervisor::new(available));
        let store = Arc::new(StateStore::at_path(dir.path().join("demo.json")));
        let forwards =
            ForwardSupervisor::new("demo", processes.clone(), store, EventBus::new());
        (dir, processes, forwards)
    }

    fn tcp(host_port: u16, container_port: u16) -> PortSpec {
        PortSpec {
            host_ip: PortSpec::DEFAULT_HOST_IP,
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    #[tokio::test]
    async fn test_establish_records_deterministic_id() {
        let (_dir, processes, forwards) = setup(true);
        let ip: IpAddr = "192.168.64.10".parse().unwrap();

        forwards.establish("web", 1, ip, &[tcp(18080, 80)]).await.unwrap();

        let state = forwards.store.load().await.unwrap();
        let forward = &state.port_forwards["web#1#tcp#18080"];
        assert_eq!(forward.target_port, 80);
        assert!(forward.pid > 1000);

        let spawned = processes.spawned.lock().unwrap();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0][0], RELAY_TOOL);
        assert_eq!(spawned[0][1], "tcp");
        assert_eq!(spawned[0][2], "0.0.0.0:18080");
        assert_eq!(spawned[0][3], "192.168.64.10:80");
    }

    #[tokio::test]
    async fn test_missing_relay_tool() {
        let (_dir, _processes, forwards) = setup(false);
        let ip: IpAddr = "192.168.64.10".parse().unwrap();

        let err = forwards.establish("web", 1, ip, &[tcp(18080, 80)]).await.unwrap_err();
        assert!(matches!(err, CompoteError::RelayToolMissing { .. }));
    }

    #[tokio::test]
    async fn test_remove_for_replica_is_scoped() {
        let (_dir, processes, forwards) = setup(true);
        let ip: IpAddr = "192.168.64.10".parse().unwrap();

        forwards.establish("worker", 1, ip, &[tcp(19001, 9000)]).await.unwrap();
        forwards.establish("worker", 2, ip, &[tcp(19002, 9000)]).await.unwrap();

        forwards.remove_for_replica("worker", 2).await.unwrap();

        let state = forwards.store.load().await.unwrap();
        assert!(state.port_forwards.contains_key("worker#1#tcp#19001"));
        assert!(!state.port_forwards.contains_key("worker#2#tcp#19002"));
        assert_eq!(processes.terminated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_sweeps_everything() {
        let (_dir, processes, forwards) = setup(true);
        let ip: IpAddr = "192.168.64.10".parse().unwrap();

        forwards.establish("web", 1, ip, &[tcp(18080, 80), tcp(18443, 443)]).await.unwrap();
        forwards.establish("worker", 1, ip, &[tcp(19000, 9000)]).await.unwrap();

        forwards.remove_all().await.unwrap();

        let state = forwards.store.load().await.unwrap();
        assert!(state.port_forwards.is_empty());
        assert_eq!(processes.terminated.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_establish_no_specs_is_noop() {
        let (_dir, processes, forwards) = setup(false);
        let ip: IpAddr = "192.168.64.10".parse().unwrap();

        // No specs: the relay tool is not even consulted.
        forwards.establish("web", 1, ip, &[]).await.unwrap();
        assert!(processes.spawned.lock().unwrap().is_empty());
    }
}
