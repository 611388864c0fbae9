//! Event bus for orchestrator lifecycle events.
//!
//! Publish/subscribe fan-out of structured events: command and batch
//! boundaries, service starts and stops, healthcheck outcomes, port-forward
//! lifecycle, hydration failures, and container exits.

use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CommandStarted,
    CommandCompleted,
    BatchStarted,
    BatchCompleted,
    ServiceStarted,
    ServiceStopped,
    HealthcheckPassed,
    HealthcheckFailed,
    HydrationFailed,
    PortForwardSpawned,
    PortForwardTerminated,
    ContainerExited,
}

impl EventKind {
    /// Event type string (e.g., "service.started").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CommandStarted => "command.started",
            EventKind::CommandCompleted => "command.completed",
            EventKind::BatchStarted => "batch.started",
            EventKind::BatchCompleted => "batch.completed",
            EventKind::ServiceStarted => "service.started",
            EventKind::ServiceStopped => "service.stopped",
            EventKind::HealthcheckPassed => "healthcheck.passed",
            EventKind::HealthcheckFailed => "healthcheck.failed",
            EventKind::HydrationFailed => "state.hydration_failed",
            EventKind::PortForwardSpawned => "forward.spawned",
            EventKind::PortForwardTerminated => "forward.terminated",
            EventKind::ContainerExited => "container.exited",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One orchestrator event.
#[derive(Debug, Clone)]
pub struct Event {
    pub level: EventLevel,
    pub kind: EventKind,
    pub msg: String,
    pub project: String,
    pub service: Option<String>,
    pub replica: Option<u32>,
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, project: &str, msg: impl Into<String>) -> Self {
        let level = match kind {
            EventKind::HealthcheckFailed => EventLevel::Error,
            EventKind::HydrationFailed => EventLevel::Warn,
            _ => EventLevel::Info,
        };
        Self {
            level,
            kind,
            msg: msg.into(),
            project: project.to_string(),
            service: None,
            replica: None,
            error: None,
        }
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn with_replica(mut self, replica: u32) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Broadcast bus for orchestrator events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    /// Publish an event to all subscribers. Events are also mirrored to the
    /// log stream.
    pub fn publish(&self, event: Event) {
        debug!(
            kind = %event.kind,
            project = %event.project,
            service = event.service.as_deref().unwrap_or(""),
            "Publishing event"
        );
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    /// Subscribe to events, optionally filtered by type patterns
    /// (`"service.*"`, `"healthcheck.failed"`; empty list means all).
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe(), filters }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event subscriber with optional filtering.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    filters: Vec<String>,
}

impl EventSubscriber {
    /// Receive the next matching event; `None` when the bus is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let kind = event.kind.as_str();
        self.filters.iter().any(|filter| {
            if let Some(prefix) = filter.strip_suffix(".*") {
                kind.starts_with(prefix)
            } else {
                filter == kind
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec![]);

        bus.publish(
            Event::new(EventKind::ServiceStarted, "demo", "service started")
                .with_service("web")
                .with_replica(1),
        );

        let event = tokio::time::timeout(Duration::from_millis(100), subscriber.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.kind, EventKind::ServiceStarted);
        assert_eq!(event.project, "demo");
        assert_eq!(event.service.as_deref(), Some("web"));
        assert_eq!(event.replica, Some(1));
    }

    #[tokio::test]
    async fn test_filter_match() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec!["healthcheck.*".to_string()]);

        bus.publish(Event::new(EventKind::ServiceStarted, "demo", "ignored"));
        bus.publish(
            Event::new(EventKind::HealthcheckFailed, "demo", "probe failed").with_service("app"),
        );

        let event = tokio::time::timeout(Duration::from_millis(100), subscriber.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.kind, EventKind::HealthcheckFailed);
        assert_eq!(event.level, EventLevel::Error);
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(EventKind::PortForwardSpawned.as_str(), "forward.spawned");
        assert_eq!(EventKind::ContainerExited.as_str(), "container.exited");
    }
}
