//! Domain events published by the registry, the supervisor and the record store.
//!
//! Components publish to an [`EventBus`]; logging and the remote balancer
//! publisher are independent subscribers.

use crate::descriptor::{ApplicationDescriptor, DroneInfo, PortMapping};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the broadcast channel; slow subscribers lag rather than block
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum DroneEvent {
    /// A start was requested
    Starting { app: String, user: String },
    /// A drone passed its readiness window
    Started {
        app: ApplicationDescriptor,
        drone: DroneInfo,
    },
    /// A drone was relaunched and now runs under a new pid
    Restarted {
        app: String,
        old_pid: u32,
        drone: DroneInfo,
    },
    /// A drone was stopped on request
    Stopped { app: String, pid: u32 },
    /// A running drone exited unexpectedly; it may be restarted
    Crashed {
        app: String,
        pid: u32,
        status: String,
    },
    /// A drone exhausted its restarts (or could not be relaunched)
    Died { app: String, pid: u32 },
    /// The last drone of an app is gone
    AppRemoved { app: String },
    /// A drone reported a desired-to-actual port substitution
    PortMapped {
        app: String,
        pid: u32,
        mapping: PortMapping,
    },
    RecordSaved { path: PathBuf },
    RecordRemoved { path: PathBuf },
    RecordError { path: PathBuf, error: String },
}

/// Cloneable handle to the host's event stream
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DroneEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: DroneEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DroneEvent> {
        self.tx.subscribe()
    }

    /// Subscribe a task that renders every event as a log line
    pub fn spawn_logger(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn log_event(event: &DroneEvent) {
    match event {
        DroneEvent::Starting { app, user } => info!(app, user, "Starting drone"),
        DroneEvent::Started { app, drone } => info!(
            app = %app.name,
            user = %app.user,
            pid = drone.pid,
            host = %drone.host,
            port = drone.port,
            "Drone started"
        ),
        DroneEvent::Restarted { app, old_pid, drone } => info!(
            app,
            old_pid,
            pid = drone.pid,
            port = drone.port,
            "Drone restarted"
        ),
        DroneEvent::Stopped { app, pid } => info!(app, pid, "Drone stopped"),
        DroneEvent::Crashed { app, pid, status } => {
            warn!(app, pid, status = %status, "Drone crashed")
        }
        DroneEvent::Died { app, pid } => warn!(app, pid, "Drone died and will not be restarted"),
        DroneEvent::AppRemoved { app } => info!(app, "Application has no drones left"),
        DroneEvent::PortMapped { app, pid, mapping } => info!(
            app,
            pid,
            desired = mapping.desired,
            actual = mapping.actual,
            "Drone port mapped"
        ),
        DroneEvent::RecordSaved { path } => debug!(path = %path.display(), "Process record saved"),
        DroneEvent::RecordRemoved { path } => {
            debug!(path = %path.display(), "Process record removed")
        }
        DroneEvent::RecordError { path, error } => {
            warn!(path = %path.display(), error = %error, "Process record error")
        }
    }
}
