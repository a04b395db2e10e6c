//! The per-host catalogue of running applications.
//!
//! [`DroneRegistry`] is what the REST API and the CLI talk to. It fetches
//! sources through [`Repository`], launches drones through
//! [`DroneSupervisor`] and keeps the record store in step with the set of
//! live drones. Record writes are best effort: a failed write is logged
//! and the operation still succeeds.

use crate::config::{Config, RepositoryConfig};
use crate::descriptor::{ApplicationDescriptor, DroneInfo, DroneSummary};
use crate::error::DroneError;
use crate::events::{DroneEvent, EventBus};
use crate::repository::Repository;
use crate::store::{InstanceRecord, ProcessRecord, ProcessRecordStore, RecordName};
use crate::supervisor::{DroneHandle, DroneSupervisor, MonitorReport, SupervisorConfig};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Extension points around every drone launch
pub trait SpawnHooks: Send + Sync {
    /// May rewrite the descriptor; an error rejects the start
    fn before_spawn(&self, _app: &mut ApplicationDescriptor) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_spawn(&self, _drone: &DroneInfo) {}
}

/// Hooks that do nothing
pub struct NoHooks;

impl SpawnHooks for NoHooks {}

/// Snapshot of one application and its drones
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationRuntime {
    pub app: ApplicationDescriptor,
    pub drones: Vec<DroneInfo>,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub supervisor: SupervisorConfig,
    pub repository: RepositoryConfig,
    /// Port of the REST API, reported by `info`
    pub api_port: u16,
}

impl From<&Config> for RegistrySettings {
    fn from(config: &Config) -> Self {
        Self {
            supervisor: SupervisorConfig::from(&config.drone),
            repository: config.repository.clone(),
            api_port: config.server.api_port,
        }
    }
}

struct Instance {
    info: DroneInfo,
    handle: DroneHandle,
}

struct Runtime {
    app: ApplicationDescriptor,
    drones: HashMap<u32, Instance>,
    /// Monitors relaunching a crashed child, keyed by the dead pid
    relaunching: HashMap<u32, DroneHandle>,
}

impl Runtime {
    fn is_empty(&self) -> bool {
        self.drones.is_empty() && self.relaunching.is_empty()
    }

    fn snapshot(&self) -> ApplicationRuntime {
        let mut drones: Vec<DroneInfo> = self.drones.values().map(|i| i.info.clone()).collect();
        drones.sort_by(|a, b| a.ctime.cmp(&b.ctime).then(a.pid.cmp(&b.pid)));
        ApplicationRuntime {
            app: self.app.clone(),
            drones,
        }
    }
}

struct Inner {
    apps: RwLock<HashMap<String, Runtime>>,
    /// Serialises start/stop/restart per application name
    op_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    supervisor: DroneSupervisor,
    store: ProcessRecordStore,
    events: EventBus,
    repository: RepositoryConfig,
    http: reqwest::Client,
    hooks: Arc<dyn SpawnHooks>,
    api_port: u16,
}

#[derive(Clone)]
pub struct DroneRegistry {
    inner: Arc<Inner>,
}

impl DroneRegistry {
    pub fn new(settings: RegistrySettings, store: ProcessRecordStore, events: EventBus) -> Self {
        Self::with_hooks(settings, store, events, Arc::new(NoHooks))
    }

    /// Must be called within a tokio runtime; spawns the monitor report task
    pub fn with_hooks(
        settings: RegistrySettings,
        store: ProcessRecordStore,
        events: EventBus,
        hooks: Arc<dyn SpawnHooks>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let supervisor = DroneSupervisor::new(settings.supervisor, events.clone(), reports_tx);

        let inner = Arc::new(Inner {
            apps: RwLock::new(HashMap::new()),
            op_locks: DashMap::new(),
            supervisor,
            store,
            events,
            repository: settings.repository,
            http: reqwest::Client::new(),
            hooks,
            api_port: settings.api_port,
        });

        tokio::spawn(handle_reports(Arc::downgrade(&inner), reports_rx));
        Self { inner }
    }

    pub fn store(&self) -> &ProcessRecordStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn repository_config(&self) -> &RepositoryConfig {
        &self.inner.repository
    }

    /// Fetch the source if needed and launch one more drone of `app`
    pub async fn start(&self, mut app: ApplicationDescriptor) -> Result<DroneInfo, DroneError> {
        let inner = &self.inner;
        inner.events.emit(DroneEvent::Starting {
            app: app.name.clone(),
            user: app.user.clone(),
        });

        app.validate().map_err(|reason| DroneError::InvalidDescriptor {
            app: app.name.clone(),
            reason,
        })?;
        inner
            .hooks
            .before_spawn(&mut app)
            .map_err(|e| DroneError::Hook {
                app: app.name.clone(),
                message: e.to_string(),
            })?;
        let repository = Repository::from_descriptor(&app)?;

        let lock = self.op_lock(&app.name);
        let _guard = lock.lock().await;

        let dir = repository.init(&app, &inner.repository, &inner.http).await?;
        let (drone, handle) = inner.supervisor.spawn(&app, &dir).await?;

        let first = {
            let mut apps = inner.apps.write();
            let runtime = apps.entry(app.name.clone()).or_insert_with(|| Runtime {
                app: app.clone(),
                drones: HashMap::new(),
                relaunching: HashMap::new(),
            });
            let first = runtime.is_empty();
            runtime.app = app.clone();
            runtime.drones.insert(
                drone.pid,
                Instance {
                    info: drone.clone(),
                    handle,
                },
            );
            first
        };

        if first {
            inner
                .save_record(&app.name, &ProcessRecord::Package(app.clone()))
                .await;
        }
        inner.save_instance(&drone).await;

        inner.hooks.after_spawn(&drone);
        inner.events.emit(DroneEvent::Started {
            app,
            drone: drone.clone(),
        });
        Ok(drone)
    }

    /// Stop every drone of `name` and drop its records
    pub async fn stop(&self, name: &str) -> Result<Vec<DroneInfo>, DroneError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        let runtime = self
            .inner
            .apps
            .write()
            .remove(name)
            .ok_or_else(|| DroneError::NotRunning {
                app: name.to_string(),
                action: "stop",
            })?;

        let stopped = runtime.snapshot().drones;
        for instance in runtime.drones.into_values() {
            instance.handle.stop().await;
            self.inner
                .remove_record(&RecordName::instance(name, instance.info.pid))
                .await;
        }
        for (pid, handle) in runtime.relaunching {
            debug!(app = name, pid, "Stopping drone between relaunch attempts");
            handle.stop().await;
        }
        self.inner.remove_record(&RecordName::package(name)).await;
        self.inner.events.emit(DroneEvent::AppRemoved {
            app: name.to_string(),
        });

        info!(app = name, drones = stopped.len(), "Application stopped");
        Ok(stopped)
    }

    /// Relaunch every drone of `name`, keeping the drone count
    pub async fn restart(&self, name: &str) -> Result<Vec<DroneInfo>, DroneError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        let inner = &self.inner;

        let targets: Vec<(u32, DroneHandle)> = {
            let apps = inner.apps.read();
            let runtime = apps.get(name).ok_or_else(|| DroneError::NotRunning {
                app: name.to_string(),
                action: "restart",
            })?;
            runtime
                .drones
                .iter()
                .map(|(pid, instance)| (*pid, instance.handle.clone()))
                .chain(runtime.relaunching.iter().map(|(pid, handle)| (*pid, handle.clone())))
                .collect()
        };

        let mut restarted = Vec::with_capacity(targets.len());
        let mut failure = None;
        for (old_pid, handle) in targets {
            match handle.restart(old_pid).await {
                Ok(drone) => {
                    inner.swap_instance(name, old_pid, drone.clone()).await;
                    restarted.push(drone);
                }
                Err(e) => {
                    warn!(app = name, pid = old_pid, error = %e, "Drone restart failed");
                    inner.drop_instance(name, old_pid).await;
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(restarted),
        }
    }

    /// Stop `app` (best effort) and remove its source from disk
    pub async fn clean(&self, app: &ApplicationDescriptor) -> Result<(), DroneError> {
        if let Err(e) = self.stop(&app.name).await {
            debug!(app = %app.name, error = %e, "Nothing to stop before clean");
        }
        Repository::from_descriptor(app)?
            .clean(app, &self.inner.repository)
            .await
    }

    /// Stop, clean and start `app` from a fresh source
    pub async fn update(&self, app: ApplicationDescriptor) -> Result<DroneInfo, DroneError> {
        self.clean(&app).await?;
        self.start(app).await
    }

    /// Clean every running application; returns the names cleaned
    pub async fn clean_all(&self) -> Result<Vec<String>, DroneError> {
        let apps: Vec<ApplicationDescriptor> = self
            .inner
            .apps
            .read()
            .values()
            .map(|runtime| runtime.app.clone())
            .collect();

        let mut cleaned = Vec::with_capacity(apps.len());
        let mut failure = None;
        for app in apps {
            match self.clean(&app).await {
                Ok(()) => cleaned.push(app.name),
                Err(e) => {
                    warn!(app = %app.name, error = %e, "Clean failed");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(cleaned),
        }
    }

    /// Stop every application; used at shutdown
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.inner.apps.read().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                debug!(app = %name, error = %e, "Application already gone at shutdown");
            }
        }
    }

    pub fn show(&self, name: &str) -> Option<ApplicationRuntime> {
        self.inner.apps.read().get(name).map(Runtime::snapshot)
    }

    pub fn list(&self) -> BTreeMap<String, ApplicationRuntime> {
        self.inner
            .apps
            .read()
            .iter()
            .map(|(name, runtime)| (name.clone(), runtime.snapshot()))
            .collect()
    }

    /// One row per running drone across all applications
    pub fn info(&self) -> Vec<DroneSummary> {
        self.list()
            .into_values()
            .flat_map(|runtime| runtime.drones)
            .map(|drone| DroneSummary {
                user: drone.user,
                name: drone.name,
                version: drone.version,
                ctime: drone.ctime,
                host: drone.host,
                port: drone.port,
                hash: drone.hash,
                api_port: self.inner.api_port,
            })
            .collect()
    }

    fn op_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.inner.op_locks.entry(name.to_string()).or_default().value())
    }
}

impl Inner {
    async fn save_record(&self, app: &str, record: &ProcessRecord) {
        if let Err(e) = self.store.save(app, record).await {
            warn!(app, error = %e, "Failed to save process record");
        }
    }

    async fn save_instance(&self, drone: &DroneInfo) {
        let record = ProcessRecord::Instance(InstanceRecord {
            pid: drone.pid,
            host: drone.host.clone(),
            port: drone.port,
            ctime: Some(drone.ctime),
        });
        self.save_record(&drone.name, &record).await;
    }

    async fn remove_record(&self, name: &RecordName) {
        if let Err(e) = self.store.remove_name(name).await {
            warn!(app = %name.app, error = %e, "Failed to remove process record");
        }
    }

    /// Take a crashed drone out of the live set until its monitor reports
    /// a relaunch or gives up
    async fn mark_crashed(&self, app: &str, pid: u32) -> bool {
        let moved = {
            let mut apps = self.apps.write();
            match apps.get_mut(app) {
                Some(runtime) => match runtime.drones.remove(&pid) {
                    Some(instance) => {
                        runtime.relaunching.insert(pid, instance.handle);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };

        if moved {
            self.remove_record(&RecordName::instance(app, pid)).await;
        }
        moved
    }

    /// Re-key a drone after its child was replaced. Returns false when the
    /// old pid is no longer tracked.
    async fn swap_instance(&self, app: &str, old_pid: u32, drone: DroneInfo) -> bool {
        let swapped = {
            let mut apps = self.apps.write();
            match apps.get_mut(app) {
                Some(runtime) => {
                    let handle = match runtime.drones.remove(&old_pid) {
                        Some(instance) => Some(instance.handle),
                        None => runtime.relaunching.remove(&old_pid),
                    };
                    match handle {
                        Some(handle) => {
                            runtime.drones.insert(
                                drone.pid,
                                Instance {
                                    info: drone.clone(),
                                    handle,
                                },
                            );
                            true
                        }
                        None => false,
                    }
                }
                None => false,
            }
        };

        if swapped {
            self.remove_record(&RecordName::instance(app, old_pid)).await;
            self.save_instance(&drone).await;
        }
        swapped
    }

    /// Forget a drone that is gone; drops the app once it has none left
    async fn drop_instance(&self, app: &str, pid: u32) {
        let (found, emptied) = {
            let mut apps = self.apps.write();
            let Some(runtime) = apps.get_mut(app) else {
                return;
            };
            let found = runtime.drones.remove(&pid).is_some();
            runtime.relaunching.remove(&pid);
            let emptied = runtime.is_empty();
            if emptied {
                apps.remove(app);
            }
            (found, emptied)
        };

        if found {
            self.remove_record(&RecordName::instance(app, pid)).await;
        }
        if emptied {
            self.remove_record(&RecordName::package(app)).await;
            self.events.emit(DroneEvent::AppRemoved {
                app: app.to_string(),
            });
        }
    }

    async fn apply_report(&self, report: MonitorReport) {
        match report {
            MonitorReport::Crashed { app, pid } => {
                if self.mark_crashed(&app, pid).await {
                    info!(app, pid, "Drone crashed, waiting for relaunch");
                }
            }
            MonitorReport::Restarted { app, old_pid, drone } => {
                if !self.swap_instance(&app, old_pid, drone).await {
                    debug!(app, pid = old_pid, "Restart report for an untracked drone");
                }
            }
            MonitorReport::Died { app, pid } => {
                info!(app, pid, "Removing dead drone");
                self.drop_instance(&app, pid).await;
            }
            MonitorReport::Mapped { app, pid, mapping } => {
                let mut apps = self.apps.write();
                if let Some(instance) = apps.get_mut(&app).and_then(|r| r.drones.get_mut(&pid)) {
                    if !instance.info.port_mappings.contains(&mapping) {
                        instance.info.port_mappings.push(mapping);
                    }
                }
            }
        }
    }
}

/// Route monitor reports to one worker per application so a slow
/// operation on one app never delays reports for another
async fn handle_reports(inner: Weak<Inner>, mut reports: mpsc::UnboundedReceiver<MonitorReport>) {
    let mut workers: HashMap<String, mpsc::UnboundedSender<MonitorReport>> = HashMap::new();

    while let Some(report) = reports.recv().await {
        if inner.strong_count() == 0 {
            break;
        }
        workers.retain(|_, worker| !worker.is_closed());

        let app = report.app().to_string();
        let worker = workers.entry(app.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(apply_reports(inner.clone(), app, rx));
            tx
        });
        if let Err(mpsc::error::SendError(report)) = worker.send(report) {
            debug!(app = report.app(), "Report worker gone, dropping report");
        }
    }
    debug!("Monitor report handler stopped");
}

/// Apply one application's reports in order, each under its op lock
async fn apply_reports(inner: Weak<Inner>, app: String, mut reports: mpsc::UnboundedReceiver<MonitorReport>) {
    while let Some(report) = reports.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // Wait out any start/stop/restart in flight for the same app
        let lock = Arc::clone(inner.op_locks.entry(app.clone()).or_default().value());
        let _guard = lock.lock().await;
        inner.apply_report(report).await;
    }
    debug!(app = %app, "Report worker stopped");
}
