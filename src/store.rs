//! File-backed record of which applications and drones are running.
//!
//! Each application has one `<app>.package.json` record holding its
//! descriptor, and each drone one `<app>.<pid>.json` record holding its
//! endpoint. The balancer rebuilds its routing table from these files via
//! [`ProcessRecordStore::monitor`], so it never shares memory with the
//! registry.

use crate::descriptor::ApplicationDescriptor;
use crate::error::StoreError;
use crate::events::{DroneEvent, EventBus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const RECORD_EXT: &str = ".json";
const PACKAGE_MARKER: &str = "package";

/// Endpoint fields of one drone, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
}

/// Either an application snapshot or a single drone's endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessRecord {
    Package(ApplicationDescriptor),
    Instance(InstanceRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Package,
    Instance(u32),
}

/// Identity of a record file: application name plus kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordName {
    pub app: String,
    pub kind: RecordKind,
}

impl RecordName {
    pub fn package(app: &str) -> Self {
        Self {
            app: app.to_string(),
            kind: RecordKind::Package,
        }
    }

    pub fn instance(app: &str, pid: u32) -> Self {
        Self {
            app: app.to_string(),
            kind: RecordKind::Instance(pid),
        }
    }

    pub fn file_name(&self) -> String {
        match self.kind {
            RecordKind::Package => format!("{}.{}{}", self.app, PACKAGE_MARKER, RECORD_EXT),
            RecordKind::Instance(pid) => format!("{}.{}{}", self.app, pid, RECORD_EXT),
        }
    }

    /// Parse `<app>.package.json` or `<app>.<pid>.json`
    pub fn parse(file_name: &str) -> Option<Self> {
        if file_name.starts_with('.') {
            return None;
        }
        let stem = file_name.strip_suffix(RECORD_EXT)?;
        let (app, marker) = stem.rsplit_once('.')?;
        if app.is_empty() {
            return None;
        }
        let kind = if marker == PACKAGE_MARKER {
            RecordKind::Package
        } else {
            RecordKind::Instance(marker.parse().ok()?)
        };
        Some(Self {
            app: app.to_string(),
            kind,
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::parse)
    }
}

impl ProcessRecord {
    pub fn name(&self, app_name: &str) -> RecordName {
        match self {
            ProcessRecord::Package(_) => RecordName::package(app_name),
            ProcessRecord::Instance(instance) => RecordName::instance(app_name, instance.pid),
        }
    }

    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            ProcessRecord::Package(app) => serde_json::to_vec_pretty(app),
            ProcessRecord::Instance(instance) => serde_json::to_vec_pretty(instance),
        }
    }

    fn from_json(kind: RecordKind, bytes: &[u8]) -> serde_json::Result<Self> {
        match kind {
            RecordKind::Package => serde_json::from_slice(bytes).map(ProcessRecord::Package),
            RecordKind::Instance(_) => serde_json::from_slice(bytes).map(ProcessRecord::Instance),
        }
    }
}

/// Filesystem change seen by [`ProcessRecordStore::monitor`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Full set of record files present when monitoring began
    Load(Vec<PathBuf>),
    /// A record file appeared or was rewritten
    Created(PathBuf),
    /// A record file disappeared
    Removed(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ProcessRecordStore {
    root: PathBuf,
    events: EventBus,
}

impl ProcessRecordStore {
    pub fn new(root: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            root: root.into(),
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &RecordName) -> PathBuf {
        self.root.join(name.file_name())
    }

    /// Write `record` under its deterministic file name.
    ///
    /// The file is written to a dot-prefixed temp name first and renamed,
    /// so a concurrent reader never sees a half-written record.
    pub async fn save(&self, app_name: &str, record: &ProcessRecord) -> Result<PathBuf, StoreError> {
        crate::descriptor::validate_name("app", app_name).map_err(StoreError::InvalidName)?;

        let name = record.name(app_name);
        let path = self.path_for(&name);
        let tmp = self.root.join(format!(".{}.tmp", name.file_name()));

        let bytes = record.to_json().map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;

        let result = async {
            tokio::fs::create_dir_all(&self.root).await?;
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        match result {
            Ok(()) => {
                self.events.emit(DroneEvent::RecordSaved { path: path.clone() });
                Ok(path)
            }
            Err(source) => {
                self.events.emit(DroneEvent::RecordError {
                    path: path.clone(),
                    error: source.to_string(),
                });
                Err(StoreError::Io { path, source })
            }
        }
    }

    /// Delete the record's file. A missing file is not an error.
    pub async fn remove(&self, app_name: &str, record: &ProcessRecord) -> Result<(), StoreError> {
        self.remove_name(&record.name(app_name)).await
    }

    pub async fn remove_name(&self, name: &RecordName) -> Result<(), StoreError> {
        let path = self.path_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.events.emit(DroneEvent::RecordRemoved { path });
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Process record already gone");
                Ok(())
            }
            Err(source) => {
                self.events.emit(DroneEvent::RecordError {
                    path: path.clone(),
                    error: source.to_string(),
                });
                Err(StoreError::Io { path, source })
            }
        }
    }

    /// Read and parse a record file
    pub async fn read(&self, path: &Path) -> Result<(RecordName, ProcessRecord), StoreError> {
        let name = RecordName::from_path(path)
            .ok_or_else(|| StoreError::InvalidName(path.display().to_string()))?;
        let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let record = ProcessRecord::from_json(name.kind, &bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok((name, record))
    }

    /// Names of all record files currently on disk
    pub async fn list(&self) -> Result<Vec<RecordName>, StoreError> {
        let mut names: Vec<RecordName> = scan(&self.root)
            .await?
            .keys()
            .filter_map(|p| RecordName::from_path(p))
            .collect();
        names.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(names)
    }

    /// Watch the record directory.
    ///
    /// The first event is always [`StoreEvent::Load`] with every record file
    /// present. After that, `Created`/`Removed` events follow as files
    /// change. Scan errors (for example a directory that does not exist
    /// yet) are logged and retried on the next tick. The task ends when the
    /// receiver is dropped.
    pub fn monitor(&self, interval: Duration) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(64);
        let root = self.root.clone();

        tokio::spawn(async move {
            let mut known: Option<HashMap<PathBuf, Stamp>> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let current = match scan(&root).await {
                    Ok(current) => current,
                    Err(e) => {
                        debug!(error = %e, "Record directory scan failed");
                        if known.is_some() {
                            continue;
                        }
                        HashMap::new()
                    }
                };

                let events = match known {
                    None => {
                        let mut paths: Vec<PathBuf> = current.keys().cloned().collect();
                        paths.sort();
                        vec![StoreEvent::Load(paths)]
                    }
                    Some(ref previous) => diff(previous, &current),
                };
                known = Some(current);

                for event in events {
                    if tx.send(event).await.is_err() {
                        debug!(root = %root.display(), "Record monitor receiver dropped");
                        return;
                    }
                }
            }
        });

        rx
    }
}

/// Modification stamp used to notice rewrites of an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

async fn scan(root: &Path) -> Result<HashMap<PathBuf, Stamp>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: root.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(root).await.map_err(io_err)?;
    let mut found = HashMap::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if RecordName::from_path(&path).is_none() {
            continue;
        }
        // A file removed between listing and stat simply shows up next tick
        match entry.metadata().await {
            Ok(meta) if meta.is_file() => {
                found.insert(
                    path,
                    Stamp {
                        modified: meta.modified().ok(),
                        len: meta.len(),
                    },
                );
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to stat process record"),
        }
    }

    Ok(found)
}

fn diff(previous: &HashMap<PathBuf, Stamp>, current: &HashMap<PathBuf, Stamp>) -> Vec<StoreEvent> {
    let mut created: Vec<PathBuf> = current
        .iter()
        .filter(|(path, stamp)| previous.get(*path) != Some(*stamp))
        .map(|(path, _)| path.clone())
        .collect();
    let mut removed: Vec<PathBuf> = previous
        .keys()
        .filter(|path| !current.contains_key(*path))
        .cloned()
        .collect();

    // Package records first so the balancer knows the app before its drones
    created.sort_by_key(|p| (!is_package(p), p.clone()));
    removed.sort_by_key(|p| (is_package(p), p.clone()));

    removed
        .into_iter()
        .map(StoreEvent::Removed)
        .chain(created.into_iter().map(StoreEvent::Created))
        .collect()
}

fn is_package(path: &Path) -> bool {
    matches!(
        RecordName::from_path(path),
        Some(RecordName {
            kind: RecordKind::Package,
            ..
        })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ProcessRecordStore {
        ProcessRecordStore::new(dir, EventBus::new())
    }

    fn descriptor(name: &str) -> ApplicationDescriptor {
        ApplicationDescriptor {
            name: name.to_string(),
            user: "marak".to_string(),
            domain: Some("example.com".to_string()),
            ..Default::default()
        }
    }

    fn instance(pid: u32, port: u16) -> ProcessRecord {
        ProcessRecord::Instance(InstanceRecord {
            pid,
            host: "127.0.0.1".to_string(),
            port,
            ctime: None,
        })
    }

    async fn next(rx: &mut mpsc::Receiver<StoreEvent>) -> StoreEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("store event within timeout")
            .expect("monitor still running")
    }

    #[test]
    fn test_record_file_names() {
        assert_eq!(RecordName::package("test").file_name(), "test.package.json");
        assert_eq!(RecordName::instance("test", 1234).file_name(), "test.1234.json");
    }

    #[test]
    fn test_parse_record_names() {
        assert_eq!(
            RecordName::parse("test.package.json"),
            Some(RecordName::package("test"))
        );
        assert_eq!(
            RecordName::parse("my.app.77.json"),
            Some(RecordName::instance("my.app", 77))
        );
        assert_eq!(RecordName::parse("test.json"), None);
        assert_eq!(RecordName::parse("test.abc.json"), None);
        assert_eq!(RecordName::parse(".test.1.json.tmp"), None);
        assert_eq!(RecordName::parse(".test.package.json"), None);
        assert_eq!(RecordName::parse("notes.txt"), None);
    }

    #[tokio::test]
    async fn test_save_and_read_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let package = ProcessRecord::Package(descriptor("test"));
        let path = store.save("test", &package).await.unwrap();
        assert_eq!(path, dir.path().join("test.package.json"));

        let path = store.save("test", &instance(1234, 4000)).await.unwrap();
        assert_eq!(path, dir.path().join("test.1234.json"));

        let (name, record) = store.read(&path).await.unwrap();
        assert_eq!(name, RecordName::instance("test", 1234));
        assert_eq!(record, instance(1234, 4000));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["pid"], 1234);
        assert_eq!(json["host"], "127.0.0.1");
        assert_eq!(json["port"], 4000);

        let names = store.list().await.unwrap();
        assert_eq!(
            names,
            vec![RecordName::instance("test", 1234), RecordName::package("test")]
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let record = instance(1, 4000);
        store.save("test", &record).await.unwrap();
        store.remove("test", &record).await.unwrap();
        store.remove("test", &record).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_rejects_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store.save("../escape", &instance(1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_save_emits_events() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let store = ProcessRecordStore::new(dir.path(), events);

        let path = store.save("test", &instance(5, 4000)).await.unwrap();
        match rx.recv().await.unwrap() {
            DroneEvent::RecordSaved { path: saved } => assert_eq!(saved, path),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_monitor_load_created_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .save("early", &ProcessRecord::Package(descriptor("early")))
            .await
            .unwrap();

        let mut rx = store.monitor(Duration::from_millis(20));
        assert_eq!(
            next(&mut rx).await,
            StoreEvent::Load(vec![dir.path().join("early.package.json")])
        );

        let record = instance(99, 4100);
        let path = store.save("early", &record).await.unwrap();
        assert_eq!(next(&mut rx).await, StoreEvent::Created(path.clone()));

        store.remove("early", &record).await.unwrap();
        assert_eq!(next(&mut rx).await, StoreEvent::Removed(path));
    }

    #[tokio::test]
    async fn test_monitor_survives_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-yet");
        let store = store(&root);

        let mut rx = store.monitor(Duration::from_millis(20));
        assert_eq!(next(&mut rx).await, StoreEvent::Load(Vec::new()));

        let path = store.save("late", &instance(7, 4200)).await.unwrap();
        assert_eq!(next(&mut rx).await, StoreEvent::Created(path));
    }

    #[test]
    fn test_diff_orders_packages_first() {
        let stamp = Stamp {
            modified: None,
            len: 1,
        };
        let previous = HashMap::new();
        let mut current = HashMap::new();
        current.insert(PathBuf::from("/r/a.1.json"), stamp);
        current.insert(PathBuf::from("/r/a.package.json"), stamp);

        let events = diff(&previous, &current);
        assert_eq!(
            events,
            vec![
                StoreEvent::Created(PathBuf::from("/r/a.package.json")),
                StoreEvent::Created(PathBuf::from("/r/a.1.json")),
            ]
        );

        let events = diff(&current, &previous);
        assert_eq!(
            events,
            vec![
                StoreEvent::Removed(PathBuf::from("/r/a.1.json")),
                StoreEvent::Removed(PathBuf::from("/r/a.package.json")),
            ]
        );
    }
}
