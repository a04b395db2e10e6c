//! REST API of the drone service
//!
//! `dronectl` and remote tooling manage the host through these routes:
//!
//! - `GET /version`
//! - `GET /drones`, `GET /drones/info`, `GET /drones/:id`
//! - `POST /drones/:id/start|stop|restart|clean|update`
//! - `POST /drones/cleanall`
//! - `POST|PUT /drones/deploy/:user/:app` with a gzipped tarball body
//!
//! Failures answer `{"error": {"message": ..., "stderr": [...]}}` with 400
//! for caller errors and 500 for operational ones.

use crate::descriptor::ApplicationDescriptor;
use crate::drone::DroneRegistry;
use crate::error::DroneError;
use crate::repository::package_root;
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const DEPLOY_USAGE: &str = "curl -X POST --data-binary @app.tar.gz http://<host>:<port>/drones/deploy/<user>/<app>  (body: gzipped tarball of a directory containing package.json)";

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stderr: Vec<String>,
}

/// Drone service HTTP server
pub struct DroneApi {
    bind_addr: SocketAddr,
    registry: DroneRegistry,
    shutdown_rx: watch::Receiver<bool>,
}

impl DroneApi {
    pub fn new(
        bind_addr: SocketAddr,
        registry: DroneRegistry,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            registry,
            shutdown_rx,
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Drone API listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Drone API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        debug!(%method, %path, "API request");

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let response = match (&method, segments.as_slice()) {
            (&Method::GET, ["version"]) => Ok(json_response(
                StatusCode::OK,
                json!({ "version": format!("dronegate {}", env!("CARGO_PKG_VERSION")) }),
            )),
            (&Method::GET, ["drones"]) => self.list(),
            (&Method::GET, ["drones", "info"]) => self.info(),
            (&Method::POST, ["drones", "cleanall"]) => self.clean_all().await,
            (&Method::POST | &Method::PUT, ["drones", "deploy", user, app]) => {
                let (user, app) = (user.to_string(), app.to_string());
                self.deploy(&user, &app, req).await
            }
            (&Method::GET, ["drones", id]) => self.show(id),
            (&Method::POST, ["drones", id, action]) => {
                let (id, action) = (id.to_string(), action.to_string());
                self.action(&id, &action, req).await
            }
            _ => Ok(error_response(StatusCode::NOT_FOUND, "Not found", &[])),
        };

        Ok(response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
                &[],
            )
        }))
    }

    fn list(&self) -> Result<Response<Full<Bytes>>> {
        Ok(json_response(StatusCode::OK, serde_json::to_value(self.registry.list())?))
    }

    fn info(&self) -> Result<Response<Full<Bytes>>> {
        Ok(json_response(StatusCode::OK, serde_json::to_value(self.registry.info())?))
    }

    fn show(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.registry.show(id) {
            Some(runtime) => Ok(json_response(StatusCode::OK, serde_json::to_value(runtime)?)),
            None => Ok(error_response(
                StatusCode::BAD_REQUEST,
                format!("No drone(s) found for application {}", id),
                &[],
            )),
        }
    }

    async fn action(&self, id: &str, action: &str, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let body: Value = if body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(e) => {
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        format!("Invalid JSON: {}", e),
                        &[],
                    ))
                }
            }
        };

        match action {
            "start" | "clean" | "update" => {
                let app = match descriptor_from_body(&body, action, id) {
                    Ok(app) => app,
                    Err(message) => return Ok(error_response(StatusCode::BAD_REQUEST, message, &[])),
                };
                let result = match action {
                    "start" => self.registry.start(app).await.map(|drone| json!({ "drone": drone })),
                    "clean" => self.registry.clean(&app).await.map(|()| json!({ "clean": app.name })),
                    _ => self.registry.update(app).await.map(|drone| json!({ "drone": drone })),
                };
                Ok(result_response(result))
            }
            "stop" | "restart" => {
                let name = body
                    .get(action)
                    .and_then(|v| v.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or(id)
                    .to_string();
                let result = if action == "stop" {
                    self.registry.stop(&name).await
                } else {
                    self.registry.restart(&name).await
                };
                Ok(result_response(result.map(|drones| json!({ "drones": drones }))))
            }
            _ => Ok(error_response(StatusCode::NOT_FOUND, "Not found", &[])),
        }
    }

    async fn clean_all(&self) -> Result<Response<Full<Bytes>>> {
        let result = self.registry.clean_all().await;
        Ok(result_response(result.map(|cleaned| json!({ "cleaned": cleaned }))))
    }

    /// Unpack an uploaded tarball and start the app it contains
    async fn deploy(&self, user: &str, app: &str, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        if let Err(message) = crate::descriptor::validate_name("user", user)
            .and_then(|()| crate::descriptor::validate_name("name", app))
        {
            return Ok(deploy_error(message, &[]));
        }

        let packages_dir = &self.registry.repository_config().packages_dir;
        let dir = packages_dir.join(format!("{}-{}-{}", user, app, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        info!(user, app, dir = %dir.display(), "Receiving deploy");

        let (hash, unpacked) = match unpack(req.into_body(), &dir).await {
            Ok(result) => result,
            Err(e) => {
                warn!(user, app, error = %e, "Deploy upload failed");
                remove_dir(&dir).await;
                return Err(e);
            }
        };
        if let Err(stderr) = unpacked {
            warn!(user, app, "Deploy tarball could not be unpacked");
            remove_dir(&dir).await;
            return Ok(deploy_error("Error unpacking tarball".to_string(), &stderr));
        }

        let root = package_root(&dir).await;
        let descriptor = match read_package(&root, user, app, &hash).await {
            Ok(descriptor) => descriptor,
            Err(message) => {
                remove_dir(&dir).await;
                return Ok(deploy_error(message, &[]));
            }
        };

        if let Some(previous) = self.registry.show(app) {
            if let Err(e) = self.registry.clean(&previous.app).await {
                debug!(app, error = %e, "Could not clean previous deploy");
            }
        }

        let result = self.registry.start(descriptor).await;
        if result.is_err() {
            remove_dir(&dir).await;
        }
        Ok(result_response(result.map(|drone| json!({ "drone": drone }))))
    }
}

/// Stream `body` into `tar -xz -C dir`, hashing it on the way.
///
/// The inner result is the tar stderr when extraction failed or
/// complained.
async fn unpack(mut body: Incoming, dir: &Path) -> Result<(String, Result<(), Vec<String>>)> {
    let mut child = Command::new("tar")
        .arg("-xz")
        .arg("-C")
        .arg(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut output = String::new();
            let _ = stderr.read_to_string(&mut output).await;
            output
        })
    });

    let mut hasher = Sha1::new();
    let mut stdin = child.stdin.take();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        hasher.update(&data);
        if let Some(pipe) = stdin.as_mut() {
            if pipe.write_all(&data).await.is_err() {
                // tar gave up; keep reading so the hash covers the whole upload
                stdin = None;
            }
        }
    }
    drop(stdin);

    let status = child.wait().await?;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let hash = hex::encode(hasher.finalize());

    let lines: Vec<String> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if !status.success() || !lines.is_empty() {
        let lines = if lines.is_empty() {
            vec![format!("tar exited with {}", status)]
        } else {
            lines
        };
        return Ok((hash, Err(lines)));
    }
    Ok((hash, Ok(())))
}

/// The uploaded `package.json`, tagged with owner, hash and location
async fn read_package(root: &Path, user: &str, app: &str, hash: &str) -> Result<ApplicationDescriptor, String> {
    let path = root.join("package.json");
    let contents = tokio::fs::read(&path)
        .await
        .map_err(|_| "Tarball does not contain a package.json".to_string())?;
    let mut package: Value =
        serde_json::from_slice(&contents).map_err(|e| format!("Invalid package.json: {}", e))?;
    let Some(fields) = package.as_object_mut() else {
        return Err("Invalid package.json: not an object".to_string());
    };

    fields.insert("name".to_string(), json!(app));
    fields.insert("user".to_string(), json!(user));
    fields.insert("hash".to_string(), json!(hash));
    fields.insert(
        "repository".to_string(),
        json!({ "type": "local", "directory": absolute(root).display().to_string() }),
    );

    serde_json::from_value(package).map_err(|e| format!("Invalid package.json: {}", e))
}

/// Descriptor from `{"<key>": {...}}` or from the bare body; the path id
/// fills in a missing name
fn descriptor_from_body(body: &Value, key: &str, id: &str) -> Result<ApplicationDescriptor, String> {
    let mut value = match body.get(key) {
        Some(inner) if inner.is_object() => inner.clone(),
        _ if body.is_object() => body.clone(),
        _ => return Err(format!("Request body must contain a '{}' application", key)),
    };
    if let Some(fields) = value.as_object_mut() {
        fields.entry("name").or_insert_with(|| json!(id));
    }
    serde_json::from_value(value).map_err(|e| format!("Invalid application: {}", e))
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        debug!(dir = %dir.display(), error = %e, "Failed to remove deploy directory");
    }
}

fn result_response(result: Result<Value, DroneError>) -> Response<Full<Bytes>> {
    match result {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            if !e.is_user_error() {
                warn!(error = %e, "Drone operation failed");
            }
            error_response(e.status_code(), e.to_string(), e.stderr())
        }
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response")
}

fn error_response(status: StatusCode, message: impl Into<String>, stderr: &[String]) -> Response<Full<Bytes>> {
    let error = ErrorBody {
        message: message.into(),
        stderr: stderr.to_vec(),
    };
    json_response(status, json!({ "error": error }))
}

fn deploy_error(message: String, stderr: &[String]) -> Response<Full<Bytes>> {
    let error = ErrorBody {
        message,
        stderr: stderr.to_vec(),
    };
    json_response(
        StatusCode::BAD_REQUEST,
        json!({ "error": error, "usage": DEPLOY_USAGE }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::drone::RegistrySettings;
    use crate::events::EventBus;
    use crate::store::ProcessRecordStore;
    use crate::supervisor::SupervisorConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn start_api(root: &Path) -> (u16, watch::Sender<bool>) {
        let events = EventBus::new();
        let store = ProcessRecordStore::new(root.join("store"), events.clone());
        let settings = RegistrySettings {
            supervisor: SupervisorConfig::default(),
            repository: RepositoryConfig {
                apps_dir: root.join("local"),
                packages_dir: root.join("packages"),
            },
            api_port: 9002,
        };
        let registry = DroneRegistry::new(settings, store, events);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = watch::channel(false);
        let api = DroneApi::new(listener.local_addr().unwrap(), registry, rx);
        tokio::spawn(api.serve(listener));
        (port, tx)
    }

    async fn request(port: u16, method: &str, path: &str, body: &[u8]) -> (u16, Value) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let head = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            method,
            path,
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let status = response[9..12].parse().unwrap();
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        (status, serde_json::from_str(body).unwrap())
    }

    #[tokio::test]
    async fn test_version() {
        let root = tempfile::tempdir().unwrap();
        let (port, _shutdown) = start_api(root.path()).await;

        let (status, body) = request(port, "GET", "/version", b"").await;
        assert_eq!(status, 200);
        assert!(body["version"].as_str().unwrap().starts_with("dronegate "));
    }

    #[tokio::test]
    async fn test_empty_host() {
        let root = tempfile::tempdir().unwrap();
        let (port, _shutdown) = start_api(root.path()).await;

        let (status, body) = request(port, "GET", "/drones", b"").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({}));

        let (status, body) = request(port, "GET", "/drones/info", b"").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!([]));

        let (status, body) = request(port, "GET", "/drones/test", b"").await;
        assert_eq!(status, 400);
        assert!(body["error"]["message"].as_str().unwrap().contains("test"));
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let root = tempfile::tempdir().unwrap();
        let (port, _shutdown) = start_api(root.path()).await;

        let (status, body) = request(
            port,
            "POST",
            "/drones/test/stop",
            br#"{"stop":{"name":"test"}}"#,
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(
            body["error"]["message"],
            "Cannot stop application that is not running."
        );
    }

    #[tokio::test]
    async fn test_start_with_bad_body() {
        let root = tempfile::tempdir().unwrap();
        let (port, _shutdown) = start_api(root.path()).await;

        let (status, body) = request(port, "POST", "/drones/test/start", b"not json").await;
        assert_eq!(status, 400);
        assert!(body["error"]["message"].as_str().unwrap().starts_with("Invalid JSON"));

        let (status, body) = request(
            port,
            "POST",
            "/drones/test/start",
            br#"{"start":{"user":"marak","repository":{"type":"svn"},"scripts":{"start":"server.js"}}}"#,
        )
        .await;
        assert_eq!(status, 400);
        assert!(body["error"]["message"].as_str().unwrap().contains("svn"));
    }

    #[tokio::test]
    async fn test_deploy_rejects_non_gzip() {
        let root = tempfile::tempdir().unwrap();
        let (port, _shutdown) = start_api(root.path()).await;

        let (status, body) = request(
            port,
            "POST",
            "/drones/deploy/marak/test",
            b"this is not a tarball",
        )
        .await;
        assert_eq!(status, 400);
        assert!(body["usage"].as_str().unwrap().contains("/drones/deploy/"));
        assert!(!body["error"]["stderr"].as_array().unwrap().is_empty());

        // The failed upload is not left behind
        let leftovers = std::fs::read_dir(root.path().join("packages")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_truncated_upload_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let (port, _shutdown) = start_api(root.path()).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(
                b"POST /drones/deploy/marak/test HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100000\r\n\r\npartial",
            )
            .await
            .unwrap();
        // Give the server time to create the deploy directory, then hang up
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let packages = root.path().join("packages");
        assert_eq!(std::fs::read_dir(&packages).unwrap().count(), 1);
        drop(stream);

        let mut empty = false;
        for _ in 0..50 {
            empty = std::fs::read_dir(&packages)
                .map(|entries| entries.count() == 0)
                .unwrap_or(true);
            if empty {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(empty, "deploy directory left behind after a broken upload");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let root = tempfile::tempdir().unwrap();
        let (port, _shutdown) = start_api(root.path()).await;

        let (status, _) = request(port, "DELETE", "/drones/test", b"").await;
        assert_eq!(status, 404);
        let (status, _) = request(port, "POST", "/drones/test/explode", b"").await;
        assert_eq!(status, 404);
    }

    #[test]
    fn test_descriptor_from_body() {
        let body = json!({ "start": { "user": "marak", "scripts": { "start": "server.js" } } });
        let app = descriptor_from_body(&body, "start", "test").unwrap();
        assert_eq!(app.name, "test");
        assert_eq!(app.user, "marak");

        let bare = json!({ "name": "other", "user": "marak" });
        assert_eq!(descriptor_from_body(&bare, "clean", "test").unwrap().name, "other");

        assert!(descriptor_from_body(&Value::Null, "start", "test").is_err());
    }

    #[tokio::test]
    async fn test_read_package_augments_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"ignored","scripts":{"start":"server.js"},"engines":{"node":"0.4"}}"#,
        )
        .unwrap();

        let app = read_package(dir.path(), "marak", "test", "abc123").await.unwrap();
        assert_eq!(app.name, "test");
        assert_eq!(app.user, "marak");
        assert_eq!(app.hash.as_deref(), Some("abc123"));
        assert_eq!(app.repository.kind, "local");
        assert!(app.extra.contains_key("engines"));

        let missing = tempfile::tempdir().unwrap();
        assert!(read_package(missing.path(), "marak", "test", "abc").await.is_err());
    }
}
