//! Virtual-host load balancer in front of the drones.
//!
//! The routing table maps application name to a [`RoutingEntry`]: the
//! app's descriptor (for domain matching) and its ordered list of drone
//! endpoints. The table is fed by process record store events and, for
//! drones on other hosts, by the balancer bridge. Requests are dispatched
//! round-robin by rotating the head endpoint to the tail.

use crate::descriptor::{ApplicationDescriptor, DroneInfo};
use crate::error::{json_error_response, text_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::store::{InstanceRecord, ProcessRecord, ProcessRecordStore, RecordKind, RecordName, StoreEvent};
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Longest hostname DNS allows
const MAX_HOSTNAME_LEN: usize = 253;

/// Where one drone can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub pid: u32,
    pub host: String,
    pub port: u16,
}

impl From<&DroneInfo> for Endpoint {
    fn from(drone: &DroneInfo) -> Self {
        Self {
            pid: drone.pid,
            host: drone.host.clone(),
            port: drone.port,
        }
    }
}

impl From<&InstanceRecord> for Endpoint {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            pid: record.pid,
            host: record.host.clone(),
            port: record.port,
        }
    }
}

pub struct RoutingEntry {
    descriptor: RwLock<ApplicationDescriptor>,
    instances: Mutex<VecDeque<Endpoint>>,
}

impl RoutingEntry {
    fn new(descriptor: ApplicationDescriptor) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            instances: Mutex::new(VecDeque::new()),
        }
    }

    pub fn descriptor(&self) -> ApplicationDescriptor {
        self.descriptor.read().clone()
    }

    pub fn instances(&self) -> Vec<Endpoint> {
        self.instances.lock().iter().cloned().collect()
    }

    /// Select the head endpoint and move it to the tail in one step
    fn next(&self) -> Option<Endpoint> {
        let mut instances = self.instances.lock();
        let endpoint = instances.pop_front()?;
        instances.push_back(endpoint.clone());
        Some(endpoint)
    }

    fn serves(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.descriptor
            .read()
            .all_domains()
            .iter()
            .any(|d| pred(d))
    }
}

/// Outcome of routing a host name
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Drone { app: String, endpoint: Endpoint },
    /// The app is known but has no endpoints right now
    NoDrones { app: String },
    NotFound,
}

pub struct LoadBalancer {
    apps: DashMap<String, Arc<RoutingEntry>>,
    pool: ConnectionPool,
    request_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl LoadBalancer {
    pub fn new(pool_config: PoolConfig, request_timeout: Duration) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            apps: DashMap::new(),
            pool: ConnectionPool::new(pool_config),
            request_timeout,
            closed,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Register an application or replace its descriptor, keeping endpoints
    pub fn set_app(&self, descriptor: ApplicationDescriptor) {
        let name = descriptor.name.clone();
        let entry = self.entry_or_placeholder(&name);
        *entry.descriptor.write() = descriptor;
        debug!(app = %name, "Application registered with balancer");
    }

    pub fn remove_app(&self, name: &str) -> bool {
        let removed = self.apps.remove(name).is_some();
        if removed {
            debug!(app = %name, "Application removed from balancer");
        }
        removed
    }

    /// Add an endpoint to the tail of `app`'s list. An endpoint with the
    /// same host and pid is replaced in place.
    pub fn add_drone(&self, app: &str, endpoint: Endpoint) {
        let entry = self.entry_or_placeholder(app);
        let mut instances = entry.instances.lock();
        match instances
            .iter_mut()
            .find(|e| e.pid == endpoint.pid && e.host == endpoint.host)
        {
            Some(existing) => *existing = endpoint,
            None => {
                debug!(app, pid = endpoint.pid, host = %endpoint.host, port = endpoint.port, "Drone added to balancer");
                instances.push_back(endpoint);
            }
        }
    }

    /// Remove every endpoint of `app` with this pid
    pub fn remove_drone(&self, app: &str, pid: u32) -> bool {
        self.remove_where(app, |e| e.pid == pid)
    }

    /// Remove the endpoint of `app` with this pid on `host`
    pub fn remove_endpoint(&self, app: &str, pid: u32, host: &str) -> bool {
        self.remove_where(app, |e| e.pid == pid && e.host == host)
    }

    fn remove_where(&self, app: &str, pred: impl Fn(&Endpoint) -> bool) -> bool {
        let Some(entry) = self.apps.get(app).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let mut instances = entry.instances.lock();
        let (gone, kept): (VecDeque<Endpoint>, VecDeque<Endpoint>) =
            instances.drain(..).partition(|e| pred(e));
        *instances = kept;
        for endpoint in &gone {
            self.pool.forget(endpoint);
        }
        if !gone.is_empty() {
            debug!(app, remaining = instances.len(), "Drone removed from balancer");
        }
        !gone.is_empty()
    }

    fn entry_or_placeholder(&self, app: &str) -> Arc<RoutingEntry> {
        let entry = self.apps.entry(app.to_string()).or_insert_with(|| {
            Arc::new(RoutingEntry::new(ApplicationDescriptor {
                name: app.to_string(),
                ..Default::default()
            }))
        });
        Arc::clone(entry.value())
    }

    pub fn apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn descriptor(&self, app: &str) -> Option<ApplicationDescriptor> {
        self.apps.get(app).map(|e| e.descriptor())
    }

    pub fn instances(&self, app: &str) -> Vec<Endpoint> {
        self.apps.get(app).map(|e| e.instances()).unwrap_or_default()
    }

    /// Pick the drone for a request host.
    ///
    /// An app whose domains contain the full host wins; otherwise the
    /// registrable domains (last two labels) are compared.
    pub fn route(&self, host: &str) -> Route {
        let host = host.trim_end_matches('.').to_lowercase();
        let domain = registrable_domain(&host).to_string();

        let found = self
            .find(|d| d == host)
            .or_else(|| self.find(|d| registrable_domain(d) == domain));

        match found {
            None => Route::NotFound,
            Some((app, entry)) => match entry.next() {
                Some(endpoint) => Route::Drone { app, endpoint },
                None => Route::NoDrones { app },
            },
        }
    }

    fn find(&self, pred: impl Fn(&str) -> bool) -> Option<(String, Arc<RoutingEntry>)> {
        self.apps
            .iter()
            .find(|e| e.value().serves(&pred))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
    }

    /// Route and proxy one request
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(hostname) = extract_hostname(&req) else {
            return json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            );
        };

        let (app, endpoint) = match self.route(&hostname) {
            Route::Drone { app, endpoint } => (app, endpoint),
            Route::NoDrones { app } => {
                debug!(hostname, app, "No drones available");
                return text_error_response(
                    StatusCode::BAD_REQUEST,
                    format!("No drones for {}", hostname),
                );
            }
            Route::NotFound => {
                debug!(hostname, "No application for host");
                return text_error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Application not found for: {}", hostname),
                );
            }
        };

        // Overwrite rather than append: this is the first trusted hop
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        debug!(
            hostname,
            app,
            pid = endpoint.pid,
            port = endpoint.port,
            method = %req.method(),
            uri = %req.uri(),
            request_id,
            "Dispatching request"
        );

        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.forward(req, &endpoint),
        )
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(app, host = %endpoint.host, port = endpoint.port, error = %e, "Failed to forward request to drone");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to drone")
            }
            Err(_) => {
                warn!(
                    app,
                    port = endpoint.port,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }

    /// Apply one record store event to the routing table.
    ///
    /// Unreadable records are logged and skipped.
    pub async fn apply_store_event(&self, store: &ProcessRecordStore, event: StoreEvent) {
        match event {
            StoreEvent::Load(paths) => {
                info!(records = paths.len(), "Loading process records");
                for path in paths {
                    self.load_record(store, &path).await;
                }
            }
            StoreEvent::Created(path) => self.load_record(store, &path).await,
            StoreEvent::Removed(path) => match RecordName::from_path(&path) {
                Some(RecordName {
                    app,
                    kind: RecordKind::Package,
                }) => {
                    self.remove_app(&app);
                }
                Some(RecordName {
                    app,
                    kind: RecordKind::Instance(pid),
                }) => {
                    self.remove_drone(&app, pid);
                }
                None => {}
            },
        }
    }

    async fn load_record(&self, store: &ProcessRecordStore, path: &Path) {
        match store.read(path).await {
            Ok((name, ProcessRecord::Package(mut descriptor))) => {
                descriptor.name = name.app;
                self.set_app(descriptor);
            }
            Ok((name, ProcessRecord::Instance(record))) => {
                self.add_drone(&name.app, Endpoint::from(&record));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable process record"),
        }
    }

    /// Keep the routing table in sync with `store` until shutdown
    pub fn watch_store(
        self: &Arc<Self>,
        store: ProcessRecordStore,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = store.monitor(interval);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => balancer.apply_store_event(&store, event).await,
                        None => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Record store watcher stopped");
        })
    }

    /// Stop every server loop serving this balancer
    pub fn close(&self) {
        self.closed.send_replace(true);
        info!("Balancer closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Last two dot-separated labels of `host`
pub fn registrable_domain(host: &str) -> &str {
    let mut dots = host.rmatch_indices('.');
    match (dots.next(), dots.next()) {
        (Some(_), Some((i, _))) => &host[i + 1..],
        _ => host,
    }
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Keeps log lines and error bodies free of injected text
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// HTTP(S) front end for a [`LoadBalancer`]
pub struct BalancerServer {
    bind_addr: SocketAddr,
    balancer: Arc<LoadBalancer>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl BalancerServer {
    pub fn new(
        bind_addr: SocketAddr,
        balancer: Arc<LoadBalancer>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            balancer,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Balancer listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut closed_rx = self.balancer.closed.subscribe();
        if *closed_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let balancer = Arc::clone(&self.balancer);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, client_addr, balancer, true).await {
                                                debug!(addr = %client_addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => debug!(addr = %client_addr, error = %e, "TLS handshake failed"),
                                    }
                                } else if let Err(e) = handle_connection(stream, client_addr, balancer, false).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(protocol, "Balancer shutting down");
                        break;
                    }
                }
                changed = closed_rx.changed() => {
                    if changed.is_err() || *closed_rx.borrow() {
                        info!(protocol, "Balancer transport closed");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    balancer: Arc<LoadBalancer>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let balancer = Arc::clone(&balancer);
        async move { Ok::<_, hyper::Error>(balancer.handle(req, client_addr, is_tls).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Build a TLS acceptor from PEM certificate chain and key files
pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}
