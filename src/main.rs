use dronegate::api::DroneApi;
use dronegate::balancer::{load_tls_acceptor, BalancerServer, LoadBalancer};
use dronegate::bridge::{BalancerBridge, RemotePublisher};
use dronegate::config::Config;
use dronegate::drone::{DroneRegistry, RegistrySettings};
use dronegate::events::EventBus;
use dronegate::pool::PoolConfig;
use dronegate::store::ProcessRecordStore;
use dronegate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dronegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = match pid_file_path {
        Some(ref path) => {
            let pid_file = PidFile::create(path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let events = EventBus::new();
    events.spawn_logger();

    tokio::fs::create_dir_all(&config.store.dir).await?;
    tokio::fs::create_dir_all(&config.repository.packages_dir).await?;
    let store = ProcessRecordStore::new(&config.store.dir, events.clone());
    let registry = DroneRegistry::new(RegistrySettings::from(&config), store.clone(), events.clone());

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let balancer = LoadBalancer::new(pool_config, config.server.request_timeout());
    handles.push(balancer.watch_store(
        store,
        config.store.poll_interval(),
        shutdown_rx.clone(),
    ));

    let http_port = config.server.http_port();
    if http_port > 0 {
        let addr = socket_addr(&config.server.bind, http_port)?;
        let server = BalancerServer::new(addr, balancer.clone(), shutdown_rx.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP balancer error");
            }
        }));
    }

    let https_port = config.server.https_port();
    if https_port > 0 {
        if let (Some(cert), Some(key)) = (&config.server.tls_cert, &config.server.tls_key) {
            let acceptor = load_tls_acceptor(cert, key)?;
            info!(cert = %cert, key = %key, "TLS enabled with provided certificates");
            let addr = socket_addr(&config.server.bind, https_port)?;
            let server = BalancerServer::new(addr, balancer.clone(), shutdown_rx.clone()).with_tls(acceptor);
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS balancer error");
                }
            }));
        }
    }

    if config.server.api_port > 0 {
        let addr = socket_addr(&config.server.bind, config.server.api_port)?;
        let api = DroneApi::new(addr, registry.clone(), shutdown_rx.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = api.run().await {
                error!(error = %e, "Drone API error");
            }
        }));
    }

    if config.bridge.port > 0 {
        let addr = socket_addr(&config.server.bind, config.bridge.port)?;
        let bridge = BalancerBridge::new(balancer.clone());
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = bridge.run(addr, shutdown).await {
                error!(error = %e, "Balancer bridge error");
            }
        }));
    }

    if let Some(ref remote) = config.bridge.remote {
        info!(remote = %remote, "Publishing drones to remote balancer");
        handles.push(RemotePublisher::new(remote.clone(), events.clone()).spawn(shutdown_rx.clone()));
    }

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);
    balancer.close();

    info!("Stopping all drones...");
    registry.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting drone host");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        api_port = config.server.api_port,
        bridge_port = config.bridge.port,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        host = %config.drone.host,
        min_uptime_ms = config.drone.min_uptime_ms,
        readiness_timeout_ms = config.drone.readiness_timeout_ms,
        max_restart = ?config.drone.max_restart,
        node = %config.drone.node_binary,
        "Drone settings"
    );
    info!(
        store = %config.store.dir.display(),
        apps = %config.repository.apps_dir.display(),
        packages = %config.repository.packages_dir.display(),
        "Storage locations"
    );
}
