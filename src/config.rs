use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for a drone host
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration (balancer and drone API)
    #[serde(default)]
    pub server: ServerConfig,

    /// Drone supervision settings
    #[serde(default)]
    pub drone: DroneConfig,

    /// Process record store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Where application sources are materialised
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Cross-host bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Balancer HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Balancer HTTPS port (default: 443 when TLS files are set)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port of the drone REST API (default: 9002, set to 0 to disable)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Maximum idle connections per drone (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a drone to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(443)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            api_port: default_api_port(),
            pid_file: None,
            tls_cert: None,
            tls_key: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// How drones are launched and watched
#[derive(Debug, Deserialize, Clone)]
pub struct DroneConfig {
    /// Host advertised in drone endpoints and instance records
    #[serde(default = "default_drone_host")]
    pub host: String,

    /// A drone exiting sooner than this after launch "exited too quickly"
    #[serde(default = "default_min_uptime")]
    pub min_uptime_ms: u64,

    /// Window for the first port mapping to arrive
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_ms: u64,

    /// Automatic restarts after a crash; unset restarts forever
    pub max_restart: Option<u32>,

    /// Pause before an automatic restart
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Interpreter used when the start script is a `.js` file
    #[serde(default = "default_node_binary")]
    pub node_binary: String,
}

impl DroneConfig {
    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            host: default_drone_host(),
            min_uptime_ms: default_min_uptime(),
            readiness_timeout_ms: default_readiness_timeout(),
            max_restart: None,
            restart_delay_ms: default_restart_delay(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            node_binary: default_node_binary(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory holding `<app>.package.json` and `<app>.<pid>.json` records
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,

    /// How often the record directory is rescanned for changes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    /// Root for checked out / unpacked application sources
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,

    /// Scratch space for deploy uploads and downloaded archives
    #[serde(default = "default_packages_dir")]
    pub packages_dir: PathBuf,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            apps_dir: default_apps_dir(),
            packages_dir: default_packages_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BridgeConfig {
    /// Port accepting app/drone messages from other hosts (0 disables)
    #[serde(default)]
    pub port: u16,

    /// Remote balancer bridge to publish this host's drones to
    pub remote: Option<String>,
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9002
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_drone_host() -> String {
    "127.0.0.1".to_string()
}

fn default_min_uptime() -> u64 {
    200
}

fn default_readiness_timeout() -> u64 {
    5000
}

fn default_restart_delay() -> u64 {
    250
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_node_binary() -> String {
    "node".to_string()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./run")
}

fn default_poll_interval() -> u64 {
    500
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("./local")
}

fn default_packages_dir() -> PathBuf {
    PathBuf::from("./packages")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }
        if self.drone.host.trim().is_empty() {
            errors.push("drone: 'host' must not be empty".to_string());
        }
        if self.drone.readiness_timeout_ms == 0 {
            errors.push("drone: 'readiness_timeout_ms' must be greater than 0".to_string());
        }
        if self.drone.node_binary.trim().is_empty() {
            errors.push("drone: 'node_binary' must not be empty".to_string());
        }
        if self.store.poll_interval_ms == 0 {
            errors.push("store: 'poll_interval_ms' must be greater than 0".to_string());
        }
        if let Some(ref remote) = self.bridge.remote {
            if remote.trim().is_empty() {
                errors.push("bridge: 'remote' must not be empty when set".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
