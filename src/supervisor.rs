//! Launches and watches drone processes.
//!
//! A launch attempt walks `SPAWNING -> WAITING_FOR_PORT -> ALIVE`. The
//! child is alive once it has reported a port mapping over its bridge and
//! has stayed up for the minimum uptime. An exit before that, or no
//! mapping within the readiness timeout, fails the attempt with the
//! child's captured stderr.
//!
//! After a successful launch a monitor task owns the child. It restarts
//! the child when it crashes (within the restart budget), and serves
//! restart and stop requests from the registry over a command channel.

use crate::bridge::{BridgeServer, BRIDGE_ADDR_ENV};
use crate::config::DroneConfig;
use crate::descriptor::{ApplicationDescriptor, DroneInfo, PortMapping};
use crate::error::DroneError;
use crate::events::{DroneEvent, EventBus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stderr lines kept for error reports (the most recent ones win)
const MAX_STDERR_LINES: usize = 100;

/// How long to wait for the stderr reader to drain after a failed attempt
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DroneState {
    Spawning,
    WaitingForPort,
    Alive,
    /// Stopped on request
    Deactivated,
    /// Exited and will not be restarted
    Dead,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Host advertised in drone endpoints
    pub host: String,
    pub min_uptime: Duration,
    pub readiness_timeout: Duration,
    /// `None` restarts forever
    pub max_restart: Option<u32>,
    pub restart_delay: Duration,
    pub grace_period: Duration,
    pub node_binary: String,
}

impl From<&DroneConfig> for SupervisorConfig {
    fn from(config: &DroneConfig) -> Self {
        Self {
            host: config.host.clone(),
            min_uptime: config.min_uptime(),
            readiness_timeout: config.readiness_timeout(),
            max_restart: config.max_restart,
            restart_delay: config.restart_delay(),
            grace_period: config.shutdown_grace_period(),
            node_binary: config.node_binary.clone(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&DroneConfig::default())
    }
}

/// Unsolicited transitions reported to the registry
#[derive(Debug, Clone)]
pub enum MonitorReport {
    /// The child exited on its own; a relaunch may follow
    Crashed { app: String, pid: u32 },
    /// The child crashed and was relaunched under a new pid
    Restarted {
        app: String,
        old_pid: u32,
        drone: DroneInfo,
    },
    /// A running drone bound another port
    Mapped {
        app: String,
        pid: u32,
        mapping: PortMapping,
    },
    /// The child exited and the restart budget is spent
    Died { app: String, pid: u32 },
}

impl MonitorReport {
    pub fn app(&self) -> &str {
        match self {
            MonitorReport::Crashed { app, .. }
            | MonitorReport::Restarted { app, .. }
            | MonitorReport::Mapped { app, .. }
            | MonitorReport::Died { app, .. } => app,
        }
    }
}

enum MonitorCommand {
    Restart(oneshot::Sender<Result<DroneInfo, DroneError>>),
    Stop(oneshot::Sender<()>),
}

/// How one relaunch attempt ended
enum Relaunch {
    Launched(Result<Running, DroneError>),
    Interrupted(Option<MonitorCommand>),
}

impl std::fmt::Debug for MonitorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorCommand::Restart(_) => f.write_str("Restart"),
            MonitorCommand::Stop(_) => f.write_str("Stop"),
        }
    }
}

/// Registry-side handle to a drone's monitor task
#[derive(Debug, Clone)]
pub struct DroneHandle {
    app: String,
    commands: mpsc::Sender<MonitorCommand>,
    state: watch::Receiver<DroneState>,
}

impl DroneHandle {
    pub fn state(&self) -> DroneState {
        *self.state.borrow()
    }

    /// Stop the current child and launch a fresh one.
    ///
    /// Manual restarts do not count against the automatic restart budget.
    pub async fn restart(&self, pid: u32) -> Result<DroneInfo, DroneError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let gone = || DroneError::MonitorGone {
            app: self.app.clone(),
            pid,
        };
        self.commands
            .send(MonitorCommand::Restart(reply_tx))
            .await
            .map_err(|_| gone())?;
        reply_rx.await.map_err(|_| gone())?
    }

    /// Stop the child (SIGTERM, then SIGKILL after the grace period). A
    /// monitor that already finished counts as stopped.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(MonitorCommand::Stop(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

#[cfg(test)]
impl DroneHandle {
    /// A handle whose monitor has already exited
    pub(crate) fn finished(app: &str) -> Self {
        let (commands, _) = mpsc::channel(1);
        let (_, state) = watch::channel(DroneState::Dead);
        Self {
            app: app.to_string(),
            commands,
            state,
        }
    }
}

/// A child that passed its readiness window
struct Running {
    child: Child,
    drone: DroneInfo,
}

#[derive(Clone)]
pub struct DroneSupervisor {
    config: SupervisorConfig,
    events: EventBus,
    reports: mpsc::UnboundedSender<MonitorReport>,
}

impl DroneSupervisor {
    pub fn new(
        config: SupervisorConfig,
        events: EventBus,
        reports: mpsc::UnboundedSender<MonitorReport>,
    ) -> Self {
        Self {
            config,
            events,
            reports,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch `app` from `dir` and hand the child to a monitor task.
    ///
    /// Resolves once the child is alive, or with the error that ended the
    /// attempt. A failed attempt leaves no process behind.
    pub async fn spawn(
        &self,
        app: &ApplicationDescriptor,
        dir: &Path,
    ) -> Result<(DroneInfo, DroneHandle), DroneError> {
        let mut bridge = BridgeServer::bind(&app.name)
            .await
            .map_err(|source| DroneError::Spawn {
                app: app.name.clone(),
                source,
            })?;

        let running = self.launch(app, dir, &mut bridge).await?;
        let drone = running.drone.clone();

        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(DroneState::Alive);

        let monitor = Monitor {
            supervisor: self.clone(),
            app: app.clone(),
            dir: dir.to_path_buf(),
            bridge,
            commands: command_rx,
            state: state_tx,
            restarts: 0,
        };
        tokio::spawn(monitor.run(running));

        Ok((
            drone,
            DroneHandle {
                app: app.name.clone(),
                commands: command_tx,
                state: state_rx,
            },
        ))
    }

    async fn launch(
        &self,
        app: &ApplicationDescriptor,
        dir: &Path,
        bridge: &mut BridgeServer,
    ) -> Result<Running, DroneError> {
        let name = app.name.clone();
        let stale = bridge.drain();
        if stale > 0 {
            debug!(app = %name, stale, "Discarded mappings from an earlier child");
        }

        debug!(app = %name, state = ?DroneState::Spawning, "Launching drone");
        let mut command = self.build_command(app, dir, bridge.addr().to_string())?;
        let mut child = command.spawn().map_err(|source| DroneError::Spawn {
            app: name.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        let started = Instant::now();

        let stderr_buf: Arc<Mutex<Option<Vec<String>>>> = Arc::new(Mutex::new(Some(Vec::new())));
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, name.clone(), pid, None);
        }
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| forward_output(stderr, name.clone(), pid, Some(Arc::clone(&stderr_buf))));

        debug!(app = %name, pid, state = ?DroneState::WaitingForPort, "Waiting for port mapping");

        let deadline = started + self.config.readiness_timeout;
        let first = tokio::select! {
            status = child.wait() => {
                let status = describe_status(status);
                drain_stderr(stderr_task).await;
                let stderr = take_stderr(&stderr_buf);
                return Err(if started.elapsed() < self.config.min_uptime {
                    warn!(app = %name, pid, status = %status, "Drone exited too quickly");
                    DroneError::TooFastExit { app: name, stderr }
                } else {
                    warn!(app = %name, pid, status = %status, "Drone exited before reporting a port");
                    DroneError::Crashed { app: name, status, stderr }
                });
            }
            Some(mapping) = bridge.next_mapping() => mapping,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    app = %name,
                    pid,
                    timeout_ms = self.config.readiness_timeout.as_millis() as u64,
                    "No port mapping within readiness timeout, killing drone"
                );
                let _ = child.kill().await;
                *stderr_buf.lock() = None;
                return Err(DroneError::ReadinessTimeout {
                    app: name,
                    timeout_ms: self.config.readiness_timeout.as_millis() as u64,
                });
            }
        };

        // A mapping alone is not enough: the child must also outlive min_uptime
        let uptime_deadline = started + self.config.min_uptime;
        if Instant::now() < uptime_deadline {
            tokio::select! {
                status = child.wait() => {
                    let status = describe_status(status);
                    drain_stderr(stderr_task).await;
                    warn!(app = %name, pid, status = %status, "Drone exited too quickly");
                    return Err(DroneError::TooFastExit {
                        app: name,
                        stderr: take_stderr(&stderr_buf),
                    });
                }
                _ = tokio::time::sleep_until(uptime_deadline) => {}
            }
        }

        // Stop buffering; later stderr is only logged
        *stderr_buf.lock() = None;

        let mut port_mappings = vec![first];
        while let Some(mapping) = bridge.try_next_mapping() {
            port_mappings.push(mapping);
        }

        let drone = DroneInfo {
            name: name.clone(),
            user: app.user.clone(),
            pid,
            host: self.config.host.clone(),
            port: first.actual,
            ctime: Utc::now(),
            version: app.version.clone(),
            hash: app.hash.clone(),
            port_mappings,
        };

        info!(
            app = %name,
            pid,
            port = drone.port,
            desired = first.desired,
            state = ?DroneState::Alive,
            "Drone is alive"
        );
        Ok(Running { child, drone })
    }

    fn build_command(
        &self,
        app: &ApplicationDescriptor,
        dir: &Path,
        bridge_addr: String,
    ) -> Result<Command, DroneError> {
        let invalid = |reason: String| DroneError::InvalidDescriptor {
            app: app.name.clone(),
            reason,
        };

        let mut words = shell_words::split(&app.scripts.start)
            .map_err(|e| invalid(format!("scripts.start: {}", e)))?;
        if words.is_empty() {
            return Err(invalid("scripts.start is required".to_string()));
        }
        if words[0].ends_with(".js") {
            words.insert(0, self.config.node_binary.clone());
        }

        let dir = absolute(dir);
        // Relative programs resolve against the app directory
        let program: OsString = if words[0].contains('/') && Path::new(&words[0]).is_relative() {
            dir.join(&words[0]).into_os_string()
        } else {
            words[0].clone().into()
        };

        let mut command = Command::new(program);
        command
            .args(&words[1..])
            .current_dir(&dir)
            .envs(&app.env)
            .env(BRIDGE_ADDR_ENV, bridge_addr)
            .env("DRONE_APP", &app.name)
            .env("DRONE_USER", &app.user)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(command)
    }
}

struct Monitor {
    supervisor: DroneSupervisor,
    app: ApplicationDescriptor,
    dir: PathBuf,
    bridge: BridgeServer,
    commands: mpsc::Receiver<MonitorCommand>,
    state: watch::Sender<DroneState>,
    restarts: u32,
}

impl Monitor {
    async fn run(mut self, mut running: Running) {
        let name = self.app.name.clone();

        loop {
            tokio::select! {
                status = running.child.wait() => {
                    let old_pid = running.drone.pid;
                    let status = describe_status(status);
                    self.supervisor.events.emit(DroneEvent::Crashed {
                        app: name.clone(),
                        pid: old_pid,
                        status,
                    });
                    let _ = self.supervisor.reports.send(MonitorReport::Crashed { app: name.clone(), pid: old_pid });

                    match self.relaunch_after_crash(old_pid).await {
                        Some(next) => running = next,
                        None => return,
                    }
                }
                Some(mapping) = self.bridge.next_mapping() => {
                    let pid = running.drone.pid;
                    if !running.drone.port_mappings.contains(&mapping) {
                        running.drone.port_mappings.push(mapping);
                    }
                    self.supervisor.events.emit(DroneEvent::PortMapped { app: name.clone(), pid, mapping });
                    let _ = self.supervisor.reports.send(MonitorReport::Mapped { app: name.clone(), pid, mapping });
                }
                command = self.commands.recv() => match command {
                    Some(MonitorCommand::Restart(reply)) => {
                        let old_pid = running.drone.pid;
                        terminate(&name, &mut running.child, self.supervisor.config.grace_period).await;
                        let _ = self.state.send(DroneState::Spawning);

                        match self.supervisor.launch(&self.app, &self.dir, &mut self.bridge).await {
                            Ok(next) => {
                                running = next;
                                self.report_restart(old_pid, &running.drone, false);
                                let _ = reply.send(Ok(running.drone.clone()));
                            }
                            Err(e) => {
                                warn!(app = %name, pid = old_pid, error = %e, "Manual restart failed");
                                let _ = self.state.send(DroneState::Dead);
                                self.supervisor.events.emit(DroneEvent::Died { app: name.clone(), pid: old_pid });
                                let _ = reply.send(Err(e));
                                return;
                            }
                        }
                    }
                    Some(MonitorCommand::Stop(reply)) => {
                        let pid = running.drone.pid;
                        terminate(&name, &mut running.child, self.supervisor.config.grace_period).await;
                        let _ = self.state.send(DroneState::Deactivated);
                        self.supervisor.events.emit(DroneEvent::Stopped { app: name.clone(), pid });
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        debug!(app = %name, pid = running.drone.pid, "Drone handle dropped, stopping child");
                        terminate(&name, &mut running.child, self.supervisor.config.grace_period).await;
                        let _ = self.state.send(DroneState::Deactivated);
                        return;
                    }
                },
            }
        }
    }

    /// Relaunch within the restart budget, serving commands between and
    /// during attempts. `None` once the monitor is finished.
    async fn relaunch_after_crash(&mut self, crashed_pid: u32) -> Option<Running> {
        let name = self.app.name.clone();
        let delay = self.supervisor.config.restart_delay;

        loop {
            if let Some(max) = self.supervisor.config.max_restart {
                if self.restarts >= max {
                    warn!(app = %name, restarts = self.restarts, max_restart = max, "Restart budget exhausted");
                    let _ = self.state.send(DroneState::Dead);
                    self.supervisor.events.emit(DroneEvent::Died { app: name.clone(), pid: crashed_pid });
                    let _ = self.supervisor.reports.send(MonitorReport::Died { app: name, pid: crashed_pid });
                    return None;
                }
            }
            self.restarts += 1;
            let attempt = self.restarts;
            let _ = self.state.send(DroneState::Spawning);
            info!(app = %name, attempt, "Restarting crashed drone");

            let outcome = {
                let Monitor {
                    supervisor,
                    app,
                    dir,
                    bridge,
                    commands,
                    ..
                } = &mut *self;
                let (supervisor, app, dir) = (&*supervisor, &*app, dir.as_path());
                // Dropping this future kills a half-launched child
                let launch = async move {
                    tokio::time::sleep(delay).await;
                    supervisor.launch(app, dir, bridge).await
                };
                tokio::pin!(launch);

                tokio::select! {
                    result = &mut launch => Relaunch::Launched(result),
                    command = commands.recv() => Relaunch::Interrupted(command),
                }
            };

            let command = match outcome {
                Relaunch::Launched(Ok(running)) => {
                    self.report_restart(crashed_pid, &running.drone, true);
                    return Some(running);
                }
                Relaunch::Launched(Err(e)) => {
                    warn!(app = %name, attempt, error = %e, "Relaunch failed");
                    continue;
                }
                Relaunch::Interrupted(command) => command,
            };

            match command {
                Some(MonitorCommand::Stop(reply)) => {
                    info!(app = %name, pid = crashed_pid, "Drone stopped while relaunching");
                    let _ = self.state.send(DroneState::Deactivated);
                    self.supervisor.events.emit(DroneEvent::Stopped { app: name, pid: crashed_pid });
                    let _ = reply.send(());
                    return None;
                }
                Some(MonitorCommand::Restart(reply)) => {
                    // Requested restarts are not charged to the budget
                    self.restarts -= 1;
                    match self.supervisor.launch(&self.app, &self.dir, &mut self.bridge).await {
                        Ok(running) => {
                            self.report_restart(crashed_pid, &running.drone, false);
                            let _ = reply.send(Ok(running.drone.clone()));
                            return Some(running);
                        }
                        Err(e) => {
                            warn!(app = %name, pid = crashed_pid, error = %e, "Manual restart failed");
                            let _ = self.state.send(DroneState::Dead);
                            self.supervisor.events.emit(DroneEvent::Died { app: name, pid: crashed_pid });
                            let _ = reply.send(Err(e));
                            return None;
                        }
                    }
                }
                None => {
                    debug!(app = %name, pid = crashed_pid, "Drone handle dropped while relaunching");
                    let _ = self.state.send(DroneState::Deactivated);
                    return None;
                }
            }
        }
    }

    fn report_restart(&self, old_pid: u32, drone: &DroneInfo, automatic: bool) {
        let _ = self.state.send(DroneState::Alive);
        self.supervisor.events.emit(DroneEvent::Restarted {
            app: self.app.name.clone(),
            old_pid,
            drone: drone.clone(),
        });
        // Manual restarts are answered directly to the caller
        if automatic {
            let _ = self.supervisor.reports.send(MonitorReport::Restarted {
                app: self.app.name.clone(),
                old_pid,
                drone: drone.clone(),
            });
        }
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out
async fn terminate(app: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(app, pid, "Sending SIGTERM to drone");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => debug!(app, status = %describe_status(Ok(status)), "Drone exited"),
        Ok(Err(e)) => warn!(app, error = %e, "Error waiting for drone to exit"),
        Err(_) => {
            warn!(
                app,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Log each line of a child stream, optionally capturing it into `capture`
/// while that buffer is still open
fn forward_output<R>(
    stream: R,
    app: String,
    pid: u32,
    capture: Option<Arc<Mutex<Option<Vec<String>>>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match capture {
                Some(ref buf) => {
                    warn!(app = %app, pid, "stderr: {}", line);
                    if let Some(ref mut lines) = *buf.lock() {
                        if lines.len() == MAX_STDERR_LINES {
                            lines.remove(0);
                        }
                        lines.push(line);
                    }
                }
                None => debug!(app = %app, pid, "stdout: {}", line),
            }
        }
    })
}

async fn drain_stderr(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
    }
}

fn take_stderr(buf: &Mutex<Option<Vec<String>>>) -> Vec<String> {
    buf.lock().take().unwrap_or_default()
}

fn describe_status(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                return format!("code {}", code);
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("signal {}", signal);
                }
            }
            status.to_string()
        }
        Err(e) => format!("unknown status ({})", e),
    }
}

fn absolute(dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        return dir.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(config: SupervisorConfig) -> (DroneSupervisor, mpsc::UnboundedReceiver<MonitorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DroneSupervisor::new(config, EventBus::new(), tx), rx)
    }

    fn app(start: &str) -> ApplicationDescriptor {
        ApplicationDescriptor {
            name: "test".to_string(),
            user: "marak".to_string(),
            scripts: crate::descriptor::Scripts {
                start: start.to_string(),
                install: None,
            },
            ..Default::default()
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            min_uptime: Duration::from_millis(500),
            readiness_timeout: Duration::from_millis(1500),
            ..Default::default()
        }
    }

    #[test]
    fn test_js_entry_point_runs_under_node() {
        let (sup, _rx) = supervisor(SupervisorConfig {
            node_binary: "/opt/node/bin/node".to_string(),
            ..Default::default()
        });
        let cmd = sup
            .build_command(&app("server.js --port 80"), Path::new("/srv/app"), "127.0.0.1:1".into())
            .unwrap();
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "/opt/node/bin/node");
        let args: Vec<_> = std.get_args().collect();
        assert_eq!(args, vec!["server.js", "--port", "80"]);
        assert_eq!(std.get_current_dir(), Some(Path::new("/srv/app")));
    }

    #[test]
    fn test_command_environment() {
        let (sup, _rx) = supervisor(SupervisorConfig::default());
        let mut desc = app("./bin/server");
        desc.env.insert("NODE_ENV".to_string(), "production".to_string());

        let cmd = sup
            .build_command(&desc, Path::new("/srv/app"), "127.0.0.1:4567".into())
            .unwrap();
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "/srv/app/./bin/server");

        let envs: std::collections::HashMap<_, _> = std
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert_eq!(envs["NODE_ENV"], "production");
        assert_eq!(envs[BRIDGE_ADDR_ENV], "127.0.0.1:4567");
        assert_eq!(envs["DRONE_APP"], "test");
        assert_eq!(envs["DRONE_USER"], "marak");
    }

    #[test]
    fn test_unparseable_start_script() {
        let (sup, _rx) = supervisor(SupervisorConfig::default());
        let err = sup
            .build_command(&app("node 'unterminated"), Path::new("/tmp"), String::new())
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_exit_before_min_uptime_is_too_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _rx) = supervisor(fast_config());

        let err = sup
            .spawn(&app("sh -c 'echo boom >&2; exit 1'"), dir.path())
            .await
            .unwrap_err();
        match err {
            DroneError::TooFastExit { app, stderr } => {
                assert_eq!(app, "test");
                assert_eq!(stderr, vec!["boom".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exit_after_min_uptime_is_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _rx) = supervisor(SupervisorConfig {
            min_uptime: Duration::from_millis(50),
            readiness_timeout: Duration::from_secs(5),
            ..Default::default()
        });

        let err = sup
            .spawn(&app("sh -c 'sleep 0.3; echo oops >&2; exit 3'"), dir.path())
            .await
            .unwrap_err();
        match err {
            DroneError::Crashed { status, stderr, .. } => {
                assert_eq!(status, "code 3");
                assert_eq!(stderr, vec!["oops".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_mapping_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _rx) = supervisor(SupervisorConfig {
            min_uptime: Duration::from_millis(10),
            readiness_timeout: Duration::from_millis(300),
            ..Default::default()
        });

        let started = Instant::now();
        let err = sup.spawn(&app("sleep 30"), dir.path()).await.unwrap_err();
        assert!(matches!(err, DroneError::ReadinessTimeout { timeout_ms: 300, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _rx) = supervisor(fast_config());
        let err = sup
            .spawn(&app("definitely-not-a-real-program-xyz"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_describe_status() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(describe_status(Ok(ExitStatus::from_raw(3 << 8))), "code 3");
        assert_eq!(describe_status(Ok(ExitStatus::from_raw(9))), "signal 9");
    }
}
