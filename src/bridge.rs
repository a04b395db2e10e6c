//! Control channel between drones, their host and remote balancers.
//!
//! Messages are JSON objects tagged by `type`, one per line, over TCP (or a
//! Unix socket when the target is a filesystem path).
//!
//! * [`BridgeServer`]: one per drone, owned by the supervisor. The child
//!   finds it through `DRONE_BRIDGE_ADDR` and reports port mappings to it.
//! * [`BridgeClient`]: the child's end, used by the port broker.
//! * [`BalancerBridge`]: accepts `app`/`drone` messages from other hosts
//!   and applies them to the local balancer.
//! * [`RemotePublisher`]: forwards this host's drones to a remote
//!   balancer bridge.

use crate::balancer::{Endpoint, LoadBalancer};
use crate::descriptor::{ApplicationDescriptor, DroneInfo, PortMapping};
use crate::events::{DroneEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the drone's bridge address
pub const BRIDGE_ADDR_ENV: &str = "DRONE_BRIDGE_ADDR";

/// Interval between publisher heartbeats (also its reconnect cadence)
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DroneAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeMessage {
    Heartbeat,
    Proxy {
        desired: u16,
        actual: u16,
    },
    Proxies {
        mappings: Vec<PortMapping>,
    },
    App {
        app: ApplicationDescriptor,
    },
    Drone {
        app: String,
        drone: DroneInfo,
        action: DroneAction,
    },
    /// Ask the peer to connect to `target` and report there from now on
    Listen {
        target: String,
    },
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub struct MessageReader {
    lines: Lines<BufReader<BoxedRead>>,
}

impl MessageReader {
    fn new(inner: BoxedRead) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next message, or `None` at end of stream. Malformed lines are
    /// logged and skipped.
    pub async fn recv(&mut self) -> io::Result<Option<BridgeMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!(error = %e, "Ignoring malformed bridge message"),
            }
        }
        Ok(None)
    }
}

pub struct MessageWriter {
    inner: BoxedWrite,
}

impl MessageWriter {
    fn new(inner: BoxedWrite) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, message: &BridgeMessage) -> io::Result<()> {
        let mut line = serde_json::to_vec(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }
}

pub fn split_tcp(stream: TcpStream) -> (MessageReader, MessageWriter) {
    let (read, write) = stream.into_split();
    (
        MessageReader::new(Box::new(read)),
        MessageWriter::new(Box::new(write)),
    )
}

/// Connect to `host:port`, or to a Unix socket when `target` is a path
pub async fn connect(target: &str) -> io::Result<(MessageReader, MessageWriter)> {
    #[cfg(unix)]
    if target.contains('/') {
        let stream = tokio::net::UnixStream::connect(target).await?;
        let (read, write) = stream.into_split();
        return Ok((
            MessageReader::new(Box::new(read)),
            MessageWriter::new(Box::new(write)),
        ));
    }

    let stream = TcpStream::connect(target).await?;
    stream.set_nodelay(true)?;
    Ok(split_tcp(stream))
}

/// Per-drone listener on the loopback interface.
///
/// Every child generation of a drone connects to the same server; the
/// supervisor reads their mappings through [`BridgeServer::next_mapping`].
pub struct BridgeServer {
    addr: SocketAddr,
    mappings: mpsc::UnboundedReceiver<PortMapping>,
    accept_task: JoinHandle<()>,
}

impl BridgeServer {
    pub async fn bind(app: &str) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let app = app.to_string();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(app, peer = %peer, "Drone connected to bridge");
                        let tx = tx.clone();
                        let app = app.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_drone(stream, tx).await {
                                debug!(app, error = %e, "Drone bridge connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(app, error = %e, "Bridge accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            mappings: rx,
            accept_task,
        })
    }

    /// Value for [`BRIDGE_ADDR_ENV`]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn next_mapping(&mut self) -> Option<PortMapping> {
        self.mappings.recv().await
    }

    /// A mapping that has already arrived, without waiting
    pub fn try_next_mapping(&mut self) -> Option<PortMapping> {
        self.mappings.try_recv().ok()
    }

    /// Discard mappings left over from an earlier child
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.mappings.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_drone(stream: TcpStream, mappings: mpsc::UnboundedSender<PortMapping>) -> io::Result<()> {
    let (mut reader, mut writer) = split_tcp(stream);
    while let Some(message) = reader.recv().await? {
        match message {
            BridgeMessage::Heartbeat => writer.send(&BridgeMessage::Heartbeat).await?,
            BridgeMessage::Proxy { desired, actual } => {
                if mappings.send(PortMapping { desired, actual }).is_err() {
                    break;
                }
            }
            BridgeMessage::Proxies { mappings: list } => {
                for mapping in list {
                    if mappings.send(mapping).is_err() {
                        return Ok(());
                    }
                }
            }
            other => debug!(message = ?other, "Ignoring bridge message from drone"),
        }
    }
    Ok(())
}

enum ClientCommand {
    Publish(PortMapping, oneshot::Sender<io::Result<()>>),
}

/// Child side of the drone bridge
pub struct BridgeClient {
    commands: mpsc::Sender<ClientCommand>,
    task: JoinHandle<()>,
}

impl BridgeClient {
    pub async fn connect(target: &str) -> io::Result<Self> {
        let (reader, writer) = connect(target).await?;
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(run_client(reader, writer, rx));
        Ok(Self { commands: tx, task })
    }

    /// Send one mapping; resolves once it has been written
    pub async fn publish(&self, mapping: PortMapping) -> io::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Publish(mapping, reply_tx))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge client stopped"))?;
        reply_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge client stopped"))?
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_client(
    mut reader: MessageReader,
    mut writer: MessageWriter,
    mut commands: mpsc::Receiver<ClientCommand>,
) {
    let mut sent: Vec<PortMapping> = Vec::new();
    let mut connected = true;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ClientCommand::Publish(mapping, reply)) => {
                    sent.push(mapping);
                    let result = if connected {
                        writer
                            .send(&BridgeMessage::Proxy {
                                desired: mapping.desired,
                                actual: mapping.actual,
                            })
                            .await
                    } else {
                        Err(io::Error::new(io::ErrorKind::NotConnected, "bridge connection closed"))
                    };
                    let _ = reply.send(result);
                }
                None => break,
            },
            message = reader.recv(), if connected => match message {
                Ok(Some(BridgeMessage::Heartbeat)) => {
                    if let Err(e) = writer.send(&BridgeMessage::Heartbeat).await {
                        debug!(error = %e, "Failed to answer bridge heartbeat");
                    }
                }
                Ok(Some(BridgeMessage::Listen { target })) => match connect(&target).await {
                    Ok((new_reader, mut new_writer)) => {
                        let replay = BridgeMessage::Proxies { mappings: sent.clone() };
                        match new_writer.send(&replay).await {
                            Ok(()) => {
                                info!(target = %target, mappings = sent.len(), "Bridge switched to new coordinator");
                                reader = new_reader;
                                writer = new_writer;
                            }
                            Err(e) => warn!(target = %target, error = %e, "Failed to replay mappings"),
                        }
                    }
                    Err(e) => warn!(target = %target, error = %e, "Failed to connect to new coordinator"),
                },
                Ok(Some(other)) => debug!(message = ?other, "Ignoring bridge message"),
                Ok(None) | Err(_) => {
                    debug!("Bridge connection closed");
                    connected = false;
                }
            },
        }
    }
}

/// Applies `app`/`drone` messages from other hosts to the local balancer
pub struct BalancerBridge {
    balancer: Arc<LoadBalancer>,
}

impl BalancerBridge {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self { balancer }
    }

    /// Apply one message, returning the reply to send, if any
    pub fn apply(&self, message: BridgeMessage) -> Option<BridgeMessage> {
        match message {
            BridgeMessage::Heartbeat => return Some(BridgeMessage::Heartbeat),
            BridgeMessage::App { app } => {
                info!(app = %app.name, "Remote application registered");
                self.balancer.set_app(app);
            }
            BridgeMessage::Drone {
                app,
                drone,
                action: DroneAction::Add,
            } => {
                info!(app, pid = drone.pid, host = %drone.host, port = drone.port, "Remote drone added");
                self.balancer.add_drone(&app, Endpoint::from(&drone));
            }
            BridgeMessage::Drone {
                app,
                drone,
                action: DroneAction::Remove,
            } => {
                info!(app, pid = drone.pid, host = %drone.host, "Remote drone removed");
                self.balancer.remove_endpoint(&app, drone.pid, &drone.host);
            }
            other => debug!(message = ?other, "Ignoring message on balancer bridge"),
        }
        None
    }

    pub async fn run(self, bind_addr: SocketAddr, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve(listener, shutdown_rx).await
    }

    pub async fn serve(self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Balancer bridge listening");
        let bridge = Arc::new(self);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let bridge = Arc::clone(&bridge);
                        tokio::spawn(async move {
                            debug!(peer = %peer, "Remote host connected to balancer bridge");
                            if let Err(e) = bridge.serve_peer(stream).await {
                                debug!(peer = %peer, error = %e, "Balancer bridge connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept bridge connection"),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Balancer bridge shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn serve_peer(&self, stream: TcpStream) -> io::Result<()> {
        let (mut reader, mut writer) = split_tcp(stream);
        while let Some(message) = reader.recv().await? {
            if let Some(reply) = self.apply(message) {
                writer.send(&reply).await?;
            }
        }
        Ok(())
    }
}

/// Mirrors this host's drones to a remote balancer bridge.
///
/// The publisher remembers what it has published, so after a reconnect the
/// remote side gets the full current state again.
pub struct RemotePublisher {
    target: String,
    events: EventBus,
    apps: HashMap<String, ApplicationDescriptor>,
    drones: HashMap<u32, (String, DroneInfo)>,
    writer: Option<MessageWriter>,
}

impl RemotePublisher {
    pub fn new(target: impl Into<String>, events: EventBus) -> Self {
        Self {
            target: target.into(),
            events,
            apps: HashMap::new(),
            drones: HashMap::new(),
            writer: None,
        }
    }

    pub fn spawn(mut self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let messages = self.translate(event);
                            if !messages.is_empty() {
                                self.publish(messages).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Remote publisher lagged; resending state");
                            self.writer = None;
                            self.publish(Vec::new()).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = heartbeat.tick() => self.publish(vec![BridgeMessage::Heartbeat]).await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target = %self.target, "Remote publisher stopped");
        })
    }

    /// Update local state from an event and return the messages it implies
    fn translate(&mut self, event: DroneEvent) -> Vec<BridgeMessage> {
        match event {
            DroneEvent::Started { app, drone } => {
                let name = app.name.clone();
                self.apps.insert(name.clone(), app.clone());
                self.drones.insert(drone.pid, (name.clone(), drone.clone()));
                vec![
                    BridgeMessage::App { app },
                    BridgeMessage::Drone {
                        app: name,
                        drone,
                        action: DroneAction::Add,
                    },
                ]
            }
            DroneEvent::Restarted { app, old_pid, drone } => {
                let mut messages = Vec::new();
                if let Some((_, old)) = self.drones.remove(&old_pid) {
                    messages.push(BridgeMessage::Drone {
                        app: app.clone(),
                        drone: old,
                        action: DroneAction::Remove,
                    });
                }
                self.drones.insert(drone.pid, (app.clone(), drone.clone()));
                messages.push(BridgeMessage::Drone {
                    app,
                    drone,
                    action: DroneAction::Add,
                });
                messages
            }
            DroneEvent::Stopped { app, pid } | DroneEvent::Died { app, pid } => {
                match self.drones.remove(&pid) {
                    Some((_, drone)) => vec![BridgeMessage::Drone {
                        app,
                        drone,
                        action: DroneAction::Remove,
                    }],
                    None => Vec::new(),
                }
            }
            DroneEvent::AppRemoved { app } => {
                self.apps.remove(&app);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    async fn publish(&mut self, messages: Vec<BridgeMessage>) {
        if self.writer.is_none() {
            match self.reconnect().await {
                Ok(()) => {}
                Err(e) => {
                    debug!(target = %self.target, error = %e, "Remote balancer unreachable");
                    return;
                }
            }
        }

        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        for message in &messages {
            if let Err(e) = writer.send(message).await {
                warn!(target = %self.target, error = %e, "Lost connection to remote balancer");
                self.writer = None;
                return;
            }
        }
    }

    async fn reconnect(&mut self) -> io::Result<()> {
        let (mut reader, mut writer) = connect(&self.target).await?;
        // Replies are heartbeats only; drain them so the peer never blocks
        tokio::spawn(async move { while let Ok(Some(_)) = reader.recv().await {} });

        for app in self.apps.values() {
            writer.send(&BridgeMessage::App { app: app.clone() }).await?;
        }
        for (app, drone) in self.drones.values() {
            writer
                .send(&BridgeMessage::Drone {
                    app: app.clone(),
                    drone: drone.clone(),
                    action: DroneAction::Add,
                })
                .await?;
        }
        info!(target = %self.target, drones = self.drones.len(), "Connected to remote balancer");
        self.writer = Some(writer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use chrono::Utc;

    fn drone(pid: u32, port: u16) -> DroneInfo {
        DroneInfo {
            name: "test".to_string(),
            user: "marak".to_string(),
            pid,
            host: "10.0.0.7".to_string(),
            port,
            ctime: Utc::now(),
            version: None,
            hash: None,
            port_mappings: Vec::new(),
        }
    }

    fn descriptor() -> ApplicationDescriptor {
        ApplicationDescriptor {
            name: "test".to_string(),
            user: "marak".to_string(),
            domain: Some("example.com".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_value(BridgeMessage::Proxy {
            desired: 80,
            actual: 41234,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "proxy", "desired": 80, "actual": 41234}));

        let json = serde_json::to_value(BridgeMessage::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat"}));

        let parsed: BridgeMessage =
            serde_json::from_str(r#"{"type":"listen","target":"/tmp/coord.sock"}"#).unwrap();
        assert_eq!(
            parsed,
            BridgeMessage::Listen {
                target: "/tmp/coord.sock".to_string()
            }
        );

        let parsed: BridgeMessage = serde_json::from_str(
            r#"{"type":"proxies","mappings":[{"desired":80,"actual":5000},{"desired":443,"actual":5001}]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            BridgeMessage::Proxies {
                mappings: vec![
                    PortMapping {
                        desired: 80,
                        actual: 5000
                    },
                    PortMapping {
                        desired: 443,
                        actual: 5001
                    },
                ]
            }
        );
    }

    #[tokio::test]
    async fn test_client_reports_mappings_to_server() {
        let mut server = BridgeServer::bind("test").await.unwrap();
        let client = BridgeClient::connect(&server.addr().to_string()).await.unwrap();

        let mapping = PortMapping {
            desired: 8080,
            actual: 40000,
        };
        client.publish(mapping).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), server.next_mapping())
            .await
            .unwrap();
        assert_eq!(received, Some(mapping));
    }

    #[tokio::test]
    async fn test_server_answers_heartbeat() {
        let server = BridgeServer::bind("test").await.unwrap();
        let (mut reader, mut writer) = connect(&server.addr().to_string()).await.unwrap();

        writer.send(&BridgeMessage::Heartbeat).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), reader.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Some(BridgeMessage::Heartbeat));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let mut server = BridgeServer::bind("test").await.unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"garbage\n{\"type\":\"proxy\",\"desired\":1,\"actual\":2}\n")
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), server.next_mapping())
            .await
            .unwrap();
        assert_eq!(
            received,
            Some(PortMapping {
                desired: 1,
                actual: 2
            })
        );
    }

    #[tokio::test]
    async fn test_listen_switches_coordinator_and_replays() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = BridgeClient::connect(&first.local_addr().unwrap().to_string())
            .await
            .unwrap();
        let (stream, _) = first.accept().await.unwrap();
        let (mut first_reader, mut first_writer) = split_tcp(stream);

        let mapping = PortMapping {
            desired: 3000,
            actual: 45000,
        };
        client.publish(mapping).await.unwrap();
        assert_eq!(
            first_reader.recv().await.unwrap(),
            Some(BridgeMessage::Proxy {
                desired: 3000,
                actual: 45000
            })
        );

        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        first_writer
            .send(&BridgeMessage::Listen {
                target: second.local_addr().unwrap().to_string(),
            })
            .await
            .unwrap();

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), second.accept())
            .await
            .unwrap()
            .unwrap();
        let (mut second_reader, _second_writer) = split_tcp(stream);
        assert_eq!(
            second_reader.recv().await.unwrap(),
            Some(BridgeMessage::Proxies {
                mappings: vec![mapping]
            })
        );
    }

    #[test]
    fn test_balancer_bridge_applies_messages() {
        let balancer = LoadBalancer::new(PoolConfig::default(), Duration::from_secs(5));
        let bridge = BalancerBridge::new(Arc::clone(&balancer));

        assert_eq!(
            bridge.apply(BridgeMessage::Heartbeat),
            Some(BridgeMessage::Heartbeat)
        );
        assert_eq!(bridge.apply(BridgeMessage::App { app: descriptor() }), None);
        bridge.apply(BridgeMessage::Drone {
            app: "test".to_string(),
            drone: drone(5, 4005),
            action: DroneAction::Add,
        });

        let instances = balancer.instances("test");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].host, "10.0.0.7");
        assert_eq!(instances[0].port, 4005);

        bridge.apply(BridgeMessage::Drone {
            app: "test".to_string(),
            drone: drone(5, 4005),
            action: DroneAction::Remove,
        });
        assert!(balancer.instances("test").is_empty());
    }

    #[test]
    fn test_publisher_translates_lifecycle() {
        let mut publisher = RemotePublisher::new("127.0.0.1:1", EventBus::new());

        let messages = publisher.translate(DroneEvent::Started {
            app: descriptor(),
            drone: drone(1, 4001),
        });
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], BridgeMessage::App { .. }));

        let messages = publisher.translate(DroneEvent::Restarted {
            app: "test".to_string(),
            old_pid: 1,
            drone: drone(2, 4002),
        });
        assert!(matches!(
            &messages[..],
            [
                BridgeMessage::Drone { action: DroneAction::Remove, drone: a, .. },
                BridgeMessage::Drone { action: DroneAction::Add, drone: b, .. },
            ] if a.pid == 1 && b.pid == 2
        ));

        let messages = publisher.translate(DroneEvent::Stopped {
            app: "test".to_string(),
            pid: 2,
        });
        assert_eq!(messages.len(), 1);
        assert!(publisher.drones.is_empty());

        // Unknown pid produces nothing
        assert!(publisher
            .translate(DroneEvent::Died {
                app: "test".to_string(),
                pid: 99
            })
            .is_empty());
    }

    #[tokio::test]
    async fn test_publisher_feeds_remote_balancer() {
        let balancer = LoadBalancer::new(PoolConfig::default(), Duration::from_secs(5));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(BalancerBridge::new(Arc::clone(&balancer)).serve(listener, shutdown_rx.clone()));

        let events = EventBus::new();
        let _publisher = RemotePublisher::new(addr.to_string(), events.clone()).spawn(shutdown_rx);
        events.emit(DroneEvent::Started {
            app: descriptor(),
            drone: drone(9, 4009),
        });

        let mut found = false;
        for _ in 0..100 {
            if balancer.instances("test").len() == 1 {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found, "remote drone registered");
        assert_eq!(
            balancer.descriptor("test").unwrap().domain.as_deref(),
            Some("example.com")
        );
    }
}
