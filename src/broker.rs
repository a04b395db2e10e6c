//! Bind indirection for supervised applications.
//!
//! An application that links this crate binds its listeners through
//! [`PortBroker::bind`] instead of [`TcpListener::bind`]. A bind to a
//! concrete port is substituted with an OS-assigned port, and the
//! `{desired, actual}` pair is recorded and reported upstream before the
//! listener is handed back.

use crate::bridge::{BridgeClient, BRIDGE_ADDR_ENV};
use crate::descriptor::PortMapping;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Destination for port mappings (normally the drone's bridge channel)
#[async_trait]
pub trait MappingSink: Send + Sync {
    async fn send(&self, mapping: PortMapping) -> io::Result<()>;
}

#[async_trait]
impl MappingSink for BridgeClient {
    async fn send(&self, mapping: PortMapping) -> io::Result<()> {
        self.publish(mapping).await
    }
}

#[derive(Default)]
pub struct PortBroker {
    mappings: Mutex<Vec<PortMapping>>,
    sink: Option<Arc<dyn MappingSink>>,
}

impl PortBroker {
    /// Broker that only records mappings locally
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn MappingSink>) -> Self {
        Self {
            mappings: Mutex::new(Vec::new()),
            sink: Some(sink),
        }
    }

    /// Connect to the bridge named by `DRONE_BRIDGE_ADDR`.
    ///
    /// Without the variable (the app runs outside a drone host) the broker
    /// still substitutes ports but reports nowhere.
    pub async fn from_env() -> io::Result<Self> {
        match std::env::var(BRIDGE_ADDR_ENV) {
            Ok(target) if !target.trim().is_empty() => {
                let client = BridgeClient::connect(target.trim()).await?;
                debug!(target = %target, "Port broker connected to bridge");
                Ok(Self::with_sink(Arc::new(client)))
            }
            _ => {
                debug!("{} not set, port mappings stay local", BRIDGE_ADDR_ENV);
                Ok(Self::new())
            }
        }
    }

    /// Bind a TCP listener, substituting an OS-chosen port for any
    /// explicit one.
    ///
    /// The mapping is in [`PortBroker::mappings`] and has been handed to
    /// the sink by the time this returns. A failed bind records nothing.
    pub async fn bind<A: ToSocketAddrs>(&self, addr: A) -> io::Result<TcpListener> {
        let requested = resolve(addr).await?;
        if requested.port() == 0 {
            return TcpListener::bind(requested).await;
        }

        let listener = TcpListener::bind(SocketAddr::new(requested.ip(), 0)).await?;
        let mapping = PortMapping {
            desired: requested.port(),
            actual: listener.local_addr()?.port(),
        };

        self.mappings.lock().push(mapping);
        info!(
            desired = mapping.desired,
            actual = mapping.actual,
            "Port mapped"
        );

        if let Some(ref sink) = self.sink {
            // The mapping stays in the table for a later replay
            if let Err(e) = sink.send(mapping).await {
                warn!(
                    desired = mapping.desired,
                    actual = mapping.actual,
                    error = %e,
                    "Failed to report port mapping"
                );
            }
        }

        Ok(listener)
    }

    /// Every mapping made so far, in bind order
    pub fn mappings(&self) -> Vec<PortMapping> {
        self.mappings.lock().clone()
    }
}

async fn resolve<A: ToSocketAddrs>(addr: A) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<PortMapping>>,
    }

    #[async_trait]
    impl MappingSink for RecordingSink {
        async fn send(&self, mapping: PortMapping) -> io::Result<()> {
            self.sent.lock().push(mapping);
            Ok(())
        }
    }

    struct SlowSink {
        delivered: AtomicBool,
    }

    #[async_trait]
    impl MappingSink for SlowSink {
        async fn send(&self, _mapping: PortMapping) -> io::Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.delivered.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl MappingSink for BrokenSink {
        async fn send(&self, _mapping: PortMapping) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "bridge gone"))
        }
    }

    #[tokio::test]
    async fn test_bind_substitutes_port_and_reports_mapping() {
        let sink = Arc::new(RecordingSink::default());
        let broker = PortBroker::with_sink(sink.clone());

        let listener = broker.bind("127.0.0.1:8080").await.unwrap();
        let actual = listener.local_addr().unwrap().port();

        let expected = PortMapping {
            desired: 8080,
            actual,
        };
        assert_eq!(broker.mappings(), vec![expected]);
        assert_eq!(*sink.sent.lock(), vec![expected]);
    }

    #[tokio::test]
    async fn test_each_bind_emits_one_mapping() {
        let sink = Arc::new(RecordingSink::default());
        let broker = PortBroker::with_sink(sink.clone());

        let _a = broker.bind("127.0.0.1:3000").await.unwrap();
        let _b = broker.bind("127.0.0.1:3000").await.unwrap();
        let _c = broker.bind("127.0.0.1:4000").await.unwrap();

        let mappings = broker.mappings();
        assert_eq!(mappings.len(), 3);
        assert_eq!(
            mappings.iter().map(|m| m.desired).collect::<Vec<_>>(),
            vec![3000, 3000, 4000]
        );
        assert_eq!(sink.sent.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_port_zero_passes_through() {
        let sink = Arc::new(RecordingSink::default());
        let broker = PortBroker::with_sink(sink.clone());

        let listener = broker.bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert!(broker.mappings().is_empty());
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bind_returns_after_mapping_delivered() {
        let sink = Arc::new(SlowSink {
            delivered: AtomicBool::new(false),
        });
        let broker = PortBroker::with_sink(sink.clone());

        let listener = broker.bind("127.0.0.1:9999").await.unwrap();
        assert!(sink.delivered.load(Ordering::SeqCst));

        let port = listener.local_addr().unwrap().port();
        assert!(broker.mappings().iter().any(|m| m.actual == port));
    }

    #[tokio::test]
    async fn test_failed_bind_records_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let broker = PortBroker::with_sink(sink.clone());

        // TEST-NET-1 is never assigned to a local interface
        let result = broker.bind("192.0.2.1:8080").await;
        assert!(result.is_err());
        assert!(broker.mappings().is_empty());
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_mapping() {
        let broker = PortBroker::with_sink(Arc::new(BrokenSink));
        let listener = broker.bind("127.0.0.1:7000").await.unwrap();

        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            broker.mappings(),
            vec![PortMapping {
                desired: 7000,
                actual: port
            }]
        );
    }
}
