//! Keep-alive HTTP client the balancer uses to reach drones.
//!
//! Connections are pooled per drone address. The pool also keeps a small
//! traffic ledger per endpoint, dropped when the balancer forgets it.

use crate::balancer::Endpoint;
use dashmap::DashMap;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("drone unreachable: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    #[error("cannot rebuild request for drone: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle keep-alive connections kept per drone
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    failed: AtomicU64,
}

/// Requests sent to one drone endpoint so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DroneTraffic {
    pub forwarded: u64,
    pub failed: u64,
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    traffic: DashMap<(String, u16), Counters>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Drone connection pool ready"
        );

        Self {
            client,
            traffic: DashMap::new(),
        }
    }

    /// Send `req` to `endpoint` unchanged apart from scheme and authority
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        endpoint: &Endpoint,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = drone_uri(&endpoint.host, endpoint.port, &req);
        let (parts, body) = req.into_parts();

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let outbound = builder
            .body(body)
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        let counters = self
            .traffic
            .entry((endpoint.host.clone(), endpoint.port))
            .or_default();
        counters.forwarded.fetch_add(1, Ordering::Relaxed);
        drop(counters);

        match self.client.request(outbound).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(e) => {
                if let Some(counters) = self.traffic.get(&(endpoint.host.clone(), endpoint.port)) {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e.into())
            }
        }
    }

    pub fn traffic(&self, endpoint: &Endpoint) -> DroneTraffic {
        self.traffic
            .get(&(endpoint.host.clone(), endpoint.port))
            .map(|c| DroneTraffic {
                forwarded: c.forwarded.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Drop the ledger of an endpoint that left the routing table
    pub fn forget(&self, endpoint: &Endpoint) {
        self.traffic.remove(&(endpoint.host.clone(), endpoint.port));
    }
}

fn drone_uri<B>(host: &str, port: u16, req: &Request<B>) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    if host.contains(':') {
        format!("http://[{}]:{}{}", host, port, path)
    } else {
        format!("http://{}:{}{}", host, port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            pid: 42,
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn test_drone_uri_keeps_path_and_query() {
        let req = Request::builder()
            .uri("/hello?name=drone")
            .body(())
            .unwrap();
        assert_eq!(
            drone_uri("10.0.0.5", 4000, &req),
            "http://10.0.0.5:4000/hello?name=drone"
        );
        assert_eq!(drone_uri("::1", 4000, &req), "http://[::1]:4000/hello?name=drone");
    }

    #[tokio::test]
    async fn test_unknown_endpoint_has_no_traffic() {
        let pool = ConnectionPool::new(PoolConfig::default());
        assert_eq!(pool.traffic(&endpoint(4000)), DroneTraffic::default());
        pool.forget(&endpoint(4000));
    }
}
