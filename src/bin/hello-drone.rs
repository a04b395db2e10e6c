//! Minimal drone used by the integration tests and for smoke-testing a host
//!
//! Binds `PORT` (default 8080) through the port broker, so under dronegate
//! it reports its real port over `DRONE_BRIDGE_ADDR`.
//!
//! Environment variables:
//! - PORT: desired port (default: 8080)
//! - HELLO_DRONE_MODE: `crash` exits at once with an error on stderr,
//!   `no-bind` never binds a port
//! - HELLO_DRONE_EXIT_AFTER_MS: exit with status 3 this long after binding
//! - HELLO_DRONE_CRASH_ONCE: marker file; the first process that finds it
//!   missing creates it and exits after HELLO_DRONE_EXIT_AFTER_MS

use dronegate::broker::PortBroker;
use std::env;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const GREETING: &str = "hello, i know nodejitsu.";

#[tokio::main]
async fn main() {
    let mode = env::var("HELLO_DRONE_MODE").unwrap_or_default();
    match mode.as_str() {
        "crash" => {
            eprintln!("hello-drone: refusing to start");
            std::process::exit(1);
        }
        "no-bind" => {
            eprintln!("hello-drone: not binding any port");
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        _ => {}
    }

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let broker = match PortBroker::from_env().await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("hello-drone: bridge unavailable: {}", e);
            std::process::exit(1);
        }
    };
    let listener = match broker.bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("hello-drone: failed to bind port {}: {}", port, e);
            std::process::exit(1);
        }
    };
    let actual = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    println!("hello-drone: desired port {} bound on {}", port, actual);

    if let Some(delay) = exit_delay() {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            eprintln!("hello-drone: exiting on purpose");
            std::process::exit(3);
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream));
            }
            Err(e) => eprintln!("hello-drone: accept error: {}", e),
        }
    }
}

/// When this process should crash, if at all
fn exit_delay() -> Option<Duration> {
    let delay = env::var("HELLO_DRONE_EXIT_AFTER_MS")
        .ok()
        .and_then(|ms| ms.parse().ok())
        .map(Duration::from_millis)?;

    match env::var("HELLO_DRONE_CRASH_ONCE") {
        Ok(marker) => {
            let marker = Path::new(&marker);
            if marker.exists() {
                return None;
            }
            std::fs::write(marker, std::process::id().to_string()).ok()?;
            Some(delay)
        }
        Err(_) => Some(delay),
    }
}

async fn handle_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/");

    let body = match path {
        "/pid" => std::process::id().to_string(),
        "/health" => "ok".to_string(),
        _ => GREETING.to_string(),
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}
