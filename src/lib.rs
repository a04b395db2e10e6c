//! Dronegate - an application host for small network services
//!
//! This library provides the pieces of a single hosting node:
//! - Fetches application sources (git, tarball, zip, npm or a local directory)
//! - Launches each app as supervised "drones" and restarts them when they crash
//! - Lets drones bind their usual port while the host hands out real ones
//! - Keeps durable process records that other components watch
//! - Balances HTTP traffic across drones by virtual host, round-robin
//! - Exposes a REST API for start/stop/restart/clean/deploy

pub mod api;
pub mod balancer;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod descriptor;
pub mod drone;
pub mod error;
pub mod events;
pub mod pool;
pub mod repository;
pub mod store;
pub mod supervisor;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
