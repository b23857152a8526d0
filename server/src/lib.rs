//! Mirror cluster node library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod error;
pub mod fault;
pub mod models;
pub mod routes;
pub mod state;
pub mod storage;
pub mod sync;

/// Sent with every outbound request.
pub const USER_AGENT: &str = concat!("mirror-node/", env!("CARGO_PKG_VERSION"));
