//! Tracker REST API: router and configuration, shared by the binary and integration tests.

pub mod config;
pub mod server;
