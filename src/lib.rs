//! Library crate for netaudit-rs: port scanning, service identification,
//! security-header analysis and risk classification.
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod logging;
pub mod ports;
pub mod risk;
pub mod scanner;
pub mod server;
pub mod target;
pub mod tls;
pub mod types;
