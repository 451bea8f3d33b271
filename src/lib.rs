pub mod commands;
pub mod comms;
pub mod config;
pub mod connectors;
pub mod export;
pub mod security;
pub mod transport;
pub mod utils;
pub mod workflow;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
