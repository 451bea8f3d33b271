//! Connectors for external services
//!
//! API clients for third-party systems that receive data exported from
//! Salesforce (the SASSIE survey platform).

pub mod sassie;

pub use sassie::{SassieClient, SassieConfig, UploadReceipt};
