pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod origin;
pub mod server;
