// protectly-api: Async Rust client for the UniFi Protect NVR (REST session + realtime updates)

pub mod client;
pub mod error;
pub mod frames;
pub mod models;
pub mod realtime;
pub mod transport;

pub use client::ProtectClient;
pub use error::Error;
