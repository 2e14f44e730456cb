pub mod args;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod icmp;
pub mod probe;
pub mod targets;
pub mod tcp;
pub mod udp;
pub mod worker;

// Re-export commonly used types
pub use args::Args;
pub use client::VoyagerClient;
pub use config::VoyagerConfig;
pub use error::ProbeError;
pub use icmp::{IcmpListener, ResponseMap};
pub use probe::{Probe, ProbeResponse, ProbeTarget, Protocol};
pub use targets::TargetManager;
pub use worker::WorkerContext;

// Re-export external dependencies commonly used across modules
pub use anyhow::Result;
