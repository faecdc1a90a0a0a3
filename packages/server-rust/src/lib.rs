//! `PulseHA` Server: active/passive cluster daemon with mTLS peer RPC,
//! heart-beat fail-over, and floating IP groups.

pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod plugins;
pub mod security;
pub mod service;

pub use error::{DaemonError, DaemonResult};
pub use service::Daemon;
