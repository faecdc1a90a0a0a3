//! Configuration: the validated runtime store, its persistence, and the
//! daemon's own process settings.

pub mod persist;
pub mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub use persist::{ConfigPersistence, JsonFilePersistence, MemoryPersistence};
pub use store::ConfigStore;

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pulseha/config.json";
/// Default certificate directory.
pub const DEFAULT_CERT_DIR: &str = "/etc/pulseha/certs";
/// Default plugin directory.
pub const DEFAULT_PLUGIN_DIR: &str = "/usr/local/lib/pulseha";

/// Process-level settings that are not part of the replicated document.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub config_path: PathBuf,
    pub cert_dir: PathBuf,
    pub plugin_dir: PathBuf,
    /// Loopback address of the control plane.
    pub control_addr: SocketAddr,
    /// Deadline for every outgoing peer RPC, connect included.
    pub rpc_deadline: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 49152)),
            rpc_deadline: Duration::from_secs(5),
        }
    }
}
