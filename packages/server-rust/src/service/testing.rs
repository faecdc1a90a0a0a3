//! Daemon fixtures built from in-memory capabilities.

use std::sync::Arc;
use std::time::Duration;

use pulseha_core::{ClusterConfig, ManualClock, Node};

use super::{Daemon, DaemonParts, FixedSystem};
use crate::config::{DaemonSettings, MemoryPersistence};
use crate::plugins::host::testing::RecordingNetworking;
use crate::plugins::PluginHost;
use crate::security::MemoryCertStore;

pub const START_MILLIS: u64 = 1_700_000_000_000;

pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub net: Arc<RecordingNetworking>,
    pub persistence: Arc<MemoryPersistence>,
    pub clock: Arc<ManualClock>,
}

impl TestDaemon {
    pub fn new(hostname: &str, config: Option<ClusterConfig>) -> Self {
        let persistence = Arc::new(MemoryPersistence::new(config));
        let plugins = Arc::new(PluginHost::new());
        let net = Arc::new(RecordingNetworking::default());
        assert!(plugins.register_networking(net.clone()));
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let daemon = Daemon::new(DaemonParts {
            settings: DaemonSettings {
                rpc_deadline: Duration::from_secs(2),
                ..DaemonSettings::default()
            },
            persistence: persistence.clone(),
            certs: Arc::new(MemoryCertStore::default()),
            system: Arc::new(FixedSystem::new(hostname)),
            plugins,
            clock: clock.clone(),
        })
        .unwrap();
        Self {
            daemon,
            net,
            persistence,
            clock,
        }
    }
}

/// Two nodes on unused loopback ports; `local` is the local node.
pub fn two_node_config(local: &str, other: &str) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.pulseha.local_node = format!("uid-{local}");
    config
        .nodes
        .insert(format!("uid-{local}"), Node::new(local, "127.0.0.1", 40_001));
    config
        .nodes
        .insert(format!("uid-{other}"), Node::new(other, "127.0.0.1", 40_002));
    config
}
