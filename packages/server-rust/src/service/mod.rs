//! The daemon: one value that owns the configuration, the cryptographic
//! identity, the member list and the plugin host.
//!
//! Administrative verbs live in [`control`] and [`groups`]; inter-node RPCs
//! are dispatched in [`peer`]. Both planes serialise their handler bodies on
//! their own lock, and neither holds it while calling into the other.

pub mod control;
pub mod groups;
pub mod peer;
pub mod system;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use pulseha_core::{ClockSource, MemberStatus, SystemClock};
use tracing::{info, warn};

pub use peer::PeerService;
pub use system::{FixedSystem, HostSystem, SystemInfo};

use crate::cluster::{Cluster, IpDirection};
use crate::config::{ConfigPersistence, ConfigStore, DaemonSettings, JsonFilePersistence};
use crate::error::{DaemonError, DaemonResult};
use crate::network::{PeerServer, PeerServerHandle, PeerTransportConfig, ShutdownController};
use crate::plugins::{PluginContext, PluginHost};
use crate::security::{CertStore, DiskCertStore, Identity, TlsContext};

/// Capabilities a daemon is assembled from.
pub struct DaemonParts {
    pub settings: DaemonSettings,
    pub persistence: Arc<dyn ConfigPersistence>,
    pub certs: Arc<dyn CertStore>,
    pub system: Arc<dyn SystemInfo>,
    pub plugins: Arc<PluginHost>,
    pub clock: Arc<dyn ClockSource>,
}

pub struct Daemon {
    settings: DaemonSettings,
    config: Arc<ConfigStore>,
    identity: Identity,
    tls: Arc<TlsContext>,
    plugins: Arc<PluginHost>,
    cluster: Arc<Cluster>,
    transport: PeerTransportConfig,
    peer_server: Mutex<Option<PeerServerHandle>>,
    shutdown: Arc<ShutdownController>,
    control_lock: tokio::sync::Mutex<()>,
    peer_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("hostname", &self.config.local_hostname())
            .field("phase", &self.shutdown.phase())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Loads and validates the configuration and wires the components
    /// together. Nothing is bound or spawned yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the hostname cannot be read or the configuration
    /// does not validate for it.
    pub fn new(parts: DaemonParts) -> DaemonResult<Arc<Self>> {
        let hostname = parts.system.hostname()?;
        let config = Arc::new(ConfigStore::open(parts.persistence, hostname)?);
        let tls = Arc::new(TlsContext::new());
        let transport = PeerTransportConfig {
            rpc_deadline: parts.settings.rpc_deadline,
            ..PeerTransportConfig::default()
        };
        let cluster = Cluster::new(
            Arc::clone(&config),
            Arc::clone(&parts.plugins),
            Arc::clone(&tls),
            parts.clock,
            transport,
        );
        Ok(Arc::new(Self {
            settings: parts.settings,
            config,
            identity: Identity::new(parts.certs),
            tls,
            plugins: parts.plugins,
            cluster,
            transport,
            peer_server: Mutex::new(None),
            shutdown: Arc::new(ShutdownController::new()),
            control_lock: tokio::sync::Mutex::new(()),
            peer_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Production wiring: JSON config file, certificate directory and the
    /// host's hostname. Plugins are loaded separately by
    /// [`load_plugins`](Self::load_plugins) once logging is installed.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn from_settings(settings: DaemonSettings) -> DaemonResult<Arc<Self>> {
        Self::new(DaemonParts {
            persistence: Arc::new(JsonFilePersistence::new(&settings.config_path)),
            certs: Arc::new(DiskCertStore::new(&settings.cert_dir)),
            system: Arc::new(HostSystem),
            plugins: Arc::new(PluginHost::new()),
            clock: Arc::new(SystemClock),
            settings,
        })
    }

    /// Loads the descriptors in the plugin directory. Must run before
    /// [`start`](Self::start) so the networking back-end is in place.
    pub fn load_plugins(&self) -> usize {
        let dir = &self.settings.plugin_dir;
        let loaded = self.plugins.load_dir(dir);
        info!(loaded, dir = %dir.display(), "plugins loaded");
        loaded
    }

    #[must_use]
    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginHost> {
        &self.plugins
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn hostname(&self) -> String {
        self.config.local_hostname()
    }

    /// Address the peer listener is bound to, if it is running.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_server
            .lock()
            .as_ref()
            .and_then(PeerServerHandle::local_addr)
    }

    fn require_cluster(&self) -> DaemonResult<()> {
        if self.config.cluster_check() {
            Ok(())
        } else {
            Err(DaemonError::NotInCluster)
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Rejoins the configured cluster, if any, and starts general plugins.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificates cannot be loaded or the peer
    /// listener cannot bind; both are fatal at boot.
    pub async fn start(self: &Arc<Self>) -> DaemonResult<()> {
        if self.config.cluster_check() {
            self.identity.load_into(&self.tls)?;
            let (_, node) = self.config.local_node().ok_or(DaemonError::NotInCluster)?;
            let addr = node.socket_addr().ok_or_else(|| {
                DaemonError::ConfigInvalid(format!(
                    "local node endpoint {}:{} is not an address",
                    node.bind_address, node.bind_port
                ))
            })?;
            self.bind_peer_server(addr).await?;
            self.cluster.setup().await?;
        } else {
            info!("not in a cluster; waiting for create or join");
        }
        self.plugins.start_general(&PluginContext {
            hostname: self.hostname(),
            config: self.config.get(),
        });
        self.shutdown.set_running();
        Ok(())
    }

    /// Stops every loop and the peer listener. An active node releases its
    /// floating IPs so a passive member can take them over.
    pub async fn stop(&self) {
        self.shutdown.trigger_shutdown();
        if self
            .cluster
            .members()
            .local()
            .is_some_and(|m| m.status() == MemberStatus::Active)
        {
            self.cluster.move_local_ips(IpDirection::Down).await;
        }
        self.cluster.reset().await;
        self.stop_peer_server();
        info!("daemon stopped");
    }

    async fn bind_peer_server(self: &Arc<Self>, addr: SocketAddr) -> DaemonResult<SocketAddr> {
        self.stop_peer_server();
        let handler = Arc::new(PeerService::new(self));
        let server = PeerServer::bind(addr, Arc::clone(&self.tls), handler, self.transport).await?;
        let bound = server.local_addr()?;
        *self.peer_server.lock() = Some(server.spawn());
        Ok(bound)
    }

    fn stop_peer_server(&self) {
        if let Some(handle) = self.peer_server.lock().take() {
            handle.stop();
        }
    }

    /// Forgets the cluster: loops, members, listener, configuration and
    /// certificates.
    async fn teardown(&self) {
        self.cluster.reset().await;
        self.stop_peer_server();
        self.config.reset_cluster();
        self.tls.clear();
        if let Err(e) = self.identity.clear() {
            warn!(error = %e, "failed to remove certificates");
        }
    }
}
