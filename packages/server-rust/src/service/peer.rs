//! Handlers for the inter-node RPC surface.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use pulseha_core::messages::{
    ConfigSyncPayload, JoinAccepted, JoinPayload, PeerReply, PeerRequest, ReplyBody,
};
use pulseha_core::{ClusterConfig, LogLevel, MemberStatus};
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use super::Daemon;
use crate::cluster::IpDirection;
use crate::error::{DaemonError, DaemonResult};
use crate::logging::emit_relayed;
use crate::network::PeerHandler;
use crate::security::verify_token;

/// Adapts a [`Daemon`] to the peer listener. Holds it weakly so a running
/// listener does not keep a stopped daemon alive.
#[derive(Debug)]
pub struct PeerService {
    daemon: Weak<Daemon>,
}

impl PeerService {
    #[must_use]
    pub fn new(daemon: &Arc<Daemon>) -> Self {
        Self {
            daemon: Arc::downgrade(daemon),
        }
    }
}

#[async_trait]
impl PeerHandler for PeerService {
    async fn handle(&self, request: PeerRequest, remote: SocketAddr) -> PeerReply {
        let Some(daemon) = self.daemon.upgrade() else {
            return DaemonError::Internal("daemon is stopping".to_string()).to_peer_reply();
        };
        let rpc = request.name();
        match daemon.dispatch_peer(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%remote, rpc, error = %e, "peer request failed");
                e.to_peer_reply()
            }
        }
    }
}

impl Daemon {
    /// Runs one peer request under the peer-plane lock.
    ///
    /// # Errors
    ///
    /// Returns the failure to report back in the reply envelope.
    pub async fn dispatch_peer(self: &Arc<Self>, request: PeerRequest) -> DaemonResult<PeerReply> {
        let guard = self.peer_lock.lock().await;
        match request {
            PeerRequest::HealthCheck(payload) => self.cluster.handle_health_check(payload).await,
            PeerRequest::Join(payload) => self.accept_join(payload, guard).await,
            PeerRequest::Leave(payload) => {
                info!(member = %payload.hostname, "member is leaving the cluster");
                self.forget_member(&payload.hostname).await
            }
            PeerRequest::Remove(payload) => self.accept_remove(&payload.hostname).await,
            PeerRequest::ConfigSync(payload) => self.accept_config(payload.config).await,
            PeerRequest::Promote(target) => {
                self.require_self(&target.member)?;
                self.cluster.accept_promotion().await?;
                Ok(PeerReply::ok())
            }
            PeerRequest::MakePassive(target) => {
                self.require_self(&target.member)?;
                self.cluster.make_local_passive().await?;
                Ok(PeerReply::ok())
            }
            PeerRequest::BringUpIp(batch) => {
                self.cluster
                    .apply_local_ips(IpDirection::Up, &batch.iface, &batch.ips)
                    .await?;
                Ok(PeerReply::ok())
            }
            PeerRequest::BringDownIp(batch) => {
                self.cluster
                    .apply_local_ips(IpDirection::Down, &batch.iface, &batch.ips)
                    .await?;
                Ok(PeerReply::ok())
            }
            PeerRequest::Logs(payload) => {
                emit_relayed(&payload);
                Ok(PeerReply::ok())
            }
        }
    }

    fn require_self(&self, member: &str) -> DaemonResult<()> {
        let hostname = self.hostname();
        if member == hostname {
            Ok(())
        } else {
            Err(DaemonError::Conflict(format!(
                "request addressed to {member} reached {hostname}"
            )))
        }
    }

    /// Admits a new member. The peer lock is released before the new
    /// configuration is broadcast, so an unreachable member cannot stall
    /// heart-beats for the length of the RPC deadline.
    async fn accept_join(
        self: &Arc<Self>,
        payload: JoinPayload,
        guard: MutexGuard<'_, ()>,
    ) -> DaemonResult<PeerReply> {
        self.require_cluster()?;
        if !verify_token(&payload.token, &self.config.settings().cluster_token) {
            warn!(hostname = %payload.hostname, ip = %payload.ip, "join rejected: invalid cluster token");
            return Err(DaemonError::InvalidToken);
        }
        if self.config.node_by_hostname(&payload.hostname).is_some() {
            return Err(DaemonError::Conflict(format!(
                "hostname {} is already a member",
                payload.hostname
            )));
        }
        let ca = self.identity.ca()?;

        let mut node = payload.node;
        node.hostname.clone_from(&payload.hostname);
        node.bind_address = payload.ip;
        node.bind_port = payload.port;
        self.config.add_node(&payload.uid, node)?;
        self.cluster.reconcile().await;

        let config = self.config.get();
        drop(guard);

        let sync = PeerRequest::ConfigSync(ConfigSyncPayload {
            config: config.clone(),
            replicated: false,
        });
        self.cluster.broadcast(&sync, &[&payload.hostname]).await;

        info!(member = %payload.hostname, "member joined the cluster");
        self.cluster
            .relay_log(LogLevel::Info, format!("{} joined the cluster", payload.hostname));
        Ok(PeerReply::with_body(ReplyBody::Join(JoinAccepted {
            config,
            ca_crt: ca.cert,
            ca_key: ca.key,
        })))
    }

    async fn accept_remove(self: &Arc<Self>, hostname: &str) -> DaemonResult<PeerReply> {
        if hostname != self.hostname() {
            info!(member = hostname, "member removed by an operator");
            return self.forget_member(hostname).await;
        }
        warn!("this node was removed from the cluster; shutting down");
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            daemon.teardown().await;
            daemon.shutdown.trigger_shutdown();
        });
        Ok(PeerReply::ok())
    }

    /// Drops `hostname` from the configuration and the member list. A node
    /// left on its own takes over.
    pub(super) async fn forget_member(self: &Arc<Self>, hostname: &str) -> DaemonResult<PeerReply> {
        self.require_cluster()?;
        match self.config.remove_node(hostname) {
            Ok(_) | Err(DaemonError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.cluster.reconcile().await;

        let alone = self.config.node_count() == 1;
        let local_active = self
            .cluster
            .members()
            .local()
            .is_some_and(|m| m.status() == MemberStatus::Active);
        if alone && !local_active {
            info!("last member standing; taking over");
            self.cluster.make_local_active().await?;
        }
        Ok(PeerReply::ok())
    }

    /// Adopts a replicated configuration, keeping the fields that are
    /// private to this node.
    async fn accept_config(self: &Arc<Self>, mut config: ClusterConfig) -> DaemonResult<PeerReply> {
        self.require_cluster()?;
        let local = self.config.settings();
        config.pulseha.cluster_token = local.cluster_token;
        config.pulseha.local_node = local.local_node;
        config.pulseha.logging_level = local.logging_level;
        self.config.replace(config)?;
        self.cluster.reconcile().await;
        debug!("configuration synchronised from peer");
        Ok(PeerReply::ok())
    }
}
