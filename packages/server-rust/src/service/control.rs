//! Administrative verbs served on the loopback control plane.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use pulseha_core::messages::{
    ConfigSyncPayload, CreateRequest, JoinClusterRequest, JoinPayload, LeavePayload, PeerRequest,
    ReplyBody, StatusRow,
};
use pulseha_core::{LogLevel, MemberStatus, Node};
use tracing::{info, warn};
use uuid::Uuid;

use super::Daemon;
use crate::cluster::IpDirection;
use crate::error::{DaemonError, DaemonResult};
use crate::network::call_once;
use crate::security::{generate_token, hash_token, tls, PemPair};

fn parse_ip(value: &str) -> DaemonResult<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| DaemonError::ConfigInvalid(format!("invalid IP address {value:?}")))
}

impl Daemon {
    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Creates a one-node cluster and returns the cleartext join token.
    ///
    /// # Errors
    ///
    /// [`DaemonError::AlreadyInCluster`], an unusable bind address, or a
    /// certificate failure. Nothing is left configured on failure.
    pub async fn create(self: &Arc<Self>, request: CreateRequest) -> DaemonResult<String> {
        let _guard = self.control_lock.lock().await;
        if self.config.cluster_check() {
            return Err(DaemonError::AlreadyInCluster);
        }
        let ip = parse_ip(&request.bind_ip)?;
        let bound = self
            .bind_peer_server(SocketAddr::new(ip, request.bind_port))
            .await?;
        match self.establish(ip, bound.port()).await {
            Ok(token) => {
                info!(%bound, "cluster created");
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "cluster creation failed; rolling back");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>, ip: IpAddr, port: u16) -> DaemonResult<String> {
        self.identity.create_ca(ip)?;
        self.identity.issue_leaves(ip)?;
        self.identity.load_into(&self.tls)?;

        let uid = Uuid::new_v4().to_string();
        let token = generate_token();
        let node = Node::new(self.hostname(), ip.to_string(), port);
        self.config.mutate(|config| {
            config.pulseha.local_node.clone_from(&uid);
            config.pulseha.cluster_token = hash_token(&token);
            config.nodes.insert(uid.clone(), node);
            Ok(())
        })?;
        self.cluster.setup().await?;
        Ok(token)
    }

    /// Joins the cluster of the peer at `peer_ip:peer_port`.
    ///
    /// # Errors
    ///
    /// [`DaemonError::AlreadyInCluster`], [`DaemonError::InvalidToken`] or
    /// any other rejection from the peer. Nothing is left configured on
    /// failure.
    pub async fn join(self: &Arc<Self>, request: JoinClusterRequest) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        if self.config.cluster_check() {
            return Err(DaemonError::AlreadyInCluster);
        }
        let bind_ip = parse_ip(&request.bind_ip)?;
        let peer = SocketAddr::new(parse_ip(&request.peer_ip)?, request.peer_port);
        let bound = self
            .bind_peer_server(SocketAddr::new(bind_ip, request.bind_port))
            .await?;
        match self.join_via(peer, bind_ip, bound.port(), &request.token).await {
            Ok(()) => {
                info!(%peer, %bound, "joined cluster");
                Ok(())
            }
            Err(e) => {
                warn!(%peer, error = %e, "join failed; rolling back");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn join_via(
        self: &Arc<Self>,
        peer: SocketAddr,
        bind_ip: IpAddr,
        port: u16,
        token: &str,
    ) -> DaemonResult<()> {
        let hostname = self.hostname();
        let uid = Uuid::new_v4().to_string();
        let request = PeerRequest::Join(JoinPayload {
            uid: uid.clone(),
            hostname: hostname.clone(),
            ip: bind_ip.to_string(),
            port: port.to_string(),
            token: token.to_string(),
            node: Node::new(&hostname, bind_ip.to_string(), port),
        });
        let bootstrap = Arc::new(tls::bootstrap_client_config()?);
        let reply = call_once(peer, bootstrap, self.transport, &request).await?;
        let Some(ReplyBody::Join(accepted)) = reply.body else {
            return Err(DaemonError::Internal(
                "join reply carried no configuration".to_string(),
            ));
        };

        self.identity.install_ca(&PemPair {
            cert: accepted.ca_crt,
            key: accepted.ca_key,
        })?;
        self.identity.issue_leaves(bind_ip)?;
        self.identity.load_into(&self.tls)?;

        let mut config = accepted.config;
        config.pulseha.local_node = uid;
        config.pulseha.cluster_token = hash_token(token);
        config.pulseha.logging_level = self.config.settings().logging_level;
        self.config.replace(config)?;
        self.cluster.setup().await
    }

    /// Leaves the cluster. An active node first hands over to the next
    /// passive member and releases its floating IPs.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`].
    pub async fn leave(self: &Arc<Self>) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let hostname = self.hostname();
        let members = self.cluster.members();

        if members.local().is_some_and(|m| m.status() == MemberStatus::Active) {
            let handed_over = match members.next_passive_peer() {
                Some(next) => match self.cluster.promote_member(next.hostname()).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(member = next.hostname(), error = %e, "hand-over before leaving failed");
                        false
                    }
                },
                None => false,
            };
            if !handed_over {
                self.cluster.move_local_ips(IpDirection::Down).await;
            }
        }
        if let Some(local) = members.local() {
            local.set_status(MemberStatus::Leaving);
        }

        let request = PeerRequest::Leave(LeavePayload {
            hostname: hostname.clone(),
            replicated: false,
        });
        self.cluster.broadcast(&request, &[]).await;
        self.teardown().await;
        info!(%hostname, "left the cluster");
        Ok(())
    }

    /// Removes another node from the cluster; the removed node shuts down.
    ///
    /// # Errors
    ///
    /// - [`DaemonError::Conflict`] for the local node or the active node.
    /// - [`DaemonError::NotFound`] for an unknown node.
    pub async fn remove(self: &Arc<Self>, hostname: &str) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        if hostname == self.hostname() {
            return Err(DaemonError::Conflict(
                "use leave to remove the local node".to_string(),
            ));
        }
        if self.config.node_by_hostname(hostname).is_none() {
            return Err(DaemonError::NotFound(format!("node {hostname}")));
        }
        if self
            .cluster
            .members()
            .get(hostname)
            .is_some_and(|m| m.status() == MemberStatus::Active)
        {
            return Err(DaemonError::Conflict(format!(
                "{hostname} is active; promote another member first"
            )));
        }

        let request = PeerRequest::Remove(LeavePayload {
            hostname: hostname.to_string(),
            replicated: false,
        });
        self.cluster.broadcast(&request, &[]).await;
        self.forget_member(hostname).await?;
        self.cluster
            .relay_log(LogLevel::Info, format!("{hostname} was removed from the cluster"));
        Ok(())
    }

    /// Makes `hostname` the active member.
    ///
    /// # Errors
    ///
    /// As [`Cluster::promote_member`](crate::cluster::Cluster::promote_member).
    pub async fn promote(self: &Arc<Self>, hostname: &str) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        self.cluster.promote_member(hostname).await
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Replaces the cluster token and returns the new cleartext. Only its
    /// digest is stored.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`].
    pub async fn rotate_token(&self) -> DaemonResult<String> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let token = generate_token();
        self.config.set_cluster_token(&hash_token(&token));
        info!("cluster token rotated");
        Ok(token)
    }

    /// Re-issues this node's leaf certificates from the stored CA for its
    /// current bind address.
    ///
    /// # Errors
    ///
    /// [`DaemonError::MissingCa`] without a CA, or the issuing error.
    pub async fn reissue_certificates(&self) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let (_, node) = self.config.local_node().ok_or(DaemonError::NotInCluster)?;
        let ip = parse_ip(&node.bind_address)?;
        self.identity.issue_leaves(ip)?;
        self.identity.load_into(&self.tls)?;
        info!(%ip, "certificates re-issued");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection and tuning
    // -----------------------------------------------------------------------

    /// One row per member, in configured-node order.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`].
    pub fn status(&self) -> DaemonResult<Vec<StatusRow>> {
        self.require_cluster()?;
        let config = self.config.get();
        Ok(self
            .cluster
            .members()
            .all()
            .iter()
            .map(|member| {
                let record = member.record();
                let (address, port) = config
                    .node_by_hostname(member.hostname())
                    .map(|(_, node)| (node.bind_address.clone(), node.bind_port.clone()))
                    .unwrap_or_default();
                StatusRow {
                    hostname: record.hostname,
                    address,
                    port,
                    status: record.status,
                    latency: record.latency,
                    last_received: record.last_received,
                    score: record.score,
                    local: member.is_local(),
                }
            })
            .collect())
    }

    /// Changes one tunable and replicates the document.
    ///
    /// # Errors
    ///
    /// As [`ConfigStore::update_value`](crate::config::ConfigStore::update_value).
    pub async fn update_config(self: &Arc<Self>, key: &str, value: &str) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.config.update_value(key, value)?;
        info!(key, value, "configuration updated");
        if self.config.cluster_check() {
            self.sync_config().await;
            self.cluster.reconcile().await;
        }
        Ok(())
    }

    /// `resync` brings every locally assigned group up again on the active
    /// node. Returns whether anything was done.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotFound`] for other actions.
    pub async fn network(&self, action: &str) -> DaemonResult<bool> {
        let _guard = self.control_lock.lock().await;
        if action != "resync" {
            return Err(DaemonError::NotFound(format!("network action {action}")));
        }
        self.require_cluster()?;
        let active = self
            .cluster
            .members()
            .local()
            .is_some_and(|m| m.status() == MemberStatus::Active);
        if active {
            self.cluster.move_local_ips(IpDirection::Up).await;
        }
        Ok(active)
    }

    /// Re-reads the configuration document from disk.
    ///
    /// # Errors
    ///
    /// As [`ConfigStore::reload`](crate::config::ConfigStore::reload).
    pub async fn reload(&self) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.config.reload()?;
        if self.config.cluster_check() {
            self.cluster.reconcile().await;
        }
        Ok(())
    }

    /// Sends the current document to every peer.
    pub(crate) async fn sync_config(&self) {
        let request = PeerRequest::ConfigSync(ConfigSyncPayload {
            config: self.config.get(),
            replicated: false,
        });
        let failures = self.cluster.broadcast(&request, &[]).await;
        if !failures.is_empty() {
            warn!(failed = failures.len(), "configuration not replicated to every member");
        }
    }
}
