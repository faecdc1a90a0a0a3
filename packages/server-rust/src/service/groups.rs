//! Floating-IP group verbs.
//!
//! Every successful mutation is persisted, replicated with `ConfigSync`, and
//! then the affected addresses are moved on the active member as one batch.

use pulseha_core::messages::{GroupAssignmentRow, GroupListing};
use tracing::{info, warn};

use super::Daemon;
use crate::cluster::IpDirection;
use crate::error::{DaemonError, DaemonResult};

impl Daemon {
    /// Creates a group and returns its name; without a name the first free
    /// `groupN` is used.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`], or [`DaemonError::Conflict`] for an
    /// existing name.
    pub async fn group_new(&self, name: Option<&str>) -> DaemonResult<String> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => self.next_group_name(),
        };
        self.config.add_group(&name)?;
        self.sync_config().await;
        info!(group = %name, "group created");
        Ok(name)
    }

    fn next_group_name(&self) -> String {
        let groups = self.config.get().floating_ip_groups;
        (1..)
            .map(|n| format!("group{n}"))
            .find(|candidate| !groups.contains_key(candidate))
            .unwrap_or_default()
    }

    /// # Errors
    ///
    /// [`DaemonError::NotFound`] for an unknown group, [`DaemonError::Conflict`]
    /// while it is still assigned.
    pub async fn group_delete(&self, name: &str) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        self.config.delete_group(name)?;
        self.sync_config().await;
        info!(group = name, "group deleted");
        Ok(())
    }

    /// Adds addresses to a group and brings them up on the active member.
    ///
    /// # Errors
    ///
    /// Any invalid or duplicate address rejects the whole batch.
    pub async fn group_add(&self, name: &str, ips: &[String]) -> DaemonResult<Vec<String>> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let added = self.config.add_ips(name, ips)?;
        self.sync_config().await;
        self.move_group(IpDirection::Up, name, &added, None, None)
            .await;
        Ok(added)
    }

    /// Removes addresses from a group and brings them down on the active
    /// member. Absent addresses are skipped.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotFound`] for an unknown group.
    pub async fn group_remove(&self, name: &str, ips: &[String]) -> DaemonResult<Vec<String>> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let removed = self.config.remove_ips(name, ips)?;
        self.sync_config().await;
        self.move_group(IpDirection::Down, name, &removed, None, None)
            .await;
        Ok(removed)
    }

    /// Binds a group to `iface` on `node` (the local node by default). If
    /// that node is active the group comes up immediately.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotFound`] for an unknown node or group,
    /// [`DaemonError::Conflict`] if the node already hosts the group.
    pub async fn group_assign(
        &self,
        name: &str,
        node: Option<&str>,
        iface: &str,
    ) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let (uid, hostname) = self.resolve_node(node)?;
        self.config.assign_group(&uid, iface, name)?;
        self.sync_config().await;
        let ips = self.group_ips(name);
        self.move_group(IpDirection::Up, name, &ips, Some(iface), Some(&hostname))
            .await;
        info!(group = name, node = %hostname, iface, "group assigned");
        Ok(())
    }

    /// Reverses [`group_assign`](Self::group_assign); the group's addresses
    /// come down if that node is active.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotFound`] if the assignment does not exist.
    pub async fn group_unassign(
        &self,
        name: &str,
        node: Option<&str>,
        iface: &str,
    ) -> DaemonResult<()> {
        let _guard = self.control_lock.lock().await;
        self.require_cluster()?;
        let (uid, hostname) = self.resolve_node(node)?;
        self.config.unassign_group(&uid, iface, name)?;
        self.sync_config().await;
        let ips = self.group_ips(name);
        self.move_group(IpDirection::Down, name, &ips, Some(iface), Some(&hostname))
            .await;
        info!(group = name, node = %hostname, iface, "group unassigned");
        Ok(())
    }

    /// Groups with their addresses and every node's interface assignments.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`].
    pub fn group_list(&self) -> DaemonResult<GroupListing> {
        self.require_cluster()?;
        let config = self.config.get();
        let assignments = config
            .nodes
            .values()
            .flat_map(|node| {
                node.group_assignments
                    .iter()
                    .map(move |(iface, groups)| GroupAssignmentRow {
                        hostname: node.hostname.clone(),
                        iface: iface.clone(),
                        groups: groups.clone(),
                    })
            })
            .collect();
        Ok(GroupListing {
            groups: config.floating_ip_groups,
            assignments,
        })
    }

    fn resolve_node(&self, node: Option<&str>) -> DaemonResult<(String, String)> {
        let hostname = node.map_or_else(|| self.hostname(), str::to_string);
        self.config
            .node_by_hostname(&hostname)
            .map(|(uid, _)| (uid, hostname.clone()))
            .ok_or_else(|| DaemonError::NotFound(format!("node {hostname}")))
    }

    fn group_ips(&self, name: &str) -> Vec<String> {
        self.config
            .get()
            .floating_ip_groups
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// The configuration change already succeeded; a failed move is logged
    /// and repaired by the next promotion or `network resync`.
    async fn move_group(
        &self,
        direction: IpDirection,
        group: &str,
        ips: &[String],
        iface: Option<&str>,
        only_on: Option<&str>,
    ) {
        if let Err(e) = self
            .cluster
            .route_ips(direction, group, ips, iface, only_on)
            .await
        {
            warn!(group, ?direction, error = %e, "failed to move floating IPs");
        }
    }
}
