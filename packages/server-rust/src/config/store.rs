//! The in-memory configuration store.
//!
//! All mutations run against a copy of the document under a single mutex; the
//! copy is validated and only then committed. Persistence happens after the
//! mutex is released and is serialised by its own lock, so no disk I/O ever
//! runs while the document is locked. Readers always get snapshot copies.

use std::sync::Arc;

use parking_lot::Mutex;
use pulseha_core::config::is_valid_cidr;
use pulseha_core::{ClusterConfig, LogLevel, Node, PulseSettings};
use tracing::{debug, warn};

use super::persist::ConfigPersistence;
use crate::error::{DaemonError, DaemonResult};

pub struct ConfigStore {
    current: Mutex<ClusterConfig>,
    local_hostname: Mutex<String>,
    persistence: Arc<dyn ConfigPersistence>,
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("local_hostname", &*self.local_hostname.lock())
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Loads the persisted document (or the default one) and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ConfigInvalid`] if the document is unreadable or
    /// violates an invariant, including a local hostname that is not one of
    /// the configured nodes.
    pub fn open(
        persistence: Arc<dyn ConfigPersistence>,
        local_hostname: impl Into<String>,
    ) -> DaemonResult<Self> {
        let local_hostname = local_hostname.into();
        let config = persistence.load()?.unwrap_or_default();
        config.validate(&local_hostname)?;
        Ok(Self {
            current: Mutex::new(config),
            local_hostname: Mutex::new(local_hostname),
            persistence,
            save_lock: Mutex::new(()),
        })
    }

    // -- reads --------------------------------------------------------------

    /// Snapshot copy of the whole document.
    #[must_use]
    pub fn get(&self) -> ClusterConfig {
        self.current.lock().clone()
    }

    #[must_use]
    pub fn settings(&self) -> PulseSettings {
        self.current.lock().pulseha.clone()
    }

    #[must_use]
    pub fn local_hostname(&self) -> String {
        self.local_hostname.lock().clone()
    }

    /// The local node's UUID and record.
    #[must_use]
    pub fn local_node(&self) -> Option<(String, Node)> {
        let config = self.current.lock();
        config
            .local_node()
            .map(|node| (config.pulseha.local_node.clone(), node.clone()))
    }

    #[must_use]
    pub fn node_by_hostname(&self, hostname: &str) -> Option<(String, Node)> {
        self.current
            .lock()
            .node_by_hostname(hostname)
            .map(|(uid, node)| (uid.to_string(), node.clone()))
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.current.lock().node_count()
    }

    #[must_use]
    pub fn cluster_check(&self) -> bool {
        self.current.lock().cluster_check()
    }

    fn require_cluster(&self) -> DaemonResult<()> {
        if self.cluster_check() {
            Ok(())
        } else {
            Err(DaemonError::NotInCluster)
        }
    }

    // -- commit / persist ---------------------------------------------------

    /// Applies `f` to a copy of the document, validates the copy, commits it
    /// and persists it.
    ///
    /// # Errors
    ///
    /// Returns the error from `f` or from validation; the document is left
    /// untouched in both cases.
    pub fn mutate<T>(
        &self,
        f: impl FnOnce(&mut ClusterConfig) -> DaemonResult<T>,
    ) -> DaemonResult<T> {
        let result = {
            let mut current = self.current.lock();
            let mut draft = current.clone();
            let result = f(&mut draft)?;
            draft.validate(&self.local_hostname.lock())?;
            *current = draft;
            result
        };
        self.persist();
        Ok(result)
    }

    /// Replaces the whole document.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ConfigInvalid`] if `config` does not validate.
    pub fn replace(&self, config: ClusterConfig) -> DaemonResult<()> {
        self.mutate(|current| {
            *current = config;
            Ok(())
        })
    }

    /// Writes the current document. A failure is logged and swallowed: the
    /// in-memory state stays authoritative and the next `ConfigSync` repairs
    /// the file.
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save config; local config now out of date");
        }
    }

    /// # Errors
    ///
    /// Returns the persistence error.
    pub fn save(&self) -> DaemonResult<()> {
        let _guard = self.save_lock.lock();
        let snapshot = self.get();
        self.persistence.save(&snapshot)
    }

    /// Re-reads the persisted document and validates it before adopting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read or does not validate.
    pub fn reload(&self) -> DaemonResult<()> {
        let loaded = self.persistence.load()?.unwrap_or_default();
        loaded.validate(&self.local_hostname.lock())?;
        *self.current.lock() = loaded;
        debug!("configuration reloaded from disk");
        Ok(())
    }

    // -- membership -----------------------------------------------------------

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Conflict`] if the UUID or hostname is taken.
    pub fn add_node(&self, uid: &str, node: Node) -> DaemonResult<()> {
        self.mutate(|config| {
            if config.nodes.contains_key(uid) {
                return Err(DaemonError::Conflict(format!("node {uid} already exists")));
            }
            if config.node_by_hostname(&node.hostname).is_some() {
                return Err(DaemonError::Conflict(format!(
                    "hostname {} is already a member",
                    node.hostname
                )));
            }
            config.nodes.insert(uid.to_string(), node);
            Ok(())
        })
    }

    /// Removes the node named `hostname`, returning its record.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::NotFound`] if no such node is configured.
    pub fn remove_node(&self, hostname: &str) -> DaemonResult<Node> {
        self.mutate(|config| {
            let uid = config
                .node_by_hostname(hostname)
                .map(|(uid, _)| uid.to_string())
                .ok_or_else(|| DaemonError::NotFound(format!("node {hostname}")))?;
            config
                .nodes
                .remove(&uid)
                .ok_or_else(|| DaemonError::NotFound(format!("node {hostname}")))
        })
    }

    /// Drops every node, group and the token, returning to an unconfigured
    /// document while keeping the local tunables.
    pub fn reset_cluster(&self) {
        {
            let mut config = self.current.lock();
            config.nodes.clear();
            config.floating_ip_groups.clear();
            config.pulseha.local_node.clear();
            config.pulseha.cluster_token.clear();
        }
        self.persist();
    }

    // -- tunables -------------------------------------------------------------

    /// Updates a single tunable from its string form.
    ///
    /// # Errors
    ///
    /// - [`DaemonError::ReadOnlyKey`] for `local_node` and `cluster_token`.
    /// - [`DaemonError::NotFound`] for unknown keys.
    /// - [`DaemonError::ConfigInvalid`] when the value does not parse or the
    ///   result does not validate.
    pub fn update_value(&self, key: &str, value: &str) -> DaemonResult<()> {
        let value = value.trim();
        match key {
            "local_node" | "cluster_token" => return Err(DaemonError::ReadOnlyKey(key.to_string())),
            "hostname" => return self.rename_local(value),
            _ => {}
        }
        self.mutate(|config| {
            let p = &mut config.pulseha;
            match key {
                "hcs_interval" => p.hcs_interval = parse_value(key, value)?,
                "fos_interval" => p.fos_interval = parse_value(key, value)?,
                "fo_limit" => p.fo_limit = parse_value(key, value)?,
                "auto_failback" => p.auto_failback = parse_value(key, value)?,
                "log_to_file" => p.log_to_file = parse_value(key, value)?,
                "logging_level" => {
                    p.logging_level = value
                        .parse::<LogLevel>()
                        .map_err(DaemonError::ConfigInvalid)?;
                }
                "log_file_location" => {
                    if value.is_empty() {
                        return Err(DaemonError::ConfigInvalid(
                            "log_file_location must not be empty".to_string(),
                        ));
                    }
                    p.log_file_location = value.to_string();
                }
                other => return Err(DaemonError::NotFound(format!("config key {other}"))),
            }
            Ok(())
        })
    }

    fn rename_local(&self, hostname: &str) -> DaemonResult<()> {
        if hostname.is_empty() {
            return Err(DaemonError::ConfigInvalid("hostname must not be empty".to_string()));
        }
        let previous = self.local_hostname();
        *self.local_hostname.lock() = hostname.to_string();
        let result = self.mutate(|config| {
            if config.node_by_hostname(hostname).is_some() {
                return Err(DaemonError::Conflict(format!("hostname {hostname} is taken")));
            }
            let node = config
                .local_node_mut()
                .ok_or_else(|| DaemonError::NotFound("local node".to_string()))?;
            node.hostname = hostname.to_string();
            Ok(())
        });
        if result.is_err() {
            *self.local_hostname.lock() = previous;
        }
        result
    }

    /// Stores a new token digest.
    pub fn set_cluster_token(&self, digest: &str) {
        self.current.lock().pulseha.cluster_token = digest.to_string();
        self.persist();
    }

    // -- groups ---------------------------------------------------------------

    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`], or [`DaemonError::Conflict`] if the
    /// group exists.
    pub fn add_group(&self, name: &str) -> DaemonResult<()> {
        self.require_cluster()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(DaemonError::ConfigInvalid("group name must not be empty".to_string()));
        }
        self.mutate(|config| {
            if config.floating_ip_groups.contains_key(name) {
                return Err(DaemonError::Conflict(format!("group {name} already exists")));
            }
            config.floating_ip_groups.insert(name.to_string(), Vec::new());
            Ok(())
        })
    }

    /// # Errors
    ///
    /// [`DaemonError::NotFound`] for an unknown group, [`DaemonError::Conflict`]
    /// while any node still has it assigned.
    pub fn delete_group(&self, name: &str) -> DaemonResult<()> {
        self.require_cluster()?;
        self.mutate(|config| {
            if !config.floating_ip_groups.contains_key(name) {
                return Err(DaemonError::NotFound(format!("group {name}")));
            }
            if config.group_in_use(name) {
                return Err(DaemonError::Conflict(format!(
                    "group {name} is still assigned to an interface"
                )));
            }
            config.floating_ip_groups.remove(name);
            Ok(())
        })
    }

    /// Appends IPs to a group and returns them in the order given.
    ///
    /// # Errors
    ///
    /// Any invalid, already-present or duplicated address rejects the whole
    /// batch.
    pub fn add_ips(&self, group: &str, ips: &[String]) -> DaemonResult<Vec<String>> {
        self.require_cluster()?;
        self.mutate(|config| {
            if !config.floating_ip_groups.contains_key(group) {
                return Err(DaemonError::NotFound(format!("group {group}")));
            }
            let mut added = Vec::with_capacity(ips.len());
            for ip in ips {
                let ip = ip.trim();
                if !is_valid_cidr(ip) {
                    return Err(DaemonError::ConfigInvalid(format!("invalid address {ip}")));
                }
                if let Some(owner) = config.group_of_ip(ip) {
                    return Err(DaemonError::Conflict(format!(
                        "{ip} already exists in group {owner}"
                    )));
                }
                if let Some(list) = config.floating_ip_groups.get_mut(group) {
                    list.push(ip.to_string());
                }
                added.push(ip.to_string());
            }
            Ok(added)
        })
    }

    /// Removes IPs from a group, returning those that were present. Absent
    /// addresses are logged and skipped.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotFound`] for an unknown group.
    pub fn remove_ips(&self, group: &str, ips: &[String]) -> DaemonResult<Vec<String>> {
        self.require_cluster()?;
        self.mutate(|config| {
            let list = config
                .floating_ip_groups
                .get_mut(group)
                .ok_or_else(|| DaemonError::NotFound(format!("group {group}")))?;
            let mut removed = Vec::new();
            for ip in ips {
                let ip = ip.trim();
                if let Some(pos) = list.iter().position(|existing| existing == ip) {
                    removed.push(list.remove(pos));
                } else {
                    warn!(group, ip, "ip not present in group; skipping");
                }
            }
            Ok(removed)
        })
    }

    /// Binds `group` to `iface` on the node `uid`.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotFound`] for an unknown node or group,
    /// [`DaemonError::Conflict`] if the node already hosts the group.
    pub fn assign_group(&self, uid: &str, iface: &str, group: &str) -> DaemonResult<()> {
        self.require_cluster()?;
        let iface = iface.trim();
        if iface.is_empty() {
            return Err(DaemonError::ConfigInvalid("interface must not be empty".to_string()));
        }
        self.mutate(|config| {
            if !config.floating_ip_groups.contains_key(group) {
                return Err(DaemonError::NotFound(format!("group {group}")));
            }
            let node = config
                .nodes
                .get_mut(uid)
                .ok_or_else(|| DaemonError::NotFound(format!("node {uid}")))?;
            if let Some(existing) = node.iface_for(group) {
                return Err(DaemonError::Conflict(format!(
                    "group {group} is already assigned to {existing} on {}",
                    node.hostname
                )));
            }
            node.group_assignments
                .entry(iface.to_string())
                .or_default()
                .push(group.to_string());
            Ok(())
        })
    }

    /// Reverses [`assign_group`](Self::assign_group).
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotFound`] if the assignment does not exist.
    pub fn unassign_group(&self, uid: &str, iface: &str, group: &str) -> DaemonResult<()> {
        self.require_cluster()?;
        self.mutate(|config| {
            let node = config
                .nodes
                .get_mut(uid)
                .ok_or_else(|| DaemonError::NotFound(format!("node {uid}")))?;
            let groups = node
                .group_assignments
                .get_mut(iface)
                .ok_or_else(|| DaemonError::NotFound(format!("interface {iface}")))?;
            let pos = groups
                .iter()
                .position(|g| g == group)
                .ok_or_else(|| DaemonError::NotFound(format!("group {group} on {iface}")))?;
            groups.remove(pos);
            if groups.is_empty() {
                node.group_assignments.remove(iface);
            }
            Ok(())
        })
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> DaemonResult<T> {
    value
        .parse()
        .map_err(|_| DaemonError::ConfigInvalid(format!("invalid value {value:?} for {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryPersistence;

    fn clustered() -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.pulseha.local_node = "uid-1".to_string();
        config
            .nodes
            .insert("uid-1".to_string(), Node::new("node-1", "10.0.0.1", 9000));
        config
            .nodes
            .insert("uid-2".to_string(), Node::new("node-2", "10.0.0.2", 9000));
        config
    }

    fn store_with(config: ClusterConfig) -> (ConfigStore, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new(Some(config)));
        let store = ConfigStore::open(persistence.clone(), "node-1").unwrap();
        (store, persistence)
    }

    #[test]
    fn open_rejects_foreign_hostname() {
        let persistence = Arc::new(MemoryPersistence::new(Some(clustered())));
        let err = ConfigStore::open(persistence, "stranger").unwrap_err();
        assert!(matches!(err, DaemonError::ConfigInvalid(_)));
    }

    #[test]
    fn open_defaults_when_nothing_persisted() {
        let store = ConfigStore::open(Arc::new(MemoryPersistence::default()), "h").unwrap();
        assert!(!store.cluster_check());
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn read_only_keys_are_refused() {
        let (store, _) = store_with(clustered());
        assert_eq!(
            store.update_value("cluster_token", "x"),
            Err(DaemonError::ReadOnlyKey("cluster_token".to_string()))
        );
        assert!(matches!(
            store.update_value("local_node", "x"),
            Err(DaemonError::ReadOnlyKey(_))
        ));
    }

    #[test]
    fn update_value_parses_and_validates() {
        let (store, persistence) = store_with(clustered());
        store.update_value("fo_limit", "20000").unwrap();
        assert_eq!(store.settings().fo_limit, 20_000);
        assert_eq!(persistence.saved().unwrap().pulseha.fo_limit, 20_000);

        store.update_value("logging_level", "debug").unwrap();
        assert_eq!(store.settings().logging_level, LogLevel::Debug);

        store.update_value("auto_failback", "true").unwrap();
        assert!(store.settings().auto_failback);
    }

    #[test]
    fn invalid_update_leaves_config_unchanged() {
        let (store, _) = store_with(clustered());
        let before = store.get();
        assert!(matches!(
            store.update_value("fos_interval", "500"),
            Err(DaemonError::ConfigInvalid(_))
        ));
        assert!(matches!(
            store.update_value("hcs_interval", "soon"),
            Err(DaemonError::ConfigInvalid(_))
        ));
        assert!(matches!(
            store.update_value("bogus", "1"),
            Err(DaemonError::NotFound(_))
        ));
        assert_eq!(store.get(), before);
    }

    #[test]
    fn hostname_update_renames_local_record() {
        let (store, _) = store_with(clustered());
        store.update_value("hostname", "renamed").unwrap();
        assert_eq!(store.local_node().unwrap().1.hostname, "renamed");
        assert_eq!(store.local_hostname(), "renamed");
        assert!(matches!(
            store.update_value("hostname", "node-2"),
            Err(DaemonError::Conflict(_))
        ));
        assert_eq!(store.local_hostname(), "renamed");
    }

    #[test]
    fn group_ops_require_cluster() {
        let store = ConfigStore::open(Arc::new(MemoryPersistence::default()), "h").unwrap();
        assert_eq!(store.add_group("web"), Err(DaemonError::NotInCluster));
    }

    #[test]
    fn group_new_then_delete_restores_map() {
        let (store, _) = store_with(clustered());
        let before = store.get().floating_ip_groups;
        store.add_group("web").unwrap();
        assert!(store.get().floating_ip_groups.contains_key("web"));
        store.delete_group("web").unwrap();
        assert_eq!(store.get().floating_ip_groups, before);
    }

    #[test]
    fn re_adding_an_ip_is_an_error() {
        let (store, _) = store_with(clustered());
        store.add_group("web").unwrap();
        store.add_group("db").unwrap();
        let ips = vec!["192.0.2.10/24".to_string()];
        assert_eq!(store.add_ips("web", &ips).unwrap(), ips);
        assert!(matches!(store.add_ips("web", &ips), Err(DaemonError::Conflict(_))));
        assert!(matches!(store.add_ips("db", &ips), Err(DaemonError::Conflict(_))));
        assert!(matches!(
            store.add_ips("web", &["bogus".to_string()]),
            Err(DaemonError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn removing_absent_ip_still_removes_the_rest() {
        let (store, _) = store_with(clustered());
        store.add_group("web").unwrap();
        store
            .add_ips("web", &["192.0.2.10/24".to_string(), "192.0.2.11/24".to_string()])
            .unwrap();
        let removed = store
            .remove_ips("web", &["192.0.2.99/24".to_string(), "192.0.2.10/24".to_string()])
            .unwrap();
        assert_eq!(removed, vec!["192.0.2.10/24".to_string()]);
        assert_eq!(store.get().floating_ip_groups["web"], vec!["192.0.2.11/24".to_string()]);
    }

    #[test]
    fn assign_then_unassign_is_a_no_op() {
        let (store, _) = store_with(clustered());
        store.add_group("web").unwrap();
        let before = store.get();
        store.assign_group("uid-1", "eth0", "web").unwrap();
        assert_eq!(store.get().iface_for("node-1", "web").as_deref(), Some("eth0"));
        assert!(matches!(
            store.assign_group("uid-1", "eth1", "web"),
            Err(DaemonError::Conflict(_))
        ));
        store.unassign_group("uid-1", "eth0", "web").unwrap();
        assert_eq!(store.get(), before);
    }

    #[test]
    fn assigned_group_cannot_be_deleted() {
        let (store, _) = store_with(clustered());
        store.add_group("web").unwrap();
        store.assign_group("uid-2", "eth0", "web").unwrap();
        assert!(matches!(store.delete_group("web"), Err(DaemonError::Conflict(_))));
    }

    #[test]
    fn add_and_remove_nodes() {
        let (store, _) = store_with(clustered());
        assert!(matches!(
            store.add_node("uid-3", Node::new("node-2", "10.0.0.3", 9000)),
            Err(DaemonError::Conflict(_))
        ));
        store
            .add_node("uid-3", Node::new("node-3", "10.0.0.3", 9000))
            .unwrap();
        assert_eq!(store.node_count(), 3);
        assert_eq!(store.remove_node("node-3").unwrap().bind_address, "10.0.0.3");
        assert!(matches!(store.remove_node("node-3"), Err(DaemonError::NotFound(_))));
    }

    #[test]
    fn reset_cluster_clears_membership() {
        let (store, persistence) = store_with(clustered());
        store.set_cluster_token("digest");
        store.reset_cluster();
        let config = persistence.saved().unwrap();
        assert!(config.nodes.is_empty());
        assert!(config.pulseha.cluster_token.is_empty());
        assert!(!store.cluster_check());
    }

    #[test]
    fn reload_reads_persisted_document() {
        let (store, persistence) = store_with(clustered());
        let mut changed = clustered();
        changed.pulseha.hcs_interval = 4000;
        persistence.save(&changed).unwrap();
        store.reload().unwrap();
        assert_eq!(store.settings().hcs_interval, 4000);
    }
}
