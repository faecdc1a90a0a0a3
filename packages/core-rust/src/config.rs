//! The persisted cluster configuration document and its invariants.
//!
//! This is the typed form of `/etc/pulseha/config.json`. Nodes are keyed by
//! UUID and groups by name; both maps are ordered so that every member
//! enumerates the cluster in the same order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::types::LogLevel;

/// Minimum value, in milliseconds, of every interval tunable.
pub const MIN_INTERVAL_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A configuration invariant that does not hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be at least {MIN_INTERVAL_MS}ms (got {value}ms)")]
    IntervalTooSmall { key: &'static str, value: u64 },
    #[error("fo_limit ({limit}ms) must not be lower than fos_interval ({interval}ms)")]
    LimitBelowInterval { limit: u64, interval: u64 },
    #[error("local hostname {hostname} is not a configured node")]
    LocalNodeMissing { hostname: String },
    #[error("node {node} assigns unknown group {group} to interface {iface}")]
    UnknownGroup {
        node: String,
        iface: String,
        group: String,
    },
    #[error("group {group} is assigned to more than one interface on node {node}")]
    GroupAssignedTwice { node: String, group: String },
    #[error("ip {ip} appears in both {first} and {second}")]
    DuplicateIp {
        ip: String,
        first: String,
        second: String,
    },
    #[error("invalid address: {value}")]
    InvalidAddress { value: String },
    #[error("invalid port: {value}")]
    InvalidPort { value: String },
    #[error("duplicate hostname {hostname}")]
    DuplicateHostname { hostname: String },
}

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// Tunables and identity under the `"pulseha"` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseSettings {
    /// Health-check (heart-beat) interval in milliseconds.
    pub hcs_interval: u64,
    /// Fail-over monitor interval in milliseconds.
    pub fos_interval: u64,
    /// Silence, in milliseconds, after which a passive member starts an election.
    pub fo_limit: u64,
    #[serde(default)]
    pub local_node: String,
    /// SHA-256 hex digest of the cleartext cluster token.
    #[serde(default)]
    pub cluster_token: String,
    #[serde(default)]
    pub logging_level: LogLevel,
    #[serde(default)]
    pub auto_failback: bool,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_file")]
    pub log_file_location: String,
}

fn default_log_file() -> String {
    "/var/log/pulseha.log".to_string()
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            hcs_interval: 1000,
            fos_interval: 2000,
            fo_limit: 10_000,
            local_node: String::new(),
            cluster_token: String::new(),
            logging_level: LogLevel::Info,
            auto_failback: false,
            log_to_file: false,
            log_file_location: default_log_file(),
        }
    }
}

/// A configured peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    #[serde(default)]
    pub bind_address: String,
    #[serde(default)]
    pub bind_port: String,
    /// Interface name to the ordered list of groups it may host.
    #[serde(default)]
    pub group_assignments: BTreeMap<String, Vec<String>>,
}

impl Node {
    #[must_use]
    pub fn new(hostname: impl Into<String>, bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            bind_address: bind_address.into(),
            bind_port: bind_port.to_string(),
            group_assignments: BTreeMap::new(),
        }
    }

    /// Returns `true` when both the bind address and port are set.
    #[must_use]
    pub fn has_endpoint(&self) -> bool {
        !self.bind_address.trim().is_empty() && !self.bind_port.trim().is_empty()
    }

    /// Parses the bind address and port into a socket address.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.bind_address.trim().parse().ok()?;
        let port: u16 = self.bind_port.trim().parse().ok()?;
        Some(SocketAddr::new(ip, port))
    }

    /// Returns the first interface that names `group`.
    #[must_use]
    pub fn iface_for(&self, group: &str) -> Option<&str> {
        self.group_assignments
            .iter()
            .find(|(_, groups)| groups.iter().any(|g| g == group))
            .map(|(iface, _)| iface.as_str())
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub pulseha: PulseSettings,
    /// Keyed by group name, so groups are always enumerated in name order
    /// rather than creation order.
    #[serde(default)]
    pub floating_ip_groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
}

impl ClusterConfig {
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if this configuration describes an established cluster.
    ///
    /// A single node only counts once it has a bind address and port, which
    /// separates a configured one-node cluster from the unconfigured default.
    #[must_use]
    pub fn cluster_check(&self) -> bool {
        match self.nodes.len() {
            0 => false,
            1 => self.nodes.values().all(Node::has_endpoint),
            _ => true,
        }
    }

    /// Returns the local node record.
    #[must_use]
    pub fn local_node(&self) -> Option<&Node> {
        self.nodes.get(&self.pulseha.local_node)
    }

    pub fn local_node_mut(&mut self) -> Option<&mut Node> {
        self.nodes.get_mut(&self.pulseha.local_node)
    }

    /// Finds a node and its UUID by hostname.
    #[must_use]
    pub fn node_by_hostname(&self, hostname: &str) -> Option<(&str, &Node)> {
        self.nodes
            .iter()
            .find(|(_, node)| node.hostname == hostname)
            .map(|(uid, node)| (uid.as_str(), node))
    }

    /// Hostnames in configured-node order.
    #[must_use]
    pub fn hostnames(&self) -> Vec<String> {
        self.nodes.values().map(|n| n.hostname.clone()).collect()
    }

    /// Resolves the interface on `hostname` that hosts `group`.
    #[must_use]
    pub fn iface_for(&self, hostname: &str, group: &str) -> Option<String> {
        self.node_by_hostname(hostname)
            .and_then(|(_, node)| node.iface_for(group))
            .map(str::to_string)
    }

    /// Returns the group owning `ip`, if any.
    #[must_use]
    pub fn group_of_ip(&self, ip: &str) -> Option<&str> {
        self.floating_ip_groups
            .iter()
            .find(|(_, ips)| ips.iter().any(|candidate| candidate == ip))
            .map(|(name, _)| name.as_str())
    }

    /// Returns `true` if any node assigns `group` to an interface.
    #[must_use]
    pub fn group_in_use(&self, group: &str) -> bool {
        self.nodes.values().any(|n| n.iface_for(group).is_some())
    }

    /// `(interface, ips)` batches for every group assigned on the local node.
    #[must_use]
    pub fn local_ip_batches(&self) -> Vec<(String, Vec<String>)> {
        let Some(node) = self.local_node() else {
            return Vec::new();
        };
        let mut batches = Vec::new();
        for (iface, groups) in &node.group_assignments {
            for group in groups {
                if let Some(ips) = self.floating_ip_groups.get(group) {
                    if !ips.is_empty() {
                        batches.push((iface.clone(), ips.clone()));
                    }
                }
            }
        }
        batches
    }

    /// Checks every invariant of the document.
    ///
    /// `local_hostname` is only consulted when the configuration is in a cluster.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self, local_hostname: &str) -> Result<(), ConfigError> {
        self.validate_tunables()?;
        self.validate_nodes()?;
        self.validate_groups()?;
        if self.cluster_check() && self.node_by_hostname(local_hostname).is_none() {
            return Err(ConfigError::LocalNodeMissing {
                hostname: local_hostname.to_string(),
            });
        }
        Ok(())
    }

    fn validate_tunables(&self) -> Result<(), ConfigError> {
        let p = &self.pulseha;
        for (key, value) in [
            ("hcs_interval", p.hcs_interval),
            ("fos_interval", p.fos_interval),
            ("fo_limit", p.fo_limit),
        ] {
            if value < MIN_INTERVAL_MS {
                return Err(ConfigError::IntervalTooSmall { key, value });
            }
        }
        if p.fo_limit < p.fos_interval {
            return Err(ConfigError::LimitBelowInterval {
                limit: p.fo_limit,
                interval: p.fos_interval,
            });
        }
        Ok(())
    }

    fn validate_nodes(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for node in self.nodes.values() {
            if !seen.insert(node.hostname.as_str()) {
                return Err(ConfigError::DuplicateHostname {
                    hostname: node.hostname.clone(),
                });
            }
            if !node.bind_address.trim().is_empty()
                && node.bind_address.trim().parse::<IpAddr>().is_err()
            {
                return Err(ConfigError::InvalidAddress {
                    value: node.bind_address.clone(),
                });
            }
            if !node.bind_port.trim().is_empty() && node.bind_port.trim().parse::<u16>().is_err()
            {
                return Err(ConfigError::InvalidPort {
                    value: node.bind_port.clone(),
                });
            }
            let mut assigned = HashSet::new();
            for (iface, groups) in &node.group_assignments {
                for group in groups {
                    if !self.floating_ip_groups.contains_key(group) {
                        return Err(ConfigError::UnknownGroup {
                            node: node.hostname.clone(),
                            iface: iface.clone(),
                            group: group.clone(),
                        });
                    }
                    if !assigned.insert(group.as_str()) {
                        return Err(ConfigError::GroupAssignedTwice {
                            node: node.hostname.clone(),
                            group: group.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_groups(&self) -> Result<(), ConfigError> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for (group, ips) in &self.floating_ip_groups {
            for ip in ips {
                if !is_valid_cidr(ip) {
                    return Err(ConfigError::InvalidAddress { value: ip.clone() });
                }
                if let Some(first) = owners.insert(ip.as_str(), group.as_str()) {
                    return Err(ConfigError::DuplicateIp {
                        ip: ip.clone(),
                        first: first.to_string(),
                        second: group.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Accepts a bare IP or `ip/prefix` with a prefix that fits the address family.
#[must_use]
pub fn is_valid_cidr(value: &str) -> bool {
    let (addr, prefix) = match value.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (value, None),
    };
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return false;
    };
    let max = if ip.is_ipv4() { 32 } else { 128 };
    match prefix {
        None => true,
        Some(p) => p.parse::<u8>().is_ok_and(|p| p <= max),
    }
}
