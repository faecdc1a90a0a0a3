//! The ordered set of members as this node sees it.
//!
//! Members are kept in configured-node order (the UUID order of the node map),
//! so every node enumerates the cluster identically. Lock order: the list's
//! lock first, then a member's.

use std::sync::Arc;

use parking_lot::RwLock;
use pulseha_core::{ClusterConfig, MemberRecord, MemberStatus, Node};

use super::member::Member;
use crate::network::PeerClient;

#[derive(Debug, Default)]
pub struct MemberList {
    members: RwLock<Vec<Arc<Member>>>,
}

impl MemberList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Member>> {
        self.members.read().clone()
    }

    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<Arc<Member>> {
        self.members
            .read()
            .iter()
            .find(|m| m.hostname() == hostname)
            .cloned()
    }

    #[must_use]
    pub fn local(&self) -> Option<Arc<Member>> {
        self.members.read().iter().find(|m| m.is_local()).cloned()
    }

    /// Every member except the local one.
    #[must_use]
    pub fn others(&self) -> Vec<Arc<Member>> {
        self.members
            .read()
            .iter()
            .filter(|m| !m.is_local())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn active(&self) -> Option<Arc<Member>> {
        self.find_status(|s| s == MemberStatus::Active)
    }

    /// The remote member this node believes is active, even once it has been
    /// marked suspicious.
    #[must_use]
    pub fn perceived_active(&self) -> Option<Arc<Member>> {
        self.members
            .read()
            .iter()
            .find(|m| {
                !m.is_local() && matches!(m.status(), MemberStatus::Active | MemberStatus::Suspicious)
            })
            .cloned()
    }

    /// First passive member in configured-node order: the election winner.
    #[must_use]
    pub fn next_active(&self) -> Option<Arc<Member>> {
        self.find_status(|s| s == MemberStatus::Passive)
    }

    /// First passive member other than the local one.
    #[must_use]
    pub fn next_passive_peer(&self) -> Option<Arc<Member>> {
        self.members
            .read()
            .iter()
            .find(|m| !m.is_local() && m.status() == MemberStatus::Passive)
            .cloned()
    }

    fn find_status(&self, pred: impl Fn(MemberStatus) -> bool) -> Option<Arc<Member>> {
        self.members
            .read()
            .iter()
            .find(|m| pred(m.status()))
            .cloned()
    }

    #[must_use]
    pub fn count_with(&self, status: MemberStatus) -> usize {
        self.members
            .read()
            .iter()
            .filter(|m| m.status() == status)
            .count()
    }

    /// Marks `hostname` active and demotes every other active member to
    /// passive, so at most one member is ever active in this view.
    pub fn set_exclusive_active(&self, hostname: &str) {
        for member in self.members.read().iter() {
            if member.hostname() == hostname {
                member.set_status(MemberStatus::Active);
            } else if member.status() == MemberStatus::Active {
                member.set_status(MemberStatus::Passive);
            }
        }
    }

    /// Rebuilds the list from `config`, reusing members that are still
    /// configured. Returns the members that were dropped so the caller can
    /// close their connections.
    pub fn reconcile(
        &self,
        config: &ClusterConfig,
        local_hostname: &str,
        connect: impl Fn(&str, &Node) -> Option<PeerClient>,
    ) -> Vec<Arc<Member>> {
        let mut members = self.members.write();
        let previous_local = members.iter().find(|m| m.is_local()).cloned();
        let mut next = Vec::with_capacity(config.nodes.len());

        for node in config.nodes.values() {
            let is_local = node.hostname == local_hostname;
            let existing = members
                .iter()
                .find(|m| m.hostname() == node.hostname && m.is_local() == is_local)
                .cloned();
            let member = match existing {
                Some(member) => member,
                None if is_local => {
                    let fresh = Member::local(&node.hostname);
                    let fresh = match &previous_local {
                        Some(old) => fresh.with_state(old.state()),
                        None => fresh,
                    };
                    Arc::new(fresh)
                }
                None => Arc::new(Member::remote(&node.hostname, connect(&node.hostname, node))),
            };
            next.push(member);
        }

        let dropped = members
            .iter()
            .filter(|old| !next.iter().any(|kept| Arc::ptr_eq(kept, old)))
            .cloned()
            .collect();
        *members = next;
        dropped
    }

    pub fn remove(&self, hostname: &str) -> Option<Arc<Member>> {
        let mut members = self.members.write();
        let index = members.iter().position(|m| m.hostname() == hostname)?;
        Some(members.remove(index))
    }

    pub fn clear(&self) -> Vec<Arc<Member>> {
        std::mem::take(&mut *self.members.write())
    }

    /// Heart-beat snapshot of every member.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MemberRecord> {
        self.members.read().iter().map(|m| m.record()).collect()
    }

    /// Applies a received snapshot. Unknown hostnames are ignored.
    pub fn apply_snapshot(&self, records: &[MemberRecord]) {
        let members = self.members.read();
        for record in records {
            if let Some(member) = members.iter().find(|m| m.hostname() == record.hostname) {
                member.apply_record(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hostnames: &[&str]) -> ClusterConfig {
        let mut config = ClusterConfig::default();
        for (i, hostname) in hostnames.iter().enumerate() {
            let port = 9000 + u16::try_from(i).unwrap();
            config.nodes.insert(
                format!("uid-{i}"),
                Node::new(*hostname, "127.0.0.1", port),
            );
        }
        config
    }

    fn no_client(_: &str, _: &Node) -> Option<PeerClient> {
        None
    }

    fn list(hostnames: &[&str], local: &str) -> MemberList {
        let list = MemberList::new();
        list.reconcile(&config(hostnames), local, no_client);
        list
    }

    #[test]
    fn reconcile_follows_configured_order() {
        let list = list(&["c", "a", "b"], "a");
        let names: Vec<_> = list.all().iter().map(|m| m.hostname().to_string()).collect();
        assert_eq!(names, ["c", "a", "b"]);
        assert_eq!(list.local().unwrap().hostname(), "a");
        assert_eq!(list.others().len(), 2);
    }

    #[test]
    fn reconcile_keeps_existing_members_and_reports_dropped() {
        let list = list(&["a", "b", "c"], "a");
        let b = list.get("b").unwrap();
        b.set_status(MemberStatus::Passive);

        let dropped = list.reconcile(&config(&["a", "b"]), "a", no_client);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].hostname(), "c");
        assert!(Arc::ptr_eq(&list.get("b").unwrap(), &b));
        assert_eq!(list.get("b").unwrap().status(), MemberStatus::Passive);
    }

    #[test]
    fn renamed_local_member_keeps_its_state() {
        let list = list(&["a", "b"], "a");
        list.local().unwrap().set_status(MemberStatus::Active);

        let dropped = list.reconcile(&config(&["z", "b"]), "z", no_client);
        assert_eq!(dropped[0].hostname(), "a");
        let local = list.local().unwrap();
        assert_eq!(local.hostname(), "z");
        assert_eq!(local.status(), MemberStatus::Active);
    }

    #[test]
    fn next_active_is_first_passive_in_order() {
        let list = list(&["a", "b", "c"], "c");
        assert!(list.next_active().is_none());
        list.get("c").unwrap().set_status(MemberStatus::Passive);
        list.get("b").unwrap().set_status(MemberStatus::Passive);
        assert_eq!(list.next_active().unwrap().hostname(), "b");
        assert_eq!(list.next_passive_peer().unwrap().hostname(), "b");
    }

    #[test]
    fn exclusive_active_demotes_the_previous_one() {
        let list = list(&["a", "b", "c"], "a");
        list.set_exclusive_active("a");
        list.set_exclusive_active("c");
        assert_eq!(list.count_with(MemberStatus::Active), 1);
        assert_eq!(list.active().unwrap().hostname(), "c");
        assert_eq!(list.get("a").unwrap().status(), MemberStatus::Passive);
    }

    #[test]
    fn perceived_active_includes_suspicious_remote() {
        let list = list(&["a", "b"], "b");
        list.get("a").unwrap().set_status(MemberStatus::Suspicious);
        assert!(list.active().is_none());
        assert_eq!(list.perceived_active().unwrap().hostname(), "a");
    }

    #[test]
    fn snapshot_round_trips_through_apply() {
        let sender = list(&["a", "b"], "a");
        sender.set_exclusive_active("a");
        sender.get("b").unwrap().set_status(MemberStatus::Passive);
        sender.get("b").unwrap().set_score(2);

        let receiver = list(&["a", "b"], "b");
        receiver.local().unwrap().set_status(MemberStatus::Passive);
        receiver.local().unwrap().set_score(7);
        receiver.apply_snapshot(&sender.snapshot());

        assert_eq!(receiver.get("a").unwrap().status(), MemberStatus::Active);
        assert_eq!(receiver.local().unwrap().score(), 7);
    }

    #[test]
    fn remove_and_clear() {
        let list = list(&["a", "b"], "a");
        assert_eq!(list.remove("b").unwrap().hostname(), "b");
        assert!(list.remove("b").is_none());
        assert_eq!(list.clear().len(), 1);
        assert!(list.is_empty());
    }
}
