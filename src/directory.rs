//! Per-group membership registry owned by the sequencer process.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    ledger::{GroupId, ReplicaId},
    Addr,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: ReplicaId,
    pub addr: Addr,
}

/// Membership view pushed wholesale to every member whenever it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: GroupId,
    pub members: BTreeSet<ReplicaId>,
}

#[derive(Debug, Default)]
pub struct GroupDirectory(HashMap<GroupId, BTreeMap<ReplicaId, Addr>>);

impl GroupDirectory {
    /// Adds the member to its group (derived from the id) and returns the
    /// updated view, which the caller pushes to every member, the new one
    /// included.
    pub fn register(&mut self, member: Member) -> GroupMembership {
        let group = member.id.group.clone();
        self.0
            .entry(group.clone())
            .or_default()
            .insert(member.id, member.addr);
        self.membership(&group)
    }

    /// Removes the member; `None` when it was not registered, so repeated
    /// evictions of the same member push at most one rebroadcast.
    pub fn evict(&mut self, id: &ReplicaId) -> Option<GroupMembership> {
        self.0.get_mut(&id.group)?.remove(id)?;
        Some(self.membership(&id.group))
    }

    pub fn members(&self, group: &str) -> Vec<Member> {
        let Some(members) = self.0.get(group) else {
            return Vec::new();
        };
        members
            .iter()
            .map(|(id, addr)| Member {
                id: id.clone(),
                addr: addr.clone(),
            })
            .collect()
    }

    pub fn addr(&self, id: &ReplicaId) -> Option<Addr> {
        self.0.get(&id.group)?.get(id).cloned()
    }

    pub fn membership(&self, group: &str) -> GroupMembership {
        GroupMembership {
            group: group.into(),
            members: self
                .0
                .get(group)
                .map(|members| members.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(group: &str, nonce: u32) -> Member {
        Member {
            id: ReplicaId {
                group: group.into(),
                nonce,
            },
            addr: Addr::Untyped(format!("{group}-{nonce}")),
        }
    }

    #[test]
    fn unknown_group_is_empty() {
        let directory = GroupDirectory::default();
        assert!(directory.members("nobody").is_empty());
        assert!(directory.membership("nobody").members.is_empty())
    }

    #[test]
    fn registration_is_per_group() {
        let mut directory = GroupDirectory::default();
        directory.register(member("acme", 1));
        directory.register(member("acme", 2));
        directory.register(member("globex", 1));
        assert_eq!(directory.members("acme").len(), 2);
        assert_eq!(directory.members("globex").len(), 1)
    }

    #[test]
    fn eviction_shrinks_the_pushed_view() {
        let mut directory = GroupDirectory::default();
        let evicted = member("acme", 1);
        directory.register(evicted.clone());
        let membership = directory.register(member("acme", 2));
        assert_eq!(membership.members.len(), 2);
        let membership = directory.evict(&evicted.id).unwrap();
        assert_eq!(
            Vec::from_iter(membership.members.iter().map(|id| id.nonce)),
            [2]
        );
        assert_eq!(directory.evict(&evicted.id), None)
    }
}
