//! Group presence tracking.
//!
//! `GroupPresenceIndex` maps each group to the set of its members that
//! currently hold a live session. Every mutation of one group's set happens
//! under that group's DashMap shard lock, so updates are linearizable per
//! group id and readers never observe a half-applied bulk change to a set.

pub mod coordinator;

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::models::{GroupId, UserId};

/// Online members of one group at a single instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPresence {
    pub group_id: GroupId,
    pub online: BTreeSet<UserId>,
}

impl GroupPresence {
    pub fn count(&self) -> usize {
        self.online.len()
    }
}

#[derive(Debug, Default)]
pub struct GroupPresenceIndex {
    groups: DashMap<GroupId, BTreeSet<UserId>>,
    /// Reverse map so a disconnect can find every set it appears in.
    memberships: DashMap<UserId, BTreeSet<GroupId>>,
}

impl GroupPresenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Returns true if the user was not already present.
    pub fn add_member(&self, group_id: &str, user_id: &str) -> bool {
        let added = self
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        self.memberships
            .entry(user_id.to_string())
            .or_default()
            .insert(group_id.to_string());
        added
    }

    /// Idempotent. An emptied group keeps its (empty) entry.
    pub fn remove_member(&self, group_id: &str, user_id: &str) -> bool {
        let removed = self
            .groups
            .get_mut(group_id)
            .map(|mut members| members.remove(user_id))
            .unwrap_or(false);
        if let Some(mut groups) = self.memberships.get_mut(user_id) {
            groups.remove(group_id);
        }
        removed
    }

    pub fn online_members(&self, group_id: &str) -> BTreeSet<UserId> {
        self.groups
            .get(group_id)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    pub fn online_count_and_members(&self, group_id: &str) -> (usize, BTreeSet<UserId>) {
        let members = self.online_members(group_id);
        (members.len(), members)
    }

    pub fn snapshot(&self, group_id: &str) -> GroupPresence {
        GroupPresence {
            group_id: group_id.to_string(),
            online: self.online_members(group_id),
        }
    }

    pub fn is_online_in(&self, group_id: &str, user_id: &str) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|members| members.contains(user_id))
    }

    pub fn has_group(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    pub fn groups_of(&self, user_id: &str) -> BTreeSet<GroupId> {
        self.memberships
            .get(user_id)
            .map(|groups| groups.value().clone())
            .unwrap_or_default()
    }

    /// Apply `f` to the presence set of each of `group_ids`, one group at a
    /// time, each under that group's lock. Returns the post-update snapshots.
    pub fn for_each_group_of_user<F>(
        &self,
        user_id: &str,
        group_ids: &[GroupId],
        mut f: F,
    ) -> Vec<GroupPresence>
    where
        F: FnMut(&str, &mut BTreeSet<UserId>),
    {
        let mut snapshots = Vec::with_capacity(group_ids.len());
        for group_id in group_ids {
            let online = {
                let mut members = self.groups.entry(group_id.clone()).or_default();
                f(group_id.as_str(), &mut *members);
                members.value().clone()
            };
            let mut groups = self.memberships.entry(user_id.to_string()).or_default();
            if online.contains(user_id) {
                groups.insert(group_id.clone());
            } else {
                groups.remove(group_id);
            }
            drop(groups);
            snapshots.push(GroupPresence {
                group_id: group_id.clone(),
                online,
            });
        }
        snapshots
    }

    /// Connect path: add `user_id` to every listed group.
    pub fn add_to_groups(&self, user_id: &str, group_ids: &[GroupId]) -> Vec<GroupPresence> {
        self.for_each_group_of_user(user_id, group_ids, |_, members| {
            members.insert(user_id.to_string());
        })
    }

    /// Disconnect path: remove `user_id` from every group it is present in.
    pub fn remove_from_all(&self, user_id: &str) -> Vec<GroupPresence> {
        let group_ids: Vec<GroupId> = self.groups_of(user_id).into_iter().collect();
        let snapshots = self.for_each_group_of_user(user_id, &group_ids, |_, members| {
            members.remove(user_id);
        });
        self.memberships
            .remove_if(user_id, |_, groups| groups.is_empty());
        snapshots
    }
}

/// Per-user async locks serialising lifecycle transitions (connect,
/// disconnect, join, leave, removal) for one user. Held across directory
/// reads, never across registry or index critical sections' awaits.
///
/// An entry lives only while someone holds or waits on it.
#[derive(Debug, Default)]
pub struct LifecycleLocks {
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

/// Held lifecycle lock. Dropping it releases the lock and prunes the entry
/// when nobody else is queued on it.
#[derive(Debug)]
pub struct LifecycleGuard {
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's reference left: no holder, no waiter.
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl LifecycleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, user_id: &str) -> LifecycleGuard {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        LifecycleGuard {
            user_id: user_id.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Users with a held or awaited lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
