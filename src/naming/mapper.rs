//! Responsibility Mapper
//!
//! Decides which node is the sole authoritative writer of a resource key.
//! The owner of `key` is `members[hash(key) % members.len()]` over the sorted
//! member view, so every node holding the same view computes the same owner.

use crate::distro::types::ResourceKey;
use crate::membership::{service::MembershipService, types::NodeId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub struct ResponsibilityMapper {
    membership: Arc<MembershipService>,
}

impl ResponsibilityMapper {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Arc::new(Self { membership })
    }

    pub fn distro_hash(key: &ResourceKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.as_str().hash(&mut hasher);
        hasher.finish()
    }

    /// Owner of `key` within an explicit, already sorted view.
    pub fn owner_in(view: &[NodeId], key: &ResourceKey) -> Option<NodeId> {
        if view.is_empty() {
            return None;
        }
        let idx = (Self::distro_hash(key) % view.len() as u64) as usize;
        Some(view[idx].clone())
    }

    /// Current sorted membership snapshot.
    pub fn view(&self) -> Vec<NodeId> {
        self.membership.sorted_members()
    }

    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    /// Owner under the current view; the local node when the view is empty.
    pub fn owner(&self, key: &ResourceKey) -> NodeId {
        Self::owner_in(&self.view(), key).unwrap_or_else(|| self.local_id().clone())
    }

    pub fn is_responsible(&self, key: &ResourceKey) -> bool {
        &self.owner(key) == self.local_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(ids: &[&str]) -> Vec<NodeId> {
        let mut view: Vec<NodeId> = ids.iter().map(|id| NodeId(id.to_string())).collect();
        view.sort();
        view
    }

    #[test]
    fn test_owner_is_deterministic() {
        let members = view(&["node-a", "node-b", "node-c"]);
        let key = ResourceKey::new("public@@DEFAULT_GROUP@@orders");

        let first = ResponsibilityMapper::owner_in(&members, &key);
        let second = ResponsibilityMapper::owner_in(&members, &key);

        assert_eq!(first, second);
        assert!(members.contains(&first.unwrap()));
    }

    #[test]
    fn test_empty_view_has_no_owner() {
        let key = ResourceKey::new("public@@DEFAULT_GROUP@@orders");
        assert!(ResponsibilityMapper::owner_in(&[], &key).is_none());
    }

    #[test]
    fn test_keys_spread_over_members() {
        let members = view(&["node-a", "node-b", "node-c"]);
        let mut counts = std::collections::HashMap::new();

        for i in 0..3000 {
            let key = ResourceKey::new(format!("public@@DEFAULT_GROUP@@svc-{}", i));
            let owner = ResponsibilityMapper::owner_in(&members, &key).unwrap();
            *counts.entry(owner).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 3, "Every member should own some keys");
        for count in counts.values() {
            assert!(*count > 500, "Distribution too skewed: {:?}", counts);
        }
    }
}
