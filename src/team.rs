//! Team tree: nestable process subsets, each with its own communicator and
//! segment table (spec §4.2), grounded on the teacher's parent/child tree of
//! per-core scheduler state, generalized from "one node per core" to "one
//! node per team".

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{DartError, Result};
use crate::segment::SegmentTable;
use crate::transport::Communicator;

/// Team identifier. `0` is always the root, containing every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamId(pub u16);

pub const TEAM_ALL: TeamId = TeamId(0);
/// Sentinel, never usable in operations except equality tests (spec §6).
pub const TEAM_NULL: TeamId = TeamId(u16::MAX);

pub struct TeamNode {
    pub id: TeamId,
    pub parent: Option<TeamId>,
    pub children: Mutex<Vec<TeamId>>,
    /// Group members, as global unit ids, in team-local index order.
    pub group: Vec<i32>,
    pub comm: Communicator,
    pub segments: RwLock<SegmentTable>,
}

impl TeamNode {
    pub fn size(&self) -> usize {
        self.group.len()
    }

    /// `l2g(local_id) -> global_id`.
    pub fn l2g(&self, local_id: i32) -> Option<i32> {
        self.group.get(local_id as usize).copied()
    }

    /// `g2l(global_id) -> local_id`, `None` if `global_id` is not a member.
    pub fn g2l(&self, global_id: i32) -> Option<i32> {
        self.group
            .iter()
            .position(|&u| u == global_id)
            .map(|i| i as i32)
    }
}

/// The tree of teams. A single instance lives in [`crate::runtime::Runtime`]
/// (spec §9 "Global mutable state": "one array of teams indexed by id").
pub struct TeamTree {
    nodes: RwLock<HashMap<TeamId, Arc<TeamNode>, RandomState>>,
    next_id: AtomicU16,
}

impl TeamTree {
    /// Bootstraps team 0 containing every unit (spec §4.2 invariant).
    pub fn new(all_units: Vec<i32>, comm: Communicator) -> Self {
        let mut nodes = HashMap::default();
        nodes.insert(
            TEAM_ALL,
            Arc::new(TeamNode {
                id: TEAM_ALL,
                parent: None,
                children: Mutex::new(Vec::new()),
                group: all_units,
                comm,
                segments: RwLock::new(SegmentTable::new()),
            }),
        );
        TeamTree {
            nodes: RwLock::new(nodes),
            next_id: AtomicU16::new(1),
        }
    }

    pub fn get(&self, id: TeamId) -> Option<Arc<TeamNode>> {
        self.nodes.read().get(&id).cloned()
    }

    /// Collective on `parent`: every caller supplies the same `group`, a
    /// subset of `parent`'s own group (spec §4.2). `comm` is the transport
    /// communicator already restricted to `group` by the caller — team
    /// creation itself does not touch the wire, matching "(c) requests a new
    /// transport communicator restricted to the group" being the caller's
    /// one collective round-trip, not a second one hidden in this call.
    pub fn create(&self, parent: TeamId, group: Vec<i32>, comm: Communicator) -> Result<TeamId> {
        let parent_node = self
            .get(parent)
            .ok_or_else(|| DartError::NotFound(format!("team {}", parent.0)))?;
        if !group.iter().all(|u| parent_node.group.contains(u)) {
            return Err(DartError::Inval(
                "child group must be a subset of the parent group".into(),
            ));
        }

        let id = TeamId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let node = Arc::new(TeamNode {
            id,
            parent: Some(parent),
            children: Mutex::new(Vec::new()),
            group,
            comm,
            segments: RwLock::new(SegmentTable::new()),
        });

        self.nodes.write().insert(id, node);
        parent_node.children.lock().push(id);
        Ok(id)
    }

    /// Collective on `team`: recursively destroys children first, depth
    /// first, to avoid dangling child links (spec §9 "Circular structures").
    pub fn destroy(&self, team: TeamId) -> Result<()> {
        if team == TEAM_ALL {
            return Err(DartError::Inval("the root team cannot be destroyed".into()));
        }
        let node = self
            .get(team)
            .ok_or_else(|| DartError::NotFound(format!("team {}", team.0)))?;
        let children: Vec<TeamId> = node.children.lock().clone();
        for child in children {
            self.destroy(child)?;
        }
        node.segments.write().destroy_all(true);

        self.nodes.write().remove(&team);
        if let Some(parent_id) = node.parent {
            if let Some(parent_node) = self.get(parent_id) {
                parent_node.children.lock().retain(|&c| c != team);
            }
        }
        Ok(())
    }

    /// Splits `team`'s group into `n` deterministic partitions, one per
    /// child, reconstructing the parent group when concatenated in order
    /// (spec §4.2 invariant).
    pub fn split_groups(&self, team: TeamId, n: usize) -> Result<Vec<Vec<i32>>> {
        let node = self
            .get(team)
            .ok_or_else(|| DartError::NotFound(format!("team {}", team.0)))?;
        if n == 0 {
            return Err(DartError::Inval("cannot split into zero groups".into()));
        }
        let mut groups: Vec<Vec<i32>> = vec![Vec::new(); n];
        for (i, &unit) in node.group.iter().enumerate() {
            groups[i % n].push(unit);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Communicator;

    #[test]
    fn team_of_size_one_has_local_id_zero() {
        let tree = TeamTree::new(vec![0, 1, 2, 3], Communicator::loopback_noop());
        let id = tree
            .create(TEAM_ALL, vec![2], Communicator::loopback_noop())
            .unwrap();
        let node = tree.get(id).unwrap();
        assert_eq!(node.size(), 1);
        assert_eq!(node.g2l(2), Some(0));
    }

    #[test]
    fn child_group_must_be_parent_subset() {
        let tree = TeamTree::new(vec![0, 1], Communicator::loopback_noop());
        assert!(tree
            .create(TEAM_ALL, vec![0, 5], Communicator::loopback_noop())
            .is_err());
    }

    #[test]
    fn team_ids_are_monotonically_non_decreasing_after_destroy_and_recreate() {
        let tree = TeamTree::new(vec![0, 1, 2], Communicator::loopback_noop());
        let first = tree
            .create(TEAM_ALL, vec![0, 1], Communicator::loopback_noop())
            .unwrap();
        tree.destroy(first).unwrap();
        let second = tree
            .create(TEAM_ALL, vec![0, 1], Communicator::loopback_noop())
            .unwrap();
        assert!(second.0 >= first.0);
    }

    #[test]
    fn split_groups_partition_reconstructs_parent() {
        let tree = TeamTree::new(vec![0, 1, 2, 3], Communicator::loopback_noop());
        let groups = tree.split_groups(TEAM_ALL, 2).unwrap();
        let mut flat: Vec<i32> = groups.into_iter().flatten().collect();
        flat.sort();
        assert_eq!(flat, vec![0, 1, 2, 3]);
    }
}
