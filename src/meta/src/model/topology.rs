// Copyright 2025 NebulaStream
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The worker topology: a rooted DAG of nodes with slot capacities.
//!
//! Edges point towards the root ("parents" are downstream, closer to the
//! coordinator). The structure is an arena keyed by worker id; a single
//! writer lock around the whole topology is taken by the service layer.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use nebulastream_common::types::WorkerId;

use crate::error::{MetaError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNode {
    pub worker_id: WorkerId,
    pub host: String,
    pub grpc_port: u16,
    pub data_port: u16,
    pub total_slots: u32,
    pub occupied_slots: u32,
    /// Downstream neighbours (towards the root).
    pub parents: Vec<WorkerId>,
    /// Upstream neighbours (towards the sensors).
    pub children: Vec<WorkerId>,
}

impl TopologyNode {
    pub fn free_slots(&self) -> u32 {
        self.total_slots.saturating_sub(self.occupied_slots)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }
}

#[derive(Default)]
pub struct Topology {
    nodes: BTreeMap<WorkerId, TopologyNode>,
    root: Option<WorkerId>,
    next_worker_id: u32,
    by_address: HashMap<(String, u16), WorkerId>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            next_worker_id: 1,
            ..Default::default()
        }
    }

    /// Register a worker, assigning a fresh id. Re-registration of a known
    /// host refreshes its capacity instead of allocating a new id.
    pub fn register_worker(
        &mut self,
        host: impl Into<String>,
        grpc_port: u16,
        data_port: u16,
        slots: u32,
    ) -> WorkerId {
        let host = host.into();
        if let Some(existing) = self.by_address.get(&(host.clone(), grpc_port)).copied() {
            if let Some(node) = self.nodes.get_mut(&existing) {
                tracing::info!(worker = %existing, "re-registration refreshes capacity");
                node.total_slots = slots;
                node.data_port = data_port;
                return existing;
            }
        }
        let worker_id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        self.by_address.insert((host.clone(), grpc_port), worker_id);
        self.nodes.insert(
            worker_id,
            TopologyNode {
                worker_id,
                host,
                grpc_port,
                data_port,
                total_slots: slots,
                occupied_slots: 0,
                parents: Vec::new(),
                children: Vec::new(),
            },
        );
        // The first registered node becomes the root until one is set
        // explicitly.
        if self.root.is_none() {
            self.root = Some(worker_id);
        }
        worker_id
    }

    pub fn unregister_worker(&mut self, worker_id: WorkerId) -> Result<()> {
        let node = self
            .nodes
            .remove(&worker_id)
            .ok_or(MetaError::UnknownWorker(worker_id))?;
        self.by_address.remove(&(node.host.clone(), node.grpc_port));
        for parent in &node.parents {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|c| *c != worker_id);
            }
        }
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parents.retain(|p| *p != worker_id);
            }
        }
        if self.root == Some(worker_id) {
            self.root = None;
        }
        Ok(())
    }

    pub fn set_root(&mut self, worker_id: WorkerId) -> Result<()> {
        if !self.nodes.contains_key(&worker_id) {
            return Err(MetaError::UnknownWorker(worker_id));
        }
        self.root = Some(worker_id);
        Ok(())
    }

    pub fn root(&self) -> Result<WorkerId> {
        self.root.ok_or(MetaError::NoRootNode)
    }

    pub fn node(&self, worker_id: WorkerId) -> Result<&TopologyNode> {
        self.nodes
            .get(&worker_id)
            .ok_or(MetaError::UnknownWorker(worker_id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values()
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.nodes.contains_key(&worker_id)
    }

    /// Add a downstream link: `child` forwards data to `parent`.
    pub fn add_parent(&mut self, child: WorkerId, parent: WorkerId) -> Result<()> {
        if child == parent {
            return Err(MetaError::Configuration("self-link in topology".into()));
        }
        if !self.nodes.contains_key(&parent) {
            return Err(MetaError::UnknownWorker(parent));
        }
        let child_node = self
            .nodes
            .get_mut(&child)
            .ok_or(MetaError::UnknownWorker(child))?;
        if !child_node.parents.contains(&parent) {
            child_node.parents.push(parent);
        }
        let parent_node = self.nodes.get_mut(&parent).expect("checked above");
        if !parent_node.children.contains(&child) {
            parent_node.children.push(child);
        }
        Ok(())
    }

    pub fn remove_parent(&mut self, child: WorkerId, parent: WorkerId) -> Result<()> {
        let child_node = self
            .nodes
            .get_mut(&child)
            .ok_or(MetaError::UnknownWorker(child))?;
        child_node.parents.retain(|p| *p != parent);
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(MetaError::UnknownWorker(parent))?;
        parent_node.children.retain(|c| *c != child);
        Ok(())
    }

    pub fn free_slots(&self, worker_id: WorkerId) -> Result<u32> {
        Ok(self.node(worker_id)?.free_slots())
    }

    pub fn occupy_slot(&mut self, worker_id: WorkerId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&worker_id)
            .ok_or(MetaError::UnknownWorker(worker_id))?;
        if node.free_slots() == 0 {
            return Err(MetaError::placement(format!(
                "no free slot on worker {worker_id}"
            )));
        }
        node.occupied_slots += 1;
        Ok(())
    }

    pub fn release_slot(&mut self, worker_id: WorkerId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&worker_id)
            .ok_or(MetaError::UnknownWorker(worker_id))?;
        node.occupied_slots = node.occupied_slots.saturating_sub(1);
        Ok(())
    }

    /// Shortest upstream-to-downstream path (inclusive) following parent
    /// links; `None` when `destination` is unreachable from `source`.
    pub fn find_path_between(
        &self,
        source: WorkerId,
        destination: WorkerId,
    ) -> Option<Vec<WorkerId>> {
        if !self.nodes.contains_key(&source) || !self.nodes.contains_key(&destination) {
            return None;
        }
        let mut predecessor: HashMap<WorkerId, WorkerId> = HashMap::new();
        let mut queue = VecDeque::from([source]);
        let mut seen = BTreeSet::from([source]);
        while let Some(current) = queue.pop_front() {
            if current == destination {
                let mut path = vec![destination];
                let mut cursor = destination;
                while let Some(prev) = predecessor.get(&cursor) {
                    path.push(*prev);
                    cursor = *prev;
                }
                path.reverse();
                return Some(path);
            }
            if let Some(node) = self.nodes.get(&current) {
                for parent in &node.parents {
                    if seen.insert(*parent) {
                        predecessor.insert(*parent, current);
                        queue.push_back(*parent);
                    }
                }
            }
        }
        None
    }

    /// All nodes on the path between two workers, endpoints included.
    pub fn find_nodes_between(
        &self,
        source: WorkerId,
        destination: WorkerId,
    ) -> Option<Vec<WorkerId>> {
        self.find_path_between(source, destination)
    }

    /// Downstream-closure (ancestors towards the root, self included) with
    /// BFS distances.
    fn ancestors_with_distance(&self, start: WorkerId) -> HashMap<WorkerId, u32> {
        let mut distances = HashMap::from([(start, 0u32)]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let distance = distances[&current];
            if let Some(node) = self.nodes.get(&current) {
                for parent in &node.parents {
                    if !distances.contains_key(parent) {
                        distances.insert(*parent, distance + 1);
                        queue.push_back(*parent);
                    }
                }
            }
        }
        distances
    }

    /// Common downstream ancestors of all `nodes` (each node counts as its
    /// own ancestor), sorted lowest first: by maximum distance from the
    /// inputs, ties towards the smallest worker id.
    pub fn common_ancestors(&self, nodes: &[WorkerId]) -> Vec<(u32, WorkerId)> {
        let mut maps = nodes.iter().map(|n| self.ancestors_with_distance(*n));
        let Some(mut common) = maps.next() else {
            return Vec::new();
        };
        for map in maps {
            common.retain(|node, distance| {
                if let Some(other) = map.get(node) {
                    *distance = (*distance).max(*other);
                    true
                } else {
                    false
                }
            });
        }
        common
            .into_iter()
            .map(|(node, distance)| (distance, node))
            .sorted()
            .collect()
    }

    /// The lowest node reachable downstream from every node in `children`
    /// that can itself reach every node in `parents`. Ties break towards the
    /// smallest worker id.
    pub fn find_common_node_between(
        &self,
        children: &[WorkerId],
        parents: &[WorkerId],
    ) -> Option<WorkerId> {
        self.common_ancestors(children)
            .into_iter()
            .map(|(_, node)| node)
            .find(|node| {
                let reach = self.ancestors_with_distance(*node);
                parents.iter().all(|p| reach.contains_key(p))
            })
    }

    /// Key-value snapshot of the worker table (optional persistence).
    pub fn snapshot(&self) -> BTreeMap<WorkerId, TopologyNode> {
        self.nodes.clone()
    }

    pub fn restore(snapshot: BTreeMap<WorkerId, TopologyNode>, root: Option<WorkerId>) -> Self {
        let next_worker_id = snapshot
            .keys()
            .map(|id| id.raw() + 1)
            .max()
            .unwrap_or(1);
        let by_address = snapshot
            .values()
            .map(|n| ((n.host.clone(), n.grpc_port), n.worker_id))
            .collect();
        Self {
            nodes: snapshot,
            root,
            next_worker_id,
            by_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root(1) <- relay(2) <- {sensor(3), sensor(4)}
    fn diamondless() -> Topology {
        let mut topology = Topology::new();
        let root = topology.register_worker("coord", 8000, 8001, 4);
        let relay = topology.register_worker("relay", 8100, 8101, 2);
        let s1 = topology.register_worker("s1", 8200, 8201, 1);
        let s2 = topology.register_worker("s2", 8300, 8301, 1);
        topology.add_parent(relay, root).unwrap();
        topology.add_parent(s1, relay).unwrap();
        topology.add_parent(s2, relay).unwrap();
        topology
    }

    #[test]
    fn registration_assigns_monotone_ids_and_refreshes_known_hosts() {
        let mut topology = Topology::new();
        let a = topology.register_worker("a", 1, 2, 4);
        let b = topology.register_worker("b", 1, 2, 4);
        assert!(b > a);
        // Same host and grpc port: same id, refreshed slots.
        let again = topology.register_worker("a", 1, 9, 8);
        assert_eq!(again, a);
        assert_eq!(topology.node(a).unwrap().total_slots, 8);
        assert_eq!(topology.node(a).unwrap().data_port, 9);
    }

    #[test]
    fn path_follows_parent_links() {
        let topology = diamondless();
        let path = topology
            .find_path_between(WorkerId(3), WorkerId(1))
            .unwrap();
        assert_eq!(path, vec![WorkerId(3), WorkerId(2), WorkerId(1)]);
        // No path in the downstream-to-upstream direction.
        assert!(topology.find_path_between(WorkerId(1), WorkerId(3)).is_none());
    }

    #[test]
    fn common_node_of_two_sensors_is_the_relay() {
        let topology = diamondless();
        let common = topology
            .find_common_node_between(&[WorkerId(3), WorkerId(4)], &[WorkerId(1)])
            .unwrap();
        assert_eq!(common, WorkerId(2));
    }

    #[test]
    fn slots_are_bounded() {
        let mut topology = diamondless();
        topology.occupy_slot(WorkerId(3)).unwrap();
        assert_eq!(topology.free_slots(WorkerId(3)).unwrap(), 0);
        assert!(matches!(
            topology.occupy_slot(WorkerId(3)),
            Err(MetaError::PlacementFailure { .. })
        ));
        topology.release_slot(WorkerId(3)).unwrap();
        assert_eq!(topology.free_slots(WorkerId(3)).unwrap(), 1);
    }

    #[test]
    fn unregister_detaches_edges() {
        let mut topology = diamondless();
        topology.unregister_worker(WorkerId(2)).unwrap();
        assert!(topology.find_path_between(WorkerId(3), WorkerId(1)).is_none());
        assert!(topology.node(WorkerId(1)).unwrap().children.is_empty());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let topology = diamondless();
        let snapshot = topology.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: BTreeMap<WorkerId, TopologyNode> = serde_json::from_str(&json).unwrap();
        let restored = Topology::restore(decoded, Some(WorkerId(1)));
        assert_eq!(restored.root().unwrap(), WorkerId(1));
        let fresh = restored.snapshot();
        assert_eq!(fresh, snapshot);
        // Ids continue after the highest restored one.
        let mut restored = restored;
        let next = restored.register_worker("new", 1, 2, 3);
        assert_eq!(next, WorkerId(5));
    }
}
