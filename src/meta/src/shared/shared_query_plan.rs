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

//! A shared query plan: several user queries merged over their structurally
//! equivalent prefixes, tracked delta-by-delta in a change log.

use std::collections::{BTreeMap, BTreeSet};

use nebulastream_common::types::{OperatorId, QueryId, SharedQueryId, Timestamp};

use crate::error::{MetaError, Result};
use crate::model::logical_plan::{OperatorState, QueryPlan};
use crate::placement::PlacementStrategyKind;
use crate::shared::change_log::{ChangeLog, ChangeLogEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedQueryPlanStatus {
    Created,
    Processed,
    PartiallyProcessed,
    Stopped,
}

/// How a new query relates to the structure already in a shared plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainmentRelationship {
    Equality,
    LeftContained,
    RightContained,
    NoContainment,
}

/// One matched (host, target) operator pair driving a merge. `host` lives in
/// the shared plan, `target` in the incoming query plan.
#[derive(Clone, Copy, Debug)]
pub struct MatchedOperatorPair {
    pub host: OperatorId,
    pub target: OperatorId,
    pub containment: ContainmentRelationship,
}

pub struct SharedQueryPlan {
    shared_query_id: SharedQueryId,
    plan: QueryPlan,
    query_sinks: BTreeMap<QueryId, BTreeSet<OperatorId>>,
    signature_index: BTreeMap<u64, BTreeSet<OperatorId>>,
    change_log: ChangeLog,
    placement_strategy: PlacementStrategyKind,
    status: SharedQueryPlanStatus,
}

impl SharedQueryPlan {
    /// Wrap the first query of a new shared plan. The merged plan takes the
    /// shared id as its query id.
    pub fn new(
        shared_query_id: SharedQueryId,
        query_id: QueryId,
        plan: &QueryPlan,
        placement_strategy: PlacementStrategyKind,
    ) -> Self {
        let mut merged = plan.clone();
        merged.set_query_id(QueryId(shared_query_id.raw()));

        let sinks: BTreeSet<OperatorId> = merged.root_operators().into_iter().collect();
        let sources: BTreeSet<OperatorId> = merged.leaf_operators().into_iter().collect();

        let mut change_log = ChangeLog::new();
        change_log.add_entry(ChangeLogEntry::new(sources, sinks.clone()));

        let signature_index = Self::index_signatures(&merged);
        Self {
            shared_query_id,
            plan: merged,
            query_sinks: BTreeMap::from([(query_id, sinks)]),
            signature_index,
            change_log,
            placement_strategy,
            status: SharedQueryPlanStatus::Created,
        }
    }

    fn index_signatures(plan: &QueryPlan) -> BTreeMap<u64, BTreeSet<OperatorId>> {
        let mut index: BTreeMap<u64, BTreeSet<OperatorId>> = BTreeMap::new();
        for (id, signature) in plan.signatures() {
            index.entry(signature).or_default().insert(id);
        }
        index
    }

    pub fn shared_query_id(&self) -> SharedQueryId {
        self.shared_query_id
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut QueryPlan {
        &mut self.plan
    }

    pub fn status(&self) -> SharedQueryPlanStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SharedQueryPlanStatus) {
        self.status = status;
    }

    pub fn placement_strategy(&self) -> PlacementStrategyKind {
        self.placement_strategy
    }

    pub fn query_ids(&self) -> Vec<QueryId> {
        self.query_sinks.keys().copied().collect()
    }

    pub fn sinks_of(&self, query_id: QueryId) -> Option<&BTreeSet<OperatorId>> {
        self.query_sinks.get(&query_id)
    }

    pub fn contains_query(&self, query_id: QueryId) -> bool {
        self.query_sinks.contains_key(&query_id)
    }

    pub fn is_empty(&self) -> bool {
        self.query_sinks.is_empty()
    }

    pub fn signature_index(&self) -> &BTreeMap<u64, BTreeSet<OperatorId>> {
        &self.signature_index
    }

    pub fn change_log_entries(&self, before: Timestamp) -> Vec<ChangeLogEntry> {
        self.change_log.entries_before(before)
    }

    pub fn has_pending_changes(&self, before: Timestamp) -> bool {
        self.change_log.has_pending_before(before)
    }

    pub fn update_processed_timestamp(&mut self, timestamp: Timestamp) {
        self.change_log.update_processed_timestamp(timestamp);
    }

    pub fn record_failed_entries(&mut self, entries: Vec<ChangeLogEntry>) {
        self.change_log.record_failed_entries(entries);
    }

    pub fn add_change_log_entry(&mut self, entry: ChangeLogEntry) {
        self.change_log.add_entry(entry);
    }

    /// Merge a new query along its matched operator pairs. The target plan's
    /// exclusive downstream region is copied in (operator ids are globally
    /// unique), target edges below the match are rewired onto the host.
    pub fn add_query(
        &mut self,
        query_id: QueryId,
        target_plan: &QueryPlan,
        matched_pairs: &[MatchedOperatorPair],
    ) -> Result<()> {
        let mut new_sinks: BTreeSet<OperatorId> = BTreeSet::new();

        for pair in matched_pairs {
            let mut entry_upstream = BTreeSet::new();
            let mut entry_downstream = BTreeSet::new();

            match pair.containment {
                ContainmentRelationship::Equality
                | ContainmentRelationship::RightContained => {
                    entry_upstream.insert(pair.host);
                    entry_downstream
                        .extend(self.copy_downstream_of(pair.host, pair.target, target_plan)?);
                }
                ContainmentRelationship::LeftContained => {
                    // The whole shared plan is re-deployed: frontier spans
                    // every source and every sink, old and new.
                    entry_downstream
                        .extend(self.copy_downstream_of(pair.host, pair.target, target_plan)?);
                    entry_upstream.extend(self.plan.leaf_operators());
                    entry_downstream.extend(self.plan.root_operators());
                    for id in self.plan.operator_ids() {
                        let operator = self.plan.operator_mut(id)?;
                        if operator.state == OperatorState::Placed {
                            operator.state = OperatorState::ToBeReplaced;
                        }
                    }
                }
                ContainmentRelationship::NoContainment => continue,
            }

            new_sinks.extend(entry_downstream.iter().copied());
            self.add_change_log_entry(ChangeLogEntry::new(entry_upstream, entry_downstream));
        }

        if new_sinks.is_empty() {
            return Err(MetaError::placement(
                "merge produced no sink for the new query",
            ));
        }
        self.query_sinks.insert(query_id, new_sinks);
        self.signature_index = Self::index_signatures(&self.plan);
        Ok(())
    }

    /// Copy the strict downstream region of `target` from the target plan
    /// into the merged plan, attaching it above `host`. Returns the new root
    /// (sink) operators.
    fn copy_downstream_of(
        &mut self,
        host: OperatorId,
        target: OperatorId,
        target_plan: &QueryPlan,
    ) -> Result<BTreeSet<OperatorId>> {
        let region = target_plan.downstream_of(target);
        let mut roots = BTreeSet::new();

        for id in &region {
            let mut copy = target_plan.operator(*id)?.clone();
            copy.children.retain(|c| region.contains(c) || *c == target);
            for child in copy.children.iter_mut() {
                if *child == target {
                    *child = host;
                }
            }
            copy.parents.retain(|p| region.contains(p));
            copy.placed = false;
            copy.pinned_node_id = None;
            copy.state = OperatorState::ToBePlaced;
            if copy.parents.is_empty() {
                roots.insert(copy.id);
            }
            self.plan.insert_operator(copy);
        }

        for id in &roots {
            self.plan.add_root(*id);
        }
        let direct_parents: Vec<OperatorId> = target_plan
            .operator(target)?
            .parents
            .iter()
            .copied()
            .filter(|p| region.contains(p))
            .collect();
        for parent in direct_parents {
            let host_node = self.plan.operator_mut(host)?;
            if !host_node.parents.contains(&parent) {
                host_node.parents.push(parent);
            }
        }
        Ok(roots)
    }

    /// Remove one query: its sinks and the upstream chain used by nobody
    /// else are marked TO_BE_REMOVED, one change-log entry per sink.
    pub fn remove_query(&mut self, query_id: QueryId) -> Result<()> {
        let sinks = self
            .query_sinks
            .remove(&query_id)
            .ok_or(MetaError::UnknownQuery(query_id))?;

        for sink in sinks {
            let frontier = self.mark_for_removal(sink)?;
            self.plan.remove_as_root(sink);
            self.add_change_log_entry(ChangeLogEntry::new(frontier, BTreeSet::from([sink])));
        }

        if self.query_sinks.is_empty() {
            self.status = SharedQueryPlanStatus::Stopped;
        }
        Ok(())
    }

    /// Walk the exclusive upstream chain of `operator_id`, marking it for
    /// removal. Operators shared with another downstream branch stay and
    /// form the returned upstream frontier.
    fn mark_for_removal(&mut self, operator_id: OperatorId) -> Result<BTreeSet<OperatorId>> {
        self.plan.operator_mut(operator_id)?.state = OperatorState::ToBeRemoved;
        let children = self.plan.operator(operator_id)?.children.clone();
        let mut frontier = BTreeSet::new();
        if children.is_empty() {
            frontier.insert(operator_id);
            return Ok(frontier);
        }
        for child in children {
            let shared = self.plan.operator(child)?.parents.len() > 1;
            if shared {
                frontier.insert(child);
            } else {
                frontier.extend(self.mark_for_removal(child)?);
            }
        }
        Ok(frontier)
    }

    /// Mark everything between the two frontiers for re-placement and log
    /// the delta.
    pub fn mark_for_re_placement(
        &mut self,
        upstream: BTreeSet<OperatorId>,
        downstream: BTreeSet<OperatorId>,
    ) -> Result<()> {
        for id in self.plan.operators_between(&upstream, &downstream) {
            let operator = self.plan.operator_mut(id)?;
            if operator.state == OperatorState::Placed {
                operator.state = OperatorState::ToBeReplaced;
            }
        }
        self.add_change_log_entry(ChangeLogEntry::new(upstream, downstream));
        Ok(())
    }

    /// Drop operators that reached the Removed state from the arena.
    pub fn prune_removed_operators(&mut self) {
        let removed: Vec<OperatorId> = self
            .plan
            .operators()
            .filter(|op| op.state == OperatorState::Removed)
            .map(|op| op.id)
            .collect();
        for id in removed {
            let _ = self.plan.remove_operator(id);
        }
        self.signature_index = Self::index_signatures(&self.plan);
    }
}
