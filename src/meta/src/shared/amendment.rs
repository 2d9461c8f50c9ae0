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

//! Placement amendment: replay the pending change-log entries of a shared
//! plan in timestamp order — the removal half before the addition half of
//! each entry — then reconcile the global execution plan against the merged
//! plan and emit deduplicated deployment contexts.
//!
//! A failing entry is recorded and retried by a later pass; the remaining
//! entries are still attempted and the plan is marked PartiallyProcessed.

use std::collections::{BTreeMap, BTreeSet};

use nebulastream_common::types::{OperatorId, PlanVersion, QuerySubPlanId, WorkerId};
use nebulastream_common::util::current_time_micros;

use crate::error::{MetaError, Result};
use crate::model::execution_plan::{DecomposedQueryPlan, GlobalExecutionPlan};
use crate::model::logical_plan::{OperatorState, QueryPlan};
use crate::model::topology::Topology;
use crate::model::IdGenerator;
use crate::placement::decomposer::Decomposer;
use crate::placement::{publish_pins, strategy_for};
use crate::shared::change_log::ChangeLogEntry;
use crate::shared::shared_query_plan::{SharedQueryPlan, SharedQueryPlanStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentAction {
    Deploy,
    Undeploy,
    Update,
}

/// Per-node amendment result handed to the deployment service.
#[derive(Clone, Debug)]
pub struct DeploymentContext {
    pub worker_id: WorkerId,
    pub plan_id: QuerySubPlanId,
    pub version: PlanVersion,
    pub action: DeploymentAction,
    pub sub_plan: DecomposedQueryPlan,
}

pub struct PlacementAmendmentPhase;

impl PlacementAmendmentPhase {
    pub fn new() -> Self {
        Self
    }

    /// Process every pending change-log entry of `shared` and reconcile the
    /// per-node sub plans. The caller serializes access to topology and
    /// global plan around the call.
    pub fn execute(
        &self,
        ids: &IdGenerator,
        topology: &mut Topology,
        global: &GlobalExecutionPlan,
        shared: &mut SharedQueryPlan,
    ) -> Vec<DeploymentContext> {
        let now = current_time_micros();
        let entries = shared.change_log_entries(now);
        if entries.is_empty() {
            // Double amendment of an empty change-log set is a no-op.
            return Vec::new();
        }

        let mut contexts: BTreeMap<(WorkerId, QuerySubPlanId), DeploymentContext> = BTreeMap::new();
        let mut failed: Vec<ChangeLogEntry> = Vec::new();

        for entry in entries {
            match self.process_entry(ids, topology, global, shared, &entry) {
                Ok(entry_contexts) => {
                    for context in entry_contexts {
                        contexts.insert((context.worker_id, context.plan_id), context);
                    }
                }
                Err(error) => {
                    tracing::error!(
                        shared_query_id = %shared.shared_query_id(),
                        %error,
                        "change-log entry failed; recording for retry",
                    );
                    shared.set_status(SharedQueryPlanStatus::PartiallyProcessed);
                    failed.push(entry);
                }
            }
        }

        // Reconcile the per-node sub plans with everything placed so far.
        let mut reconcile_failed = false;
        match self.reconcile_deployment(ids, topology, global, shared) {
            Ok(reconcile_contexts) => {
                for context in reconcile_contexts {
                    contexts.insert((context.worker_id, context.plan_id), context);
                }
            }
            Err(error) => {
                tracing::error!(
                    shared_query_id = %shared.shared_query_id(),
                    %error,
                    "deployment reconciliation failed",
                );
                reconcile_failed = true;
            }
        }

        shared.update_processed_timestamp(now);
        shared.prune_removed_operators();
        if !failed.is_empty() || reconcile_failed {
            shared.set_status(SharedQueryPlanStatus::PartiallyProcessed);
            shared.record_failed_entries(failed);
        } else if shared.status() != SharedQueryPlanStatus::Stopped {
            // A clean pass also clears an earlier PartiallyProcessed flag.
            shared.set_status(SharedQueryPlanStatus::Processed);
        }

        contexts.into_values().collect()
    }

    /// One change-log entry: undeploy the sub plans touched by operators
    /// marked for removal/replacement, then compute pins for everything in
    /// the region still waiting for placement.
    fn process_entry(
        &self,
        ids: &IdGenerator,
        topology: &mut Topology,
        global: &GlobalExecutionPlan,
        shared: &mut SharedQueryPlan,
        entry: &ChangeLogEntry,
    ) -> Result<Vec<DeploymentContext>> {
        let shared_id = shared.shared_query_id();
        let mut contexts = Vec::new();

        let upstream = active_frontier(shared.plan(), &entry.upstream);
        let downstream = active_frontier(shared.plan(), &entry.downstream);

        // Un-pinned sinks land on the topology root.
        let root = topology.root()?;
        for id in &downstream {
            let operator = shared.plan_mut().operator_mut(*id)?;
            if operator.kind.is_sink() && operator.pinned_node_id.is_none() {
                operator.pinned_node_id = Some(root);
            }
        }
        for id in upstream.iter().chain(downstream.iter()) {
            let operator = shared.plan().operator(*id)?;
            if (operator.children.is_empty() || operator.kind.is_sink())
                && operator.pinned_node_id.is_none()
            {
                return Err(MetaError::placement(format!(
                    "frontier operator {id} is not pinned"
                )));
            }
        }

        let region = shared.plan().operators_between(&upstream, &downstream);

        // --- removal half -------------------------------------------------
        let to_remove: BTreeSet<OperatorId> = region
            .iter()
            .filter(|id| {
                shared
                    .plan()
                    .operator(**id)
                    .map(|op| {
                        matches!(
                            op.state,
                            OperatorState::ToBeRemoved | OperatorState::ToBeReplaced
                        )
                    })
                    .unwrap_or(false)
            })
            .copied()
            .collect();

        let mut collateral: BTreeSet<OperatorId> = BTreeSet::new();
        if !to_remove.is_empty() {
            let version = ids.next_version();
            for worker in global.workers_for_query(shared_id) {
                for sub_plan in global.sub_plans(worker, shared_id) {
                    if sub_plan.operator_ids().is_disjoint(&to_remove) {
                        continue;
                    }
                    global.remove_sub_plan(worker, shared_id, sub_plan.plan_id)?;
                    // Give the slots back; the surviving operators of this
                    // sub plan must be placed and deployed again.
                    for operator_id in sub_plan.operator_ids() {
                        let Ok(operator) = shared.plan_mut().operator_mut(operator_id) else {
                            continue; // network operator, not in the arena
                        };
                        if !operator.kind.is_sink() {
                            topology.release_slot(worker)?;
                        }
                        if operator.state == OperatorState::Placed {
                            operator.state = OperatorState::ToBePlaced;
                            operator.placed = false;
                            collateral.insert(operator_id);
                        }
                    }
                    contexts.push(DeploymentContext {
                        worker_id: worker,
                        plan_id: sub_plan.plan_id,
                        version,
                        action: DeploymentAction::Undeploy,
                        sub_plan,
                    });
                }
            }
            for operator_id in &to_remove {
                let operator = shared.plan_mut().operator_mut(*operator_id)?;
                match operator.state {
                    OperatorState::ToBeRemoved => operator.state = OperatorState::Removed,
                    OperatorState::ToBeReplaced => {
                        operator.state = OperatorState::ToBePlaced;
                        operator.placed = false;
                        collateral.insert(*operator_id);
                    }
                    _ => {}
                }
            }
        }

        // --- addition half ------------------------------------------------
        // Frontiers grow to cover collateral operators whose sub plans were
        // just undeployed: their leaves anchor upstream, surviving roots
        // above them anchor downstream.
        let mut place_upstream = active_frontier(shared.plan(), &upstream);
        let mut place_downstream = active_frontier(shared.plan(), &downstream);
        for operator_id in &collateral {
            if shared.plan().operator(*operator_id)?.children.is_empty() {
                place_upstream.insert(*operator_id);
            }
        }
        if !collateral.is_empty() {
            for root in shared.plan().root_operators() {
                let root_op = shared.plan().operator(root)?;
                if root_op.state == OperatorState::Removed {
                    continue;
                }
                if collateral.contains(&root)
                    || shared
                        .plan()
                        .upstream_of(root)
                        .iter()
                        .any(|up| collateral.contains(up))
                {
                    place_downstream.insert(root);
                }
            }
        }

        let placement_region = shared
            .plan()
            .operators_between(&place_upstream, &place_downstream);
        let needs_placement = placement_region.iter().any(|id| {
            shared
                .plan()
                .operator(*id)
                .map(|op| op.state == OperatorState::ToBePlaced)
                .unwrap_or(false)
        });

        if needs_placement {
            let strategy = strategy_for(shared.placement_strategy());
            let upstream_vec: Vec<OperatorId> = place_upstream.iter().copied().collect();
            let downstream_vec: Vec<OperatorId> = place_downstream.iter().copied().collect();
            let pins = strategy.place(topology, shared.plan(), &upstream_vec, &downstream_vec)?;
            publish_pins(topology, shared.plan_mut(), &pins)?;
        }

        Ok(contexts)
    }

    /// Re-decompose everything placed and supersede the sub plans whose
    /// shape changed. Unchanged sub plans stay untouched; workers dropping
    /// out entirely were already covered by the removal half.
    fn reconcile_deployment(
        &self,
        ids: &IdGenerator,
        topology: &Topology,
        global: &GlobalExecutionPlan,
        shared: &mut SharedQueryPlan,
    ) -> Result<Vec<DeploymentContext>> {
        let shared_id = shared.shared_query_id();
        let placed: BTreeSet<OperatorId> = shared
            .plan()
            .operators()
            .filter(|op| op.state == OperatorState::Placed)
            .map(|op| op.id)
            .collect();
        if placed.is_empty() {
            return Ok(Vec::new());
        }

        let version = ids.next_version();
        let decomposer = Decomposer::new(topology, ids);
        let sub_plans = decomposer.decompose(shared_id, shared.plan(), &placed, version)?;

        let mut contexts = Vec::new();
        for sub_plan in sub_plans {
            let worker = sub_plan.worker_id;
            let existing = global.sub_plans(worker, shared_id);
            let matching = existing
                .iter()
                .find(|old| shape_signature(old) == shape_signature(&sub_plan));
            if matching.is_some() {
                // Same operators, same cross-node fan: nothing to re-deploy.
                continue;
            }
            let had_plans = !existing.is_empty();
            for old in existing {
                global.remove_sub_plan(worker, shared_id, old.plan_id)?;
            }
            global.add_sub_plan(sub_plan.clone());
            contexts.push(DeploymentContext {
                worker_id: worker,
                plan_id: sub_plan.plan_id,
                version,
                action: if had_plans {
                    DeploymentAction::Update
                } else {
                    DeploymentAction::Deploy
                },
                sub_plan,
            });
        }
        Ok(contexts)
    }
}

impl Default for PlacementAmendmentPhase {
    fn default() -> Self {
        Self::new()
    }
}

/// Frontier operators that have not been removed.
fn active_frontier(plan: &QueryPlan, frontier: &BTreeSet<OperatorId>) -> BTreeSet<OperatorId> {
    frontier
        .iter()
        .filter(|id| {
            plan.operator(**id)
                .map(|op| op.state != OperatorState::Removed)
                .unwrap_or(false)
        })
        .copied()
        .collect()
}

/// Deployment-relevant shape of a sub plan: its logical operators plus how
/// many network halves it carries. Network operator ids are freshly minted
/// on every decomposition, so they cannot be compared directly.
fn shape_signature(sub_plan: &DecomposedQueryPlan) -> (Vec<OperatorId>, usize, usize) {
    let mut logical = Vec::new();
    let mut sources = 0;
    let mut sinks = 0;
    for operator in sub_plan.operators.values() {
        match &operator.kind {
            crate::model::logical_plan::OperatorKind::NetworkSource { .. } => sources += 1,
            crate::model::logical_plan::OperatorKind::NetworkSink { .. } => sinks += 1,
            _ => logical.push(operator.id),
        }
    }
    logical.sort_unstable();
    (logical, sources, sinks)
}
