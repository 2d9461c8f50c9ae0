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

//! Operator placement onto the topology.
//!
//! Strategies consume pinned upstream operators (sources) and pinned
//! downstream operators (sinks) and produce a pin per not-yet-placed
//! operator in between. They work on a shadow slot ledger and never touch
//! the plan or the topology; pins are published only when the whole region
//! placed successfully, so a failure leaves no partial annotations behind.

pub mod bottom_up;
pub mod decomposer;
pub mod top_down;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use nebulastream_common::types::{OperatorId, WorkerId};

use crate::error::{MetaError, Result};
use crate::model::logical_plan::{OperatorState, QueryPlan};
use crate::model::topology::Topology;

pub use bottom_up::BottomUpStrategy;
pub use top_down::TopDownStrategy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStrategyKind {
    #[default]
    BottomUp,
    TopDown,
    /// Pluggable optimizer-based alternative; honors the same inputs and
    /// outputs as the canonical strategies.
    Ilp,
}

pub trait PlacementStrategy: Send + Sync {
    /// Compute pins for every not-yet-placed operator between the two pinned
    /// frontiers. Never partially commits.
    fn place(
        &self,
        topology: &Topology,
        plan: &QueryPlan,
        pinned_upstream: &[OperatorId],
        pinned_downstream: &[OperatorId],
    ) -> Result<BTreeMap<OperatorId, WorkerId>>;
}

pub fn strategy_for(kind: PlacementStrategyKind) -> Box<dyn PlacementStrategy> {
    match kind {
        PlacementStrategyKind::BottomUp => Box::new(BottomUpStrategy),
        PlacementStrategyKind::TopDown => Box::new(TopDownStrategy),
        // The ILP backend plugs in here; until then its plans place like
        // BottomUp.
        PlacementStrategyKind::Ilp => Box::new(BottomUpStrategy),
    }
}

/// Capacity ledger over an untouched topology.
pub(crate) struct ShadowSlots<'a> {
    topology: &'a Topology,
    used: BTreeMap<WorkerId, u32>,
}

impl<'a> ShadowSlots<'a> {
    pub(crate) fn new(topology: &'a Topology) -> Self {
        Self {
            topology,
            used: BTreeMap::new(),
        }
    }

    pub(crate) fn free(&self, worker: WorkerId) -> u32 {
        let used = self.used.get(&worker).copied().unwrap_or(0);
        self.topology
            .node(worker)
            .map(|n| n.free_slots().saturating_sub(used))
            .unwrap_or(0)
    }

    pub(crate) fn occupy(&mut self, worker: WorkerId) -> Result<()> {
        if self.free(worker) == 0 {
            return Err(MetaError::placement(format!(
                "no free slot on worker {worker}"
            )));
        }
        *self.used.entry(worker).or_default() += 1;
        Ok(())
    }
}

/// Operators of the region in children-before-parents order.
pub(crate) fn topological_order(
    plan: &QueryPlan,
    region: &BTreeSet<OperatorId>,
) -> Result<Vec<OperatorId>> {
    let mut in_degree: BTreeMap<OperatorId, usize> = BTreeMap::new();
    for id in region {
        let node = plan.operator(*id)?;
        let degree = node.children.iter().filter(|c| region.contains(c)).count();
        in_degree.insert(*id, degree);
    }
    let mut queue: VecDeque<OperatorId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(region.len());
    while let Some(current) = queue.pop_front() {
        order.push(current);
        for parent in &plan.operator(current)?.parents {
            if let Some(degree) = in_degree.get_mut(parent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*parent);
                }
            }
        }
    }
    if order.len() != region.len() {
        return Err(MetaError::placement("cycle in placement region"));
    }
    Ok(order)
}

/// Apply computed pins: annotate the plan, decrement topology slots. Sinks
/// are zero-cost; they never consume a slot.
pub fn publish_pins(
    topology: &mut Topology,
    plan: &mut QueryPlan,
    pins: &BTreeMap<OperatorId, WorkerId>,
) -> Result<()> {
    for (operator_id, worker_id) in pins {
        if !plan.operator(*operator_id)?.kind.is_sink() {
            topology.occupy_slot(*worker_id)?;
        }
        let operator = plan.operator_mut(*operator_id)?;
        operator.pinned_node_id = Some(*worker_id);
        operator.placed = true;
        operator.state = OperatorState::Placed;
    }
    Ok(())
}

/// The region a strategy works on: everything between the frontiers that
/// still needs placement, plus the already-placed anchors.
pub(crate) fn placement_region(
    plan: &QueryPlan,
    pinned_upstream: &[OperatorId],
    pinned_downstream: &[OperatorId],
) -> BTreeSet<OperatorId> {
    let upstream: BTreeSet<OperatorId> = pinned_upstream.iter().copied().collect();
    let downstream: BTreeSet<OperatorId> = pinned_downstream.iter().copied().collect();
    plan.operators_between(&upstream, &downstream)
}
