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

//! Top-down placement: descend from the pinned sinks towards the sources.
//! N-ary operators land on the common ancestor of their upstream source
//! locations that can still reach the already-placed downstream operators;
//! when that node is full, the walk moves along the path towards the
//! sources until a node with capacity appears.

use std::collections::BTreeMap;

use nebulastream_common::types::{OperatorId, WorkerId};

use crate::error::{MetaError, Result};
use crate::model::logical_plan::QueryPlan;
use crate::model::topology::Topology;
use crate::placement::{
    placement_region, topological_order, PlacementStrategy, ShadowSlots,
};

pub struct TopDownStrategy;

impl TopDownStrategy {
    /// Locations of the pinned source operators beneath `operator_id`.
    fn upstream_source_locations(
        plan: &QueryPlan,
        operator_id: OperatorId,
    ) -> Result<Vec<WorkerId>> {
        let mut locations = Vec::new();
        for id in plan.upstream_of(operator_id) {
            let operator = plan.operator(id)?;
            if operator.children.is_empty() {
                let pinned = operator.pinned_node_id.ok_or_else(|| {
                    MetaError::placement(format!("source operator {id} is not pinned"))
                })?;
                locations.push(pinned);
            }
        }
        locations.sort_unstable();
        locations.dedup();
        Ok(locations)
    }
}

impl PlacementStrategy for TopDownStrategy {
    fn place(
        &self,
        topology: &Topology,
        plan: &QueryPlan,
        pinned_upstream: &[OperatorId],
        pinned_downstream: &[OperatorId],
    ) -> Result<BTreeMap<OperatorId, WorkerId>> {
        let region = placement_region(plan, pinned_upstream, pinned_downstream);
        // Parents before children.
        let mut order = topological_order(plan, &region)?;
        order.reverse();

        let mut slots = ShadowSlots::new(topology);
        let mut locations: BTreeMap<OperatorId, WorkerId> = BTreeMap::new();
        let mut pins: BTreeMap<OperatorId, WorkerId> = BTreeMap::new();

        for operator_id in order {
            let operator = plan.operator(operator_id)?;

            if operator.placed {
                let pinned = operator.pinned_node_id.ok_or_else(|| {
                    MetaError::placement(format!("placed operator {operator_id} without pin"))
                })?;
                locations.insert(operator_id, pinned);
                continue;
            }

            let downstream_locations: Vec<WorkerId> = operator
                .parents
                .iter()
                .filter(|p| region.contains(p))
                .filter_map(|p| locations.get(p).copied())
                .collect();

            let chosen = if let Some(pinned) = operator.pinned_node_id {
                // Pinned sinks and sources stay put; the pin must reach the
                // already-placed downstream operators.
                for downstream in &downstream_locations {
                    if topology.find_path_between(pinned, *downstream).is_none() {
                        return Err(MetaError::placement(format!(
                            "pinned node {pinned} cannot reach downstream node {downstream}"
                        )));
                    }
                }
                pinned
            } else {
                let source_locations = Self::upstream_source_locations(plan, operator_id)?;
                let is_nary = operator.children.len() > 1 || operator.parents.len() > 1;
                let candidate = if is_nary {
                    topology
                        .find_common_node_between(&source_locations, &downstream_locations)
                        .ok_or_else(|| {
                            MetaError::placement(format!(
                                "no common node for operator {operator_id}"
                            ))
                        })?
                } else {
                    // Unary operators descend: they inherit their parent's
                    // node unless it ran out of slots.
                    downstream_locations.first().copied().ok_or_else(|| {
                        MetaError::placement(format!(
                            "operator {operator_id} has no placed downstream"
                        ))
                    })?
                };

                if slots.free(candidate) > 0 {
                    candidate
                } else {
                    // Walk down the paths from the sources to the candidate
                    // until a node with capacity shows up.
                    let mut fallback = None;
                    'search: for source in &source_locations {
                        if let Some(path) = topology.find_nodes_between(*source, candidate) {
                            for node in path.iter().rev() {
                                if slots.free(*node) > 0 {
                                    fallback = Some(*node);
                                    break 'search;
                                }
                            }
                        }
                    }
                    fallback.ok_or_else(|| {
                        MetaError::placement(format!(
                            "no node with capacity on any path for operator {operator_id}"
                        ))
                    })?
                }
            };

            // Sinks are zero-cost and bypass the slot ledger.
            if !operator.kind.is_sink() {
                slots.occupy(chosen).map_err(|_| {
                    MetaError::placement(format!(
                        "node {chosen} has no capacity for operator {operator_id}"
                    ))
                })?;
            }
            locations.insert(operator_id, chosen);
            pins.insert(operator_id, chosen);
        }

        Ok(pins)
    }
}
