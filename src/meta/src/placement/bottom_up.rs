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

//! Bottom-up placement: walk from the pinned sources towards the sinks and
//! put every operator onto the lowest topology node that can see all of its
//! already-placed upstreams and still has a free slot. Ties break towards
//! the smallest worker id.

use std::collections::BTreeMap;

use nebulastream_common::types::{OperatorId, WorkerId};

use crate::error::{MetaError, Result};
use crate::model::logical_plan::QueryPlan;
use crate::model::topology::Topology;
use crate::placement::{
    placement_region, topological_order, PlacementStrategy, ShadowSlots,
};

pub struct BottomUpStrategy;

impl PlacementStrategy for BottomUpStrategy {
    fn place(
        &self,
        topology: &Topology,
        plan: &QueryPlan,
        pinned_upstream: &[OperatorId],
        pinned_downstream: &[OperatorId],
    ) -> Result<BTreeMap<OperatorId, WorkerId>> {
        let region = placement_region(plan, pinned_upstream, pinned_downstream);
        let order = topological_order(plan, &region)?;

        let mut slots = ShadowSlots::new(topology);
        // Locations of everything relevant, including previously placed
        // operators anchoring an incremental run.
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

            let upstream_locations: Vec<WorkerId> = operator
                .children
                .iter()
                .filter(|c| region.contains(c))
                .map(|c| {
                    locations.get(c).copied().ok_or_else(|| {
                        MetaError::placement(format!("upstream of {operator_id} not yet placed"))
                    })
                })
                .collect::<Result<_>>()?;

            let chosen = if let Some(pinned) = operator.pinned_node_id {
                // Pinned operators (sources, sinks) must sit exactly where
                // they were pinned, and the pin must see every upstream.
                if !topology.contains(pinned) {
                    return Err(MetaError::placement(format!(
                        "pinned node {pinned} is not part of the topology"
                    )));
                }
                for upstream in &upstream_locations {
                    if topology.find_path_between(*upstream, pinned).is_none() {
                        return Err(MetaError::placement(format!(
                            "pinned node {pinned} is unreachable from upstream node {upstream}"
                        )));
                    }
                }
                pinned
            } else if upstream_locations.is_empty() {
                return Err(MetaError::placement(format!(
                    "operator {operator_id} has neither a pin nor placed upstreams"
                )));
            } else {
                // Lowest common node over the upstream locations with a slot
                // left.
                topology
                    .common_ancestors(&upstream_locations)
                    .into_iter()
                    .map(|(_, node)| node)
                    .find(|node| slots.free(*node) > 0)
                    .ok_or_else(|| {
                        MetaError::placement(format!(
                            "no reachable node with capacity for operator {operator_id}"
                        ))
                    })?
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

#[cfg(test)]
mod tests {
    use nebulastream_common::catalog::{DataType, Schema};
    use nebulastream_common::types::QueryId;

    use super::*;
    use crate::model::logical_plan::{Expr, OperatorKind, OperatorState};
    use crate::model::IdGenerator;
    use crate::placement::publish_pins;

    fn schema() -> Schema {
        Schema::empty().with_field("f1", DataType::Int64)
    }

    /// root(1) <- relay(2) <- {s3, s4}
    fn topology(slots: &[u32; 4]) -> Topology {
        let mut topology = Topology::new();
        let root = topology.register_worker("coord", 8000, 8001, slots[0]);
        let relay = topology.register_worker("relay", 8100, 8101, slots[1]);
        let s3 = topology.register_worker("s3", 8200, 8201, slots[2]);
        let s4 = topology.register_worker("s4", 8300, 8301, slots[3]);
        topology.add_parent(relay, root).unwrap();
        topology.add_parent(s3, relay).unwrap();
        topology.add_parent(s4, relay).unwrap();
        topology
    }

    fn pinned_plan(ids: &IdGenerator, source_node: WorkerId, sink_node: WorkerId) -> (QueryPlan, OperatorId, OperatorId, OperatorId) {
        let mut plan = QueryPlan::new(QueryId(1));
        let source = plan.add_operator(
            ids.next_operator_id(),
            OperatorKind::Source {
                logical_source: "cars".into(),
                schema: schema(),
            },
            &[],
        );
        let filter = plan.add_operator(
            ids.next_operator_id(),
            OperatorKind::Filter {
                predicate: Expr::field("f1").eq(Expr::literal(5)),
            },
            &[source],
        );
        let sink = plan.add_operator(
            ids.next_operator_id(),
            OperatorKind::Sink { name: "out".into() },
            &[filter],
        );
        plan.operator_mut(source).unwrap().pinned_node_id = Some(source_node);
        plan.operator_mut(sink).unwrap().pinned_node_id = Some(sink_node);
        (plan, source, filter, sink)
    }

    #[test]
    fn filter_lands_on_the_source_node_when_it_has_capacity() {
        let ids = IdGenerator::new();
        let topology = topology(&[1, 1, 2, 1]);
        let (plan, source, filter, sink) = pinned_plan(&ids, WorkerId(3), WorkerId(1));

        let pins = BottomUpStrategy
            .place(&topology, &plan, &[source], &[sink])
            .unwrap();
        assert_eq!(pins[&source], WorkerId(3));
        assert_eq!(pins[&filter], WorkerId(3));
        assert_eq!(pins[&sink], WorkerId(1));
    }

    #[test]
    fn exhausted_source_node_pushes_the_filter_up() {
        let ids = IdGenerator::new();
        let topology = topology(&[1, 1, 1, 1]);
        let (plan, source, filter, sink) = pinned_plan(&ids, WorkerId(3), WorkerId(1));

        let pins = BottomUpStrategy
            .place(&topology, &plan, &[source], &[sink])
            .unwrap();
        // The source takes s3's only slot, so the filter moves to the relay.
        assert_eq!(pins[&filter], WorkerId(2));
    }

    #[test]
    fn zero_capacity_everywhere_fails_without_partial_annotations() {
        let ids = IdGenerator::new();
        let starved = topology(&[0, 1, 0, 1]);
        let (mut plan, source, _, sink) = pinned_plan(&ids, WorkerId(3), WorkerId(1));

        let result = BottomUpStrategy.place(&starved, &plan, &[source], &[sink]);
        assert!(matches!(result, Err(MetaError::PlacementFailure { .. })));
        // Neither the plan nor the topology carries partial marks.
        assert!(plan.operators().all(|op| !op.placed));
        assert!(plan
            .operators()
            .all(|op| op.state == OperatorState::ToBePlaced));
        assert_eq!(starved.free_slots(WorkerId(2)).unwrap(), 1);

        // A successful run commits through publish_pins.
        let mut healthy = topology(&[1, 1, 1, 1]);
        let pins = BottomUpStrategy
            .place(&healthy, &plan, &[source], &[sink])
            .unwrap();
        publish_pins(&mut healthy, &mut plan, &pins).unwrap();
        assert_eq!(healthy.free_slots(WorkerId(3)).unwrap(), 0);
        assert!(plan.operator(source).unwrap().placed);
    }

    #[test]
    fn unreachable_pinned_sink_fails() {
        let ids = IdGenerator::new();
        // Disconnect the relay from the root.
        let mut topology = topology(&[2, 2, 2, 2]);
        topology.remove_parent(WorkerId(2), WorkerId(1)).unwrap();
        let (plan, source, _, sink) = pinned_plan(&ids, WorkerId(3), WorkerId(1));

        let result = BottomUpStrategy.place(&topology, &plan, &[source], &[sink]);
        assert!(matches!(result, Err(MetaError::PlacementFailure { .. })));
    }
}
