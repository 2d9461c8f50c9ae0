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

//! Decomposition of a fully pinned plan into per-node sub plans.
//!
//! Operators are partitioned by their pinned node. Every logical edge whose
//! endpoints sit on different nodes is cut and stitched back together with a
//! network-sink/network-source pair sharing one fresh `NesPartition`; transit
//! nodes on the topology path that host no logical operator receive bridge
//! (network-source -> network-sink) pairs so every cross-node hop stays
//! explicit.

use std::collections::{BTreeMap, BTreeSet};

use nebulastream_common::types::{
    OperatorId, PlanVersion, QueryId, SharedQueryId, WorkerId,
};
use nebulastream_network::protocol::{NesPartition, NodeLocation};

use crate::error::{MetaError, Result};
use crate::model::execution_plan::DecomposedQueryPlan;
use crate::model::logical_plan::{LogicalOperator, OperatorKind, OperatorState, QueryPlan};
use crate::model::topology::Topology;
use crate::model::IdGenerator;

pub struct Decomposer<'a> {
    topology: &'a Topology,
    ids: &'a IdGenerator,
}

impl<'a> Decomposer<'a> {
    pub fn new(topology: &'a Topology, ids: &'a IdGenerator) -> Self {
        Self { topology, ids }
    }

    fn location_of(&self, worker_id: WorkerId) -> Result<NodeLocation> {
        let node = self.topology.node(worker_id)?;
        Ok(NodeLocation {
            worker_id,
            host: node.host.clone(),
            data_port: node.data_port,
        })
    }

    /// Split the pinned `region` of `plan` into one sub plan per node and
    /// insert the network pairs for every cross-node edge.
    pub fn decompose(
        &self,
        shared_query_id: SharedQueryId,
        plan: &QueryPlan,
        region: &BTreeSet<OperatorId>,
        version: PlanVersion,
    ) -> Result<Vec<DecomposedQueryPlan>> {
        let mut sub_plans: BTreeMap<WorkerId, DecomposedQueryPlan> = BTreeMap::new();
        let mut node_of: BTreeMap<OperatorId, WorkerId> = BTreeMap::new();

        // 1. Partition the region by pinned node; edges are re-established
        //    only between operators of the same node.
        for operator_id in region {
            let operator = plan.operator(*operator_id)?;
            let worker_id = operator.pinned_node_id.ok_or_else(|| {
                MetaError::placement(format!("operator {operator_id} is not pinned"))
            })?;
            node_of.insert(*operator_id, worker_id);
            let sub_plan = sub_plans.entry(worker_id).or_insert_with(|| {
                DecomposedQueryPlan::new(
                    self.ids.next_sub_plan_id(),
                    shared_query_id,
                    worker_id,
                    version,
                )
            });
            let mut copy = operator.clone();
            copy.children.retain(|c| {
                region.contains(c)
                    && plan
                        .operator(*c)
                        .map(|op| op.pinned_node_id == Some(worker_id))
                        .unwrap_or(false)
            });
            copy.parents.retain(|p| {
                region.contains(p)
                    && plan
                        .operator(*p)
                        .map(|op| op.pinned_node_id == Some(worker_id))
                        .unwrap_or(false)
            });
            sub_plan.operators.insert(*operator_id, copy);
        }

        // 2. Stitch every cross-node edge with network pairs, bridging over
        //    transit nodes.
        for upstream_id in region {
            let upstream = plan.operator(*upstream_id)?;
            let upstream_node = node_of[upstream_id];
            for downstream_id in &upstream.parents {
                if !region.contains(downstream_id) {
                    continue;
                }
                let downstream_node = node_of[downstream_id];
                if upstream_node == downstream_node {
                    continue;
                }
                self.link_edge(
                    shared_query_id,
                    plan,
                    &mut sub_plans,
                    version,
                    *upstream_id,
                    upstream_node,
                    *downstream_id,
                    downstream_node,
                )?;
            }
        }

        // 3. Roots are the operators nothing downstream consumes locally.
        let mut plans: Vec<DecomposedQueryPlan> = sub_plans.into_values().collect();
        for sub_plan in &mut plans {
            sub_plan.roots = sub_plan
                .operators
                .values()
                .filter(|op| op.parents.is_empty())
                .map(|op| op.id)
                .collect();
        }
        Ok(plans)
    }

    #[allow(clippy::too_many_arguments)]
    fn link_edge(
        &self,
        shared_query_id: SharedQueryId,
        plan: &QueryPlan,
        sub_plans: &mut BTreeMap<WorkerId, DecomposedQueryPlan>,
        version: PlanVersion,
        upstream_id: OperatorId,
        upstream_node: WorkerId,
        downstream_id: OperatorId,
        downstream_node: WorkerId,
    ) -> Result<()> {
        let path = self
            .topology
            .find_nodes_between(upstream_node, downstream_node)
            .ok_or_else(|| {
                MetaError::placement(format!(
                    "no topology path from {upstream_node} to {downstream_node}"
                ))
            })?;

        let schema = plan.output_schema(upstream_id).unwrap_or_default();
        let query_id = QueryId(shared_query_id.raw());

        // One partition per hop; the pair on both ends of a hop shares it.
        let partitions: Vec<NesPartition> = (1..path.len())
            .map(|hop| {
                NesPartition::new(
                    query_id,
                    self.ids.next_operator_id(),
                    0,
                    hop as u32 - 1,
                )
            })
            .collect();

        // Sending half on the upstream node.
        let first_sink_id = self.ids.next_operator_id();
        {
            let sub_plan = sub_plans.get_mut(&upstream_node).expect("partitioned above");
            let sink = LogicalOperator {
                id: first_sink_id,
                kind: OperatorKind::NetworkSink {
                    partition: partitions[0],
                    destination: self.location_of(path[1])?,
                },
                children: vec![upstream_id],
                parents: Vec::new(),
                pinned_node_id: Some(upstream_node),
                placed: true,
                state: OperatorState::Placed,
            };
            sub_plan
                .operators
                .get_mut(&upstream_id)
                .expect("partitioned above")
                .parents
                .push(first_sink_id);
            sub_plan.operators.insert(first_sink_id, sink);
        }

        // Bridges on the transit nodes.
        for hop in 1..path.len() - 1 {
            let node = path[hop];
            let sub_plan = sub_plans.entry(node).or_insert_with(|| {
                DecomposedQueryPlan::new(
                    self.ids.next_sub_plan_id(),
                    shared_query_id,
                    node,
                    version,
                )
            });
            let source_id = self.ids.next_operator_id();
            let sink_id = self.ids.next_operator_id();
            sub_plan.operators.insert(
                source_id,
                LogicalOperator {
                    id: source_id,
                    kind: OperatorKind::NetworkSource {
                        partition: partitions[hop - 1],
                        schema: schema.clone(),
                    },
                    children: Vec::new(),
                    parents: vec![sink_id],
                    pinned_node_id: Some(node),
                    placed: true,
                    state: OperatorState::Placed,
                },
            );
            sub_plan.operators.insert(
                sink_id,
                LogicalOperator {
                    id: sink_id,
                    kind: OperatorKind::NetworkSink {
                        partition: partitions[hop],
                        destination: self.location_of(path[hop + 1])?,
                    },
                    children: vec![source_id],
                    parents: Vec::new(),
                    pinned_node_id: Some(node),
                    placed: true,
                    state: OperatorState::Placed,
                },
            );
        }

        // Receiving half on the downstream node.
        let last_source_id = self.ids.next_operator_id();
        {
            let sub_plan = sub_plans
                .get_mut(&downstream_node)
                .expect("partitioned above");
            sub_plan.operators.insert(
                last_source_id,
                LogicalOperator {
                    id: last_source_id,
                    kind: OperatorKind::NetworkSource {
                        partition: *partitions.last().expect("at least one hop"),
                        schema,
                    },
                    children: Vec::new(),
                    parents: vec![downstream_id],
                    pinned_node_id: Some(downstream_node),
                    placed: true,
                    state: OperatorState::Placed,
                },
            );
            sub_plan
                .operators
                .get_mut(&downstream_id)
                .expect("partitioned above")
                .children
                .push(last_source_id);
        }

        Ok(())
    }
}
