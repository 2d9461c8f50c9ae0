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

//! The global execution plan: per-node sub plan assignments with
//! parent/child links between execution nodes, plus a JSON view for
//! observability.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use nebulastream_common::types::{
    OperatorId, PlanVersion, QuerySubPlanId, SharedQueryId, WorkerId,
};

use crate::error::{MetaError, Result};
use crate::model::logical_plan::LogicalOperator;

/// One per-node slice of a placed shared query: an operator arena plus its
/// roots, shipped to the worker as the DeployQuery payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecomposedQueryPlan {
    pub plan_id: QuerySubPlanId,
    pub shared_query_id: SharedQueryId,
    pub worker_id: WorkerId,
    pub version: PlanVersion,
    pub operators: BTreeMap<OperatorId, LogicalOperator>,
    pub roots: Vec<OperatorId>,
}

impl DecomposedQueryPlan {
    pub fn new(
        plan_id: QuerySubPlanId,
        shared_query_id: SharedQueryId,
        worker_id: WorkerId,
        version: PlanVersion,
    ) -> Self {
        Self {
            plan_id,
            shared_query_id,
            worker_id,
            version,
            operators: BTreeMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn contains_operator(&self, id: OperatorId) -> bool {
        self.operators.contains_key(&id)
    }

    pub fn operator_ids(&self) -> BTreeSet<OperatorId> {
        self.operators.keys().copied().collect()
    }

    pub fn serialize(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn deserialize(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
struct ExecutionNode {
    worker_id: WorkerId,
    sub_plans: BTreeMap<SharedQueryId, Vec<DecomposedQueryPlan>>,
    parents: BTreeSet<WorkerId>,
    children: BTreeSet<WorkerId>,
}

#[derive(Default)]
struct GlobalExecutionPlanInner {
    nodes: BTreeMap<WorkerId, ExecutionNode>,
    query_index: BTreeMap<SharedQueryId, BTreeSet<WorkerId>>,
}

/// All per-node assignments, guarded by a single writer lock. The amendment
/// phase holds the lock for the duration of one change-log entry.
#[derive(Default)]
pub struct GlobalExecutionPlan {
    inner: RwLock<GlobalExecutionPlanInner>,
}

impl GlobalExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_execution_node(&self, worker_id: WorkerId) {
        let mut inner = self.inner.write();
        inner.nodes.entry(worker_id).or_insert_with(|| ExecutionNode {
            worker_id,
            ..Default::default()
        });
    }

    pub fn has_execution_node(&self, worker_id: WorkerId) -> bool {
        self.inner.read().nodes.contains_key(&worker_id)
    }

    /// Register `parent` as downstream of `child`, creating both nodes if
    /// needed.
    pub fn add_as_parent(&self, child: WorkerId, parent: WorkerId) {
        let mut inner = self.inner.write();
        inner.nodes.entry(child).or_insert_with(|| ExecutionNode {
            worker_id: child,
            ..Default::default()
        });
        inner.nodes.entry(parent).or_insert_with(|| ExecutionNode {
            worker_id: parent,
            ..Default::default()
        });
        inner
            .nodes
            .get_mut(&child)
            .expect("inserted above")
            .parents
            .insert(parent);
        inner
            .nodes
            .get_mut(&parent)
            .expect("inserted above")
            .children
            .insert(child);
    }

    pub fn add_sub_plan(&self, sub_plan: DecomposedQueryPlan) {
        let mut inner = self.inner.write();
        let worker_id = sub_plan.worker_id;
        let shared_query_id = sub_plan.shared_query_id;
        inner.nodes.entry(worker_id).or_insert_with(|| ExecutionNode {
            worker_id,
            ..Default::default()
        });
        inner
            .nodes
            .get_mut(&worker_id)
            .expect("inserted above")
            .sub_plans
            .entry(shared_query_id)
            .or_default()
            .push(sub_plan);
        inner
            .query_index
            .entry(shared_query_id)
            .or_default()
            .insert(worker_id);
    }

    pub fn sub_plans(
        &self,
        worker_id: WorkerId,
        shared_query_id: SharedQueryId,
    ) -> Vec<DecomposedQueryPlan> {
        self.inner
            .read()
            .nodes
            .get(&worker_id)
            .and_then(|node| node.sub_plans.get(&shared_query_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Every sub plan of a shared query, across all nodes.
    pub fn sub_plans_for_query(&self, shared_query_id: SharedQueryId) -> Vec<DecomposedQueryPlan> {
        let inner = self.inner.read();
        let Some(workers) = inner.query_index.get(&shared_query_id) else {
            return Vec::new();
        };
        workers
            .iter()
            .filter_map(|w| inner.nodes.get(w))
            .flat_map(|node| {
                node.sub_plans
                    .get(&shared_query_id)
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn workers_for_query(&self, shared_query_id: SharedQueryId) -> BTreeSet<WorkerId> {
        self.inner
            .read()
            .query_index
            .get(&shared_query_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_sub_plan(
        &self,
        worker_id: WorkerId,
        shared_query_id: SharedQueryId,
        plan_id: QuerySubPlanId,
    ) -> Result<DecomposedQueryPlan> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&worker_id)
            .ok_or(MetaError::UnknownWorker(worker_id))?;
        let plans = node
            .sub_plans
            .get_mut(&shared_query_id)
            .ok_or(MetaError::UnknownSharedQuery(shared_query_id))?;
        let position = plans
            .iter()
            .position(|p| p.plan_id == plan_id)
            .ok_or(MetaError::UnknownSharedQuery(shared_query_id))?;
        let removed = plans.remove(position);
        if plans.is_empty() {
            node.sub_plans.remove(&shared_query_id);
            if let Some(workers) = inner.query_index.get_mut(&shared_query_id) {
                workers.remove(&worker_id);
                if workers.is_empty() {
                    inner.query_index.remove(&shared_query_id);
                }
            }
        }
        Ok(removed)
    }

    /// Remove every sub plan of a query, returning them grouped by worker.
    pub fn remove_query(
        &self,
        shared_query_id: SharedQueryId,
    ) -> BTreeMap<WorkerId, Vec<DecomposedQueryPlan>> {
        let mut inner = self.inner.write();
        let workers = inner
            .query_index
            .remove(&shared_query_id)
            .unwrap_or_default();
        let mut removed = BTreeMap::new();
        for worker in workers {
            if let Some(node) = inner.nodes.get_mut(&worker) {
                if let Some(plans) = node.sub_plans.remove(&shared_query_id) {
                    removed.insert(worker, plans);
                }
            }
        }
        removed
    }

    /// Structure-only JSON view for observability.
    pub fn as_json(&self) -> serde_json::Value {
        let inner = self.inner.read();
        let nodes: Vec<serde_json::Value> = inner
            .nodes
            .values()
            .map(|node| {
                serde_json::json!({
                    "worker_id": node.worker_id,
                    "parents": node.parents,
                    "children": node.children,
                    "sub_plans": node
                        .sub_plans
                        .iter()
                        .map(|(query, plans)| {
                            serde_json::json!({
                                "shared_query_id": query,
                                "plans": plans
                                    .iter()
                                    .map(|p| {
                                        serde_json::json!({
                                            "plan_id": p.plan_id,
                                            "version": p.version,
                                            "operators": p
                                                .operators
                                                .values()
                                                .map(|op| format!("{}({})", op.kind.name(), op.id))
                                                .collect::<Vec<_>>(),
                                        })
                                    })
                                    .collect::<Vec<_>>(),
                            })
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::json!({ "execution_nodes": nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_plan(worker: u32, query: u32, plan: u32) -> DecomposedQueryPlan {
        DecomposedQueryPlan::new(
            QuerySubPlanId(plan),
            SharedQueryId(query),
            WorkerId(worker),
            1,
        )
    }

    #[test]
    fn add_and_query_sub_plans() {
        let global = GlobalExecutionPlan::new();
        global.add_sub_plan(sub_plan(1, 10, 100));
        global.add_sub_plan(sub_plan(2, 10, 101));
        global.add_sub_plan(sub_plan(2, 11, 102));

        assert_eq!(global.sub_plans(WorkerId(2), SharedQueryId(10)).len(), 1);
        assert_eq!(global.sub_plans_for_query(SharedQueryId(10)).len(), 2);
        assert_eq!(
            global.workers_for_query(SharedQueryId(10)),
            BTreeSet::from([WorkerId(1), WorkerId(2)])
        );
    }

    #[test]
    fn parent_links_are_bidirectional() {
        let global = GlobalExecutionPlan::new();
        global.add_as_parent(WorkerId(2), WorkerId(1));
        let json = global.as_json();
        let nodes = json["execution_nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn remove_sub_plan_cleans_the_index() {
        let global = GlobalExecutionPlan::new();
        global.add_sub_plan(sub_plan(1, 10, 100));
        let removed = global
            .remove_sub_plan(WorkerId(1), SharedQueryId(10), QuerySubPlanId(100))
            .unwrap();
        assert_eq!(removed.plan_id, QuerySubPlanId(100));
        assert!(global.workers_for_query(SharedQueryId(10)).is_empty());
        assert!(global
            .remove_sub_plan(WorkerId(1), SharedQueryId(10), QuerySubPlanId(100))
            .is_err());
    }

    #[test]
    fn deploy_payload_round_trip() {
        let plan = sub_plan(3, 9, 42);
        let bytes = plan.serialize().unwrap();
        let back = DecomposedQueryPlan::deserialize(&bytes).unwrap();
        assert_eq!(back, plan);
    }
}
