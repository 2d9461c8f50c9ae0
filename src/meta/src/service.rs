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

//! The coordinator: owns topology, catalog, shared query plans and the
//! global execution plan, serves the coordinator half of the control plane,
//! and turns submitted queries into per-node deployment contexts.

use parking_lot::Mutex;

use nebulastream_common::catalog::Schema;
use nebulastream_common::types::{QueryId, SharedQueryId, WorkerId};
use nebulastream_network::rpc::{
    ControlReply, ControlService, RegisterNodeRequest, RegisterPhysicalSourceRequest,
    ReplyPayload,
};

use crate::catalog::{PhysicalSource, SourceCatalog};
use crate::error::{MetaError, Result};
use crate::model::execution_plan::GlobalExecutionPlan;
use crate::model::logical_plan::{OperatorKind, QueryPlan};
use crate::model::topology::Topology;
use crate::model::IdGenerator;
use crate::placement::PlacementStrategyKind;
use crate::shared::{DeploymentContext, GlobalQueryPlan, PlacementAmendmentPhase};

pub struct Coordinator {
    ids: IdGenerator,
    topology: Mutex<Topology>,
    catalog: Mutex<SourceCatalog>,
    query_plans: Mutex<GlobalQueryPlan>,
    execution_plan: GlobalExecutionPlan,
    amendment: PlacementAmendmentPhase,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            ids: IdGenerator::new(),
            topology: Mutex::new(Topology::new()),
            catalog: Mutex::new(SourceCatalog::new()),
            query_plans: Mutex::new(GlobalQueryPlan::new()),
            execution_plan: GlobalExecutionPlan::new(),
            amendment: PlacementAmendmentPhase::new(),
        }
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn topology(&self) -> &Mutex<Topology> {
        &self.topology
    }

    pub fn catalog(&self) -> &Mutex<SourceCatalog> {
        &self.catalog
    }

    pub fn execution_plan(&self) -> &GlobalExecutionPlan {
        &self.execution_plan
    }

    pub fn execution_plan_json(&self) -> serde_json::Value {
        self.execution_plan.as_json()
    }

    /// Pin every un-pinned source operator onto a worker hosting a physical
    /// source of its logical stream, distributing multiple sources round
    /// robin.
    fn resolve_source_pins(&self, plan: &mut QueryPlan) -> Result<()> {
        let catalog = self.catalog.lock();
        let mut cursor: std::collections::BTreeMap<String, usize> = Default::default();
        for id in plan.operator_ids() {
            let operator = plan.operator(id)?;
            if operator.pinned_node_id.is_some() {
                continue;
            }
            let OperatorKind::Source { logical_source, .. } = &operator.kind else {
                continue;
            };
            let nodes = catalog.source_nodes_for_logical_source(logical_source)?;
            if nodes.is_empty() {
                return Err(MetaError::Configuration(format!(
                    "logical source '{logical_source}' has no physical source"
                )));
            }
            let index = cursor.entry(logical_source.clone()).or_default();
            let node = nodes[*index % nodes.len()];
            *index += 1;
            plan.operator_mut(id)?.pinned_node_id = Some(node);
        }
        Ok(())
    }

    /// Add a query: merge it into the shared plans, amend the pending
    /// change-log entries and return the resulting deployment contexts.
    pub fn submit_query(
        &self,
        mut plan: QueryPlan,
        strategy: PlacementStrategyKind,
    ) -> Result<(SharedQueryId, Vec<DeploymentContext>)> {
        self.resolve_source_pins(&mut plan)?;
        let query_id = plan.query_id();

        let mut query_plans = self.query_plans.lock();
        let (shared_id, merged) = query_plans.add_query(&self.ids, query_id, &plan, strategy)?;
        tracing::debug!(%query_id, %shared_id, merged, "query added to shared plans");

        let mut topology = self.topology.lock();
        let shared = query_plans.shared_plan_mut(shared_id)?;
        let contexts =
            self.amendment
                .execute(&self.ids, &mut topology, &self.execution_plan, shared);
        Ok((shared_id, contexts))
    }

    /// Stop a query: its exclusive operators are removed from the shared
    /// plan and the undeploy/redeploy contexts are computed.
    pub fn stop_query(&self, query_id: QueryId) -> Result<Vec<DeploymentContext>> {
        let mut query_plans = self.query_plans.lock();
        let shared_id = query_plans.remove_query(query_id)?;
        let mut topology = self.topology.lock();
        let shared = query_plans.shared_plan_mut(shared_id)?;
        let contexts =
            self.amendment
                .execute(&self.ids, &mut topology, &self.execution_plan, shared);
        Ok(contexts)
    }

    /// Re-run the amendment over every shared plan; a no-op when no change
    /// log carries pending entries.
    pub fn amend_all(&self) -> Result<Vec<DeploymentContext>> {
        let mut query_plans = self.query_plans.lock();
        let mut topology = self.topology.lock();
        let mut contexts = Vec::new();
        for shared in query_plans.shared_plans_mut() {
            contexts.extend(self.amendment.execute(
                &self.ids,
                &mut topology,
                &self.execution_plan,
                shared,
            ));
        }
        Ok(contexts)
    }

    pub fn shared_query_for(&self, query_id: QueryId) -> Option<SharedQueryId> {
        self.query_plans.lock().shared_query_for(query_id)
    }

    pub fn with_shared_plan<R>(
        &self,
        shared_id: SharedQueryId,
        f: impl FnOnce(&crate::shared::SharedQueryPlan) -> R,
    ) -> Result<R> {
        let query_plans = self.query_plans.lock();
        Ok(f(query_plans.shared_plan(shared_id)?))
    }

    /// Optional persistence: the worker table and the logical sources.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "workers": self.topology.lock().snapshot(),
            "logical_sources": self.catalog.lock().snapshot(),
        })
    }

    pub fn restore(snapshot: &serde_json::Value) -> Result<Self> {
        let workers = serde_json::from_value(snapshot["workers"].clone())
            .map_err(|e| MetaError::Configuration(format!("bad worker snapshot: {e}")))?;
        let sources: std::collections::BTreeMap<String, Schema> =
            serde_json::from_value(snapshot["logical_sources"].clone())
                .map_err(|e| MetaError::Configuration(format!("bad source snapshot: {e}")))?;
        let coordinator = Self::new();
        *coordinator.topology.lock() = Topology::restore(workers, None);
        *coordinator.catalog.lock() = SourceCatalog::restore(sources);
        Ok(coordinator)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlService for Coordinator {
    fn register_node(&self, request: RegisterNodeRequest) -> ControlReply {
        let worker_id = self.topology.lock().register_worker(
            request.address,
            request.grpc_port,
            request.data_port,
            request.cpu_count,
        );
        self.execution_plan.add_execution_node(worker_id);
        ControlReply::ok_with(ReplyPayload::WorkerId(worker_id))
    }

    fn unregister_node(&self, worker_id: WorkerId) -> ControlReply {
        match self.topology.lock().unregister_worker(worker_id) {
            Ok(()) => ControlReply::ok(),
            Err(error) => ControlReply::failure(error.to_string()),
        }
    }

    fn register_logical_source(&self, name: String, schema: Schema) -> ControlReply {
        self.catalog.lock().register_logical_source(name, schema);
        ControlReply::ok()
    }

    fn register_physical_source(&self, request: RegisterPhysicalSourceRequest) -> ControlReply {
        let source = PhysicalSource {
            worker_id: request.worker_id,
            physical_name: request.physical_name,
            logical_name: request.logical_name,
            source_type: request.source_type,
            config: request.config,
        };
        match self.catalog.lock().register_physical_source(source) {
            Ok(()) => ControlReply::ok(),
            Err(error) => ControlReply::failure(error.to_string()),
        }
    }

    fn add_parent(&self, child: WorkerId, parent: WorkerId) -> ControlReply {
        match self.topology.lock().add_parent(child, parent) {
            Ok(()) => {
                self.execution_plan.add_as_parent(child, parent);
                ControlReply::ok()
            }
            Err(error) => ControlReply::failure(error.to_string()),
        }
    }

    fn remove_parent(&self, child: WorkerId, parent: WorkerId) -> ControlReply {
        match self.topology.lock().remove_parent(child, parent) {
            Ok(()) => ControlReply::ok(),
            Err(error) => ControlReply::failure(error.to_string()),
        }
    }
}
