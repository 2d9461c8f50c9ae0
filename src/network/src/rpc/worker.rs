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

//! Worker half of the control plane: deploy, undeploy and statistics.

use std::sync::Arc;

use nebulastream_common::types::{PlanVersion, QueryId, QuerySubPlanId};
use nebulastream_runtime::task::executable_plan::ExecutableQueryPlan;
use nebulastream_runtime::task::query_manager::QueryManager;

use crate::rpc::{ControlReply, ControlService, DeployQueryRequest, ReplyPayload};

/// Turns an opaque serialized sub plan into an executable plan. This is the
/// seam towards the query compiler, which produces the pipeline stages.
pub trait QueryDeployer: Send + Sync {
    fn deploy(
        &self,
        plan_id: QuerySubPlanId,
        version: PlanVersion,
        serialized_sub_plan: &[u8],
    ) -> nebulastream_runtime::Result<Arc<ExecutableQueryPlan>>;
}

pub struct WorkerControlService {
    manager: QueryManager,
    deployer: Arc<dyn QueryDeployer>,
}

impl WorkerControlService {
    pub fn new(manager: QueryManager, deployer: Arc<dyn QueryDeployer>) -> Self {
        Self { manager, deployer }
    }
}

impl ControlService for WorkerControlService {
    fn deploy_query(&self, request: DeployQueryRequest) -> ControlReply {
        let plan = match self.deployer.deploy(
            request.plan_id,
            request.version,
            &request.serialized_sub_plan,
        ) {
            Ok(plan) => plan,
            Err(error) => return ControlReply::failure(format!("compile failed: {error}")),
        };
        if let Err(error) = self.manager.register_query(plan) {
            return ControlReply::failure(format!("register failed: {error}"));
        }
        match self.manager.start_query(request.plan_id) {
            Ok(()) => ControlReply::ok(),
            Err(error) => ControlReply::failure(format!("start failed: {error}")),
        }
    }

    fn undeploy_query(&self, plan_id: QuerySubPlanId) -> ControlReply {
        match self.manager.stop_query(plan_id) {
            Ok(()) => ControlReply::ok(),
            Err(error) => ControlReply::failure(format!("stop failed: {error}")),
        }
    }

    fn get_query_statistics(&self, query_id: QueryId) -> ControlReply {
        match self.manager.statistics_for_query(query_id) {
            Some(snapshot) => ControlReply::ok_with(ReplyPayload::Statistics(snapshot)),
            None => ControlReply::failure(format!("no live sub plan for query {query_id}")),
        }
    }
}
