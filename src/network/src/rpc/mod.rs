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

//! Control-plane RPC between coordinator and workers.
//!
//! One request/response pair per event, serialized as JSON over a
//! length-delimited TCP transport. Every reply carries `success` and, on
//! failure, a reason string; there are no streaming calls.

mod client;
mod server;
pub mod worker;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use nebulastream_common::catalog::Schema;
use nebulastream_common::types::{PlanVersion, QueryId, QuerySubPlanId, WorkerId};
use nebulastream_runtime::task::statistics::QueryStatisticsSnapshot;

pub use client::ControlClient;
pub use server::serve_control;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Worker,
    Sensor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub address: String,
    pub grpc_port: u16,
    pub data_port: u16,
    pub cpu_count: u32,
    pub node_type: NodeType,
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPhysicalSourceRequest {
    pub worker_id: WorkerId,
    pub physical_name: String,
    pub logical_name: String,
    pub source_type: String,
    pub config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployQueryRequest {
    pub plan_id: QuerySubPlanId,
    pub version: PlanVersion,
    /// Opaque serialized decomposed sub plan; decoded by the worker's
    /// deployer (query compiler seam).
    pub serialized_sub_plan: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    RegisterNode(RegisterNodeRequest),
    UnregisterNode { worker_id: WorkerId },
    RegisterLogicalSource { name: String, schema: Schema },
    RegisterPhysicalSource(RegisterPhysicalSourceRequest),
    AddParent { child: WorkerId, parent: WorkerId },
    RemoveParent { child: WorkerId, parent: WorkerId },
    DeployQuery(DeployQueryRequest),
    UndeployQuery { plan_id: QuerySubPlanId },
    GetQueryStatistics { query_id: QueryId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyPayload {
    WorkerId(WorkerId),
    Statistics(QueryStatisticsSnapshot),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    pub reason: Option<String>,
    pub payload: Option<ReplyPayload>,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
            payload: None,
        }
    }

    pub fn ok_with(payload: ReplyPayload) -> Self {
        Self {
            success: true,
            reason: None,
            payload: Some(payload),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            payload: None,
        }
    }
}

fn unsupported(method: &str) -> ControlReply {
    ControlReply::failure(format!("{method} is not served by this endpoint"))
}

/// Handler surface of the control plane. Coordinator and worker each
/// implement their half; unimplemented methods reply with a failure.
pub trait ControlService: Send + Sync {
    fn register_node(&self, _request: RegisterNodeRequest) -> ControlReply {
        unsupported("RegisterNode")
    }

    fn unregister_node(&self, _worker_id: WorkerId) -> ControlReply {
        unsupported("UnregisterNode")
    }

    fn register_logical_source(&self, _name: String, _schema: Schema) -> ControlReply {
        unsupported("RegisterLogicalSource")
    }

    fn register_physical_source(&self, _request: RegisterPhysicalSourceRequest) -> ControlReply {
        unsupported("RegisterPhysicalSource")
    }

    fn add_parent(&self, _child: WorkerId, _parent: WorkerId) -> ControlReply {
        unsupported("AddParent")
    }

    fn remove_parent(&self, _child: WorkerId, _parent: WorkerId) -> ControlReply {
        unsupported("RemoveParent")
    }

    fn deploy_query(&self, _request: DeployQueryRequest) -> ControlReply {
        unsupported("DeployQuery")
    }

    fn undeploy_query(&self, _plan_id: QuerySubPlanId) -> ControlReply {
        unsupported("UndeployQuery")
    }

    fn get_query_statistics(&self, _query_id: QueryId) -> ControlReply {
        unsupported("GetQueryStatistics")
    }
}

/// Route one decoded request to its handler method.
pub fn dispatch(service: &dyn ControlService, request: ControlRequest) -> ControlReply {
    match request {
        ControlRequest::RegisterNode(request) => service.register_node(request),
        ControlRequest::UnregisterNode { worker_id } => service.unregister_node(worker_id),
        ControlRequest::RegisterLogicalSource { name, schema } => {
            service.register_logical_source(name, schema)
        }
        ControlRequest::RegisterPhysicalSource(request) => {
            service.register_physical_source(request)
        }
        ControlRequest::AddParent { child, parent } => service.add_parent(child, parent),
        ControlRequest::RemoveParent { child, parent } => service.remove_parent(child, parent),
        ControlRequest::DeployQuery(request) => service.deploy_query(request),
        ControlRequest::UndeployQuery { plan_id } => service.undeploy_query(plan_id),
        ControlRequest::GetQueryStatistics { query_id } => service.get_query_statistics(query_id),
    }
}
