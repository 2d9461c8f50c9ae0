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

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use nebulastream_common::catalog::Schema;
use nebulastream_common::types::{QueryId, QuerySubPlanId, WorkerId};
use nebulastream_runtime::task::statistics::QueryStatisticsSnapshot;

use crate::error::{NetworkError, Result};
use crate::rpc::{
    ControlReply, ControlRequest, DeployQueryRequest, RegisterNodeRequest,
    RegisterPhysicalSourceRequest, ReplyPayload,
};

/// Client side of the control plane. One connection per call; deploy and
/// undeploy are retried a bounded number of times after disconnects.
pub struct ControlClient {
    address: String,
    retries: usize,
    backoff: Duration,
}

impl ControlClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            retries: 3,
            backoff: Duration::from_millis(100),
        }
    }

    pub fn with_retry_policy(mut self, retries: usize, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    async fn call(&self, request: &ControlRequest) -> Result<ControlReply> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| NetworkError::Disconnected(e.to_string()))?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        framed.send(serde_json::to_vec(request)?.into()).await?;
        let frame = framed
            .next()
            .await
            .ok_or_else(|| NetworkError::Disconnected("connection closed mid-call".into()))??;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Call that fails the RPC-level `success` flag into an error.
    async fn call_checked(&self, request: &ControlRequest) -> Result<ControlReply> {
        let reply = self.call(request).await?;
        if reply.success {
            Ok(reply)
        } else {
            Err(NetworkError::Rpc(
                reply.reason.unwrap_or_else(|| "unspecified failure".into()),
            ))
        }
    }

    async fn call_with_retry(&self, request: &ControlRequest) -> Result<ControlReply> {
        let strategy = FixedInterval::new(self.backoff).take(self.retries);
        Retry::spawn(strategy, || async {
            match self.call_checked(request).await {
                Ok(reply) => Ok(reply),
                // Only transport losses are worth retrying.
                Err(NetworkError::Disconnected(reason)) => {
                    tracing::warn!(%reason, "control call lost its peer, retrying");
                    Err(NetworkError::Disconnected(reason))
                }
                Err(other) => Err(other),
            }
        })
        .await
    }

    pub async fn register_node(&self, request: RegisterNodeRequest) -> Result<WorkerId> {
        let reply = self
            .call_checked(&ControlRequest::RegisterNode(request))
            .await?;
        match reply.payload {
            Some(ReplyPayload::WorkerId(worker_id)) => Ok(worker_id),
            _ => Err(NetworkError::Rpc("reply without worker id".into())),
        }
    }

    pub async fn unregister_node(&self, worker_id: WorkerId) -> Result<()> {
        self.call_checked(&ControlRequest::UnregisterNode { worker_id })
            .await
            .map(|_| ())
    }

    pub async fn register_logical_source(&self, name: &str, schema: &Schema) -> Result<()> {
        self.call_checked(&ControlRequest::RegisterLogicalSource {
            name: name.to_owned(),
            schema: schema.clone(),
        })
        .await
        .map(|_| ())
    }

    pub async fn register_physical_source(
        &self,
        request: RegisterPhysicalSourceRequest,
    ) -> Result<()> {
        self.call_checked(&ControlRequest::RegisterPhysicalSource(request))
            .await
            .map(|_| ())
    }

    pub async fn add_parent(&self, child: WorkerId, parent: WorkerId) -> Result<()> {
        self.call_checked(&ControlRequest::AddParent { child, parent })
            .await
            .map(|_| ())
    }

    pub async fn remove_parent(&self, child: WorkerId, parent: WorkerId) -> Result<()> {
        self.call_checked(&ControlRequest::RemoveParent { child, parent })
            .await
            .map(|_| ())
    }

    pub async fn deploy_query(&self, request: DeployQueryRequest) -> Result<()> {
        self.call_with_retry(&ControlRequest::DeployQuery(request))
            .await
            .map(|_| ())
    }

    pub async fn undeploy_query(&self, plan_id: QuerySubPlanId) -> Result<()> {
        self.call_with_retry(&ControlRequest::UndeployQuery { plan_id })
            .await
            .map(|_| ())
    }

    pub async fn get_query_statistics(
        &self,
        query_id: QueryId,
    ) -> Result<QueryStatisticsSnapshot> {
        let reply = self
            .call_checked(&ControlRequest::GetQueryStatistics { query_id })
            .await?;
        match reply.payload {
            Some(ReplyPayload::Statistics(snapshot)) => Ok(snapshot),
            _ => Err(NetworkError::Rpc("reply without statistics".into())),
        }
    }
}
