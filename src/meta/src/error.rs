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

use nebulastream_common::types::{OperatorId, QueryId, SharedQueryId, WorkerId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    /// No reachable node with capacity; placement never partially commits.
    #[error("placement failed: {reason}")]
    PlacementFailure { reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("unknown operator {0}")]
    UnknownOperator(OperatorId),

    #[error("unknown query {0}")]
    UnknownQuery(QueryId),

    #[error("unknown shared query plan {0}")]
    UnknownSharedQuery(SharedQueryId),

    #[error("unknown logical source '{0}'")]
    UnknownLogicalSource(String),

    #[error("topology has no root node")]
    NoRootNode,
}

impl MetaError {
    pub fn placement(reason: impl Into<String>) -> Self {
        MetaError::PlacementFailure {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = MetaError> = std::result::Result<T, E>;
