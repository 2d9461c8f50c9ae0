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

use nebulastream_common::types::{PipelineId, QuerySubPlanId, SequenceNumber};
use nebulastream_common::CommonError;
use thiserror::Error;

use crate::task::executable_plan::QueryPlanStatus;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The shredder ring cannot admit this sequence number yet; upstream must
    /// back off until older slots are released.
    #[error("sequence number {sequence_number} outside shredder window starting at {tail}")]
    SequenceOutOfRange {
        sequence_number: SequenceNumber,
        tail: u64,
    },

    /// A stage reported an unrecoverable failure; the owning query goes to
    /// `Failed`.
    #[error("pipeline {pipeline_id} execution failed: {reason}")]
    PipelineExecution {
        pipeline_id: PipelineId,
        reason: String,
    },

    #[error("invalid state transition for plan {plan_id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        plan_id: QuerySubPlanId,
        from: QueryPlanStatus,
        to: QueryPlanStatus,
    },

    #[error("query sub plan {0} is not registered")]
    UnknownPlan(QuerySubPlanId),

    #[error("query sub plan {0} is already registered")]
    PlanAlreadyRegistered(QuerySubPlanId),

    #[error("pipeline {0} is not registered")]
    UnknownPipeline(PipelineId),

    #[error("thread pool is already running")]
    AlreadyRunning,

    #[error("thread pool is not running")]
    NotRunning,
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
