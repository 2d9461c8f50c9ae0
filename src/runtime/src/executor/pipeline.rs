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

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nebulastream_common::buffer::TupleBuffer;
use nebulastream_common::types::{OriginId, PipelineId, QueryId, QuerySubPlanId};

use crate::error::Result;
use crate::executor::operator_handler::OperatorHandler;
use crate::executor::stage::{
    ExecutionResult, PipelineExecutionContext, PipelineStage, WorkerContext,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Created = 0,
    Running = 1,
    Stopped = 2,
    Failed = 3,
}

impl PipelineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PipelineState::Created,
            1 => PipelineState::Running,
            2 => PipelineState::Stopped,
            _ => PipelineState::Failed,
        }
    }
}

/// One schedulable unit: a stage bound to its input origins, successor
/// pipelines and operator handlers.
pub struct Pipeline {
    id: PipelineId,
    query_id: QueryId,
    plan_id: QuerySubPlanId,
    input_origins: Vec<OriginId>,
    successors: Vec<PipelineId>,
    stage: Arc<dyn PipelineStage>,
    handlers: Vec<Arc<dyn OperatorHandler>>,
    state: AtomicU8,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PipelineId,
        query_id: QueryId,
        plan_id: QuerySubPlanId,
        input_origins: Vec<OriginId>,
        successors: Vec<PipelineId>,
        stage: Arc<dyn PipelineStage>,
        handlers: Vec<Arc<dyn OperatorHandler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            query_id,
            plan_id,
            input_origins,
            successors,
            stage,
            handlers,
            state: AtomicU8::new(PipelineState::Created as u8),
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn plan_id(&self) -> QuerySubPlanId {
        self.plan_id
    }

    pub fn input_origins(&self) -> &[OriginId] {
        &self.input_origins
    }

    pub fn successors(&self) -> &[PipelineId] {
        &self.successors
    }

    pub fn operator_handlers(&self) -> &[Arc<dyn OperatorHandler>] {
        &self.handlers
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    pub(crate) fn start(&self) {
        let _ = self.state.compare_exchange(
            PipelineState::Created as u8,
            PipelineState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn mark_stopped(&self) {
        self.state
            .store(PipelineState::Stopped as u8, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        self.state
            .store(PipelineState::Failed as u8, Ordering::Release);
    }

    /// Per-worker-thread stage setup.
    pub(crate) fn setup(
        &self,
        ctx: &mut PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<()> {
        self.stage.setup(ctx, worker)
    }

    pub fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<ExecutionResult> {
        self.stage.execute(buffer, ctx, worker)
    }

    /// Drain the stage on shutdown; terminal buffers land in `ctx`.
    pub(crate) fn stop_stage(&self, ctx: &mut PipelineExecutionContext) -> Result<()> {
        self.stage.stop(ctx)
    }

    /// Fresh execution context for one invocation on this pipeline.
    pub(crate) fn execution_context(
        &self,
        pool: nebulastream_common::buffer::BufferPool,
    ) -> PipelineExecutionContext {
        PipelineExecutionContext::new(self.plan_id, self.id, pool, self.handlers.clone())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("query_id", &self.query_id)
            .field("plan_id", &self.plan_id)
            .field("successors", &self.successors)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use nebulastream_common::buffer::BufferPool;

    use super::*;
    use crate::executor::test_utils::PassThroughStage;

    #[test]
    fn lifecycle_transitions() {
        let pipeline = Pipeline::new(
            PipelineId(1),
            QueryId(1),
            QuerySubPlanId(1),
            vec![OriginId(1)],
            vec![],
            Arc::new(PassThroughStage),
            vec![],
        );
        assert_eq!(pipeline.state(), PipelineState::Created);
        assert!(!pipeline.is_running());

        pipeline.start();
        assert!(pipeline.is_running());

        pipeline.mark_stopped();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // A stopped pipeline cannot be restarted through `start`.
        pipeline.start();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn execute_forwards_emissions() {
        let pool = BufferPool::new(2, 64);
        let pipeline = Pipeline::new(
            PipelineId(1),
            QueryId(1),
            QuerySubPlanId(1),
            vec![OriginId(1)],
            vec![PipelineId(2)],
            Arc::new(PassThroughStage),
            vec![],
        );
        pipeline.start();

        let mut ctx = pipeline.execution_context(pool.clone());
        let mut worker = WorkerContext::new(0, pool.clone());
        let buffer = pool.acquire();
        let result = pipeline.execute(buffer, &mut ctx, &mut worker).unwrap();
        assert_eq!(result, ExecutionResult::Ok);
        assert_eq!(ctx.take_emitted().len(), 1);
    }
}
