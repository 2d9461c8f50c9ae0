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

//! The stage trait implemented by compiled pipeline kernels.
//!
//! A stage is an opaque unit of work invoked once per input buffer. It emits
//! zero or more output buffers through the [`PipelineExecutionContext`]; the
//! runtime forwards those to the successor pipelines after `execute` returns.
//! Stage bodies must never block on I/O — sources own their own threads and
//! sinks flush through channels.

use std::sync::Arc;

use smallvec::SmallVec;

use nebulastream_common::buffer::{BufferPool, TupleBuffer};
use nebulastream_common::types::{PipelineId, QuerySubPlanId};

use crate::error::Result;
use crate::executor::operator_handler::OperatorHandler;

/// Outcome of one `execute` invocation. Unrecoverable failures are reported
/// as `Err` and fail the owning query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The buffer was fully processed.
    Ok,
    /// The stage consumed the buffer but needs more input before it can emit
    /// (e.g. a spanning tuple still missing its tail).
    NeedMoreInput,
    /// The stage has drained all state; no further input is expected.
    Completed,
}

/// Per-worker-thread execution state handed into every stage invocation.
pub struct WorkerContext {
    worker_id: usize,
    buffer_pool: BufferPool,
}

impl WorkerContext {
    pub fn new(worker_id: usize, buffer_pool: BufferPool) -> Self {
        Self {
            worker_id,
            buffer_pool,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }
}

/// Hands emitted buffers and operator state to a stage during `execute`.
pub struct PipelineExecutionContext {
    plan_id: QuerySubPlanId,
    pipeline_id: PipelineId,
    buffer_pool: BufferPool,
    handlers: Vec<Arc<dyn OperatorHandler>>,
    // Most stages emit at most a couple of buffers per invocation.
    emitted: SmallVec<[TupleBuffer; 4]>,
}

impl PipelineExecutionContext {
    pub fn new(
        plan_id: QuerySubPlanId,
        pipeline_id: PipelineId,
        buffer_pool: BufferPool,
        handlers: Vec<Arc<dyn OperatorHandler>>,
    ) -> Self {
        Self {
            plan_id,
            pipeline_id,
            buffer_pool,
            handlers,
            emitted: SmallVec::new(),
        }
    }

    pub fn plan_id(&self) -> QuerySubPlanId {
        self.plan_id
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Blocking allocation from the pool; this is where backpressure bites.
    pub fn allocate_buffer(&self) -> TupleBuffer {
        self.buffer_pool.acquire()
    }

    pub fn try_allocate_buffer(&self) -> Result<TupleBuffer> {
        Ok(self.buffer_pool.try_acquire()?)
    }

    /// Queue an output buffer for forwarding to the successor pipelines.
    pub fn emit(&mut self, buffer: TupleBuffer) {
        self.emitted.push(buffer);
    }

    /// Buffers emitted so far, in emission order. Drained by the runtime.
    pub(crate) fn take_emitted(&mut self) -> Vec<TupleBuffer> {
        std::mem::take(&mut self.emitted).into_vec()
    }

    pub fn operator_handler(&self, index: usize) -> Option<&Arc<dyn OperatorHandler>> {
        self.handlers.get(index)
    }

    pub fn num_operator_handlers(&self) -> usize {
        self.handlers.len()
    }
}

/// An opaque execution kernel (scan/filter/map/aggregate/join/sink entry).
///
/// Kernels are produced by the query compiler and invoked by the runtime;
/// they are shared between all worker threads, so any mutable state lives in
/// operator handlers or worker-sharded storage.
pub trait PipelineStage: Send + Sync {
    /// Runs once per worker thread before the first `execute` on that thread,
    /// allocating thread-local state.
    fn setup(&self, _ctx: &mut PipelineExecutionContext, _worker: &mut WorkerContext) -> Result<()> {
        Ok(())
    }

    /// Consume one input buffer, possibly emitting output buffers via `ctx`.
    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<ExecutionResult>;

    /// Drain outstanding state and emit terminal buffers.
    fn stop(&self, _ctx: &mut PipelineExecutionContext) -> Result<()> {
        Ok(())
    }
}
