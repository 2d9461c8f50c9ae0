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

//! Lifecycle holder for one node-local query sub plan: its sources, its
//! pipelines and its sinks, tied together by an atomic status machine.
//!
//! Ordering rules: sinks are set up before pipelines start; sources stop
//! before pipelines, pipelines before sinks. Double-start is rejected,
//! double-stop is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nebulastream_common::buffer::{BufferPool, TupleBuffer};
use nebulastream_common::types::{OperatorId, OriginId, PipelineId, QueryId, QuerySubPlanId};

use crate::error::{Result, RuntimeError};
use crate::executor::pipeline::Pipeline;
use crate::executor::sink::DataSink;
use crate::executor::stage::WorkerContext;
use crate::task::query_manager::QueryManager;

/// Status machine: Created -> Deployed -> Running -> (Stopped | Failed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryPlanStatus {
    Created = 0,
    Deployed = 1,
    Running = 2,
    Stopped = 3,
    Failed = 4,
}

impl QueryPlanStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => QueryPlanStatus::Created,
            1 => QueryPlanStatus::Deployed,
            2 => QueryPlanStatus::Running,
            3 => QueryPlanStatus::Stopped,
            _ => QueryPlanStatus::Failed,
        }
    }
}

/// An opaque data source. Sources own their threads (or dispatch into the
/// task queue) and stamp (origin, sequence number) onto the buffers they
/// produce.
pub trait DataSource: Send + Sync {
    fn operator_id(&self) -> OperatorId;

    fn origin_id(&self) -> OriginId;

    fn start(&self, manager: &QueryManager) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

pub struct ExecutableQueryPlan {
    plan_id: QuerySubPlanId,
    query_id: QueryId,
    sources: Vec<Arc<dyn DataSource>>,
    sinks: Vec<Arc<dyn DataSink>>,
    pipelines: Vec<Arc<Pipeline>>,
    by_id: HashMap<PipelineId, Arc<Pipeline>>,
    status: AtomicU8,
}

impl ExecutableQueryPlan {
    pub fn new(
        plan_id: QuerySubPlanId,
        query_id: QueryId,
        sources: Vec<Arc<dyn DataSource>>,
        sinks: Vec<Arc<dyn DataSink>>,
        pipelines: Vec<Arc<Pipeline>>,
    ) -> Arc<Self> {
        let by_id = pipelines
            .iter()
            .map(|p| (p.id(), Arc::clone(p)))
            .collect();
        Arc::new(Self {
            plan_id,
            query_id,
            sources,
            sinks,
            pipelines,
            by_id,
            status: AtomicU8::new(QueryPlanStatus::Created as u8),
        })
    }

    pub fn plan_id(&self) -> QuerySubPlanId {
        self.plan_id
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn sources(&self) -> &[Arc<dyn DataSource>] {
        &self.sources
    }

    pub fn sinks(&self) -> &[Arc<dyn DataSink>] {
        &self.sinks
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<&Arc<Pipeline>> {
        self.by_id.get(&id)
    }

    pub fn status(&self) -> QueryPlanStatus {
        QueryPlanStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// True once the plan left the Running state; in-flight tasks check this
    /// between buffers and skip instead of executing.
    pub fn should_stop(&self) -> bool {
        matches!(
            self.status(),
            QueryPlanStatus::Stopped | QueryPlanStatus::Failed
        )
    }

    fn transition(&self, from: QueryPlanStatus, to: QueryPlanStatus) -> Result<()> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| RuntimeError::InvalidStateTransition {
                plan_id: self.plan_id,
                from: QueryPlanStatus::from_u8(actual),
                to,
            })
    }

    /// Created -> Deployed. Sets up the sink media first so pipelines can
    /// emit the moment they run.
    pub fn setup(&self) -> Result<()> {
        self.transition(QueryPlanStatus::Created, QueryPlanStatus::Deployed)?;
        for sink in &self.sinks {
            sink.setup()?;
        }
        Ok(())
    }

    /// Deployed -> Running. Rejects double-start.
    pub fn start(&self) -> Result<()> {
        self.transition(QueryPlanStatus::Deployed, QueryPlanStatus::Running)?;
        for pipeline in &self.pipelines {
            pipeline.start();
        }
        tracing::debug!(plan_id = %self.plan_id, query_id = %self.query_id, "query plan running");
        Ok(())
    }

    /// Running -> Stopped. Stops sources, drains each pipeline stage (routing
    /// terminal buffers through still-running successors on the calling
    /// thread), releases handlers and shuts the sinks down last.
    ///
    /// Idempotent on an already-stopped plan.
    pub fn stop(&self, pool: &BufferPool) -> Result<()> {
        if self.status() == QueryPlanStatus::Stopped {
            return Ok(());
        }
        self.transition(QueryPlanStatus::Running, QueryPlanStatus::Stopped)?;

        for source in &self.sources {
            source.stop()?;
        }

        let mut worker = WorkerContext::new(0, pool.clone());
        for pipeline in &self.pipelines {
            let mut ctx = pipeline.execution_context(pool.clone());
            if let Err(error) = pipeline.stop_stage(&mut ctx) {
                tracing::warn!(pipeline_id = %pipeline.id(), %error, "stage drain failed");
            }
            let terminal: Vec<(PipelineId, TupleBuffer)> = ctx
                .take_emitted()
                .into_iter()
                .flat_map(|buffer| {
                    pipeline
                        .successors()
                        .iter()
                        .map(move |s| (*s, buffer.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();
            self.forward_locally(terminal, pool, &mut worker);
            for handler in pipeline.operator_handlers() {
                handler.stop()?;
            }
            pipeline.mark_stopped();
        }

        for sink in &self.sinks {
            sink.shutdown()?;
        }
        tracing::info!(plan_id = %self.plan_id, query_id = %self.query_id, "query plan stopped");
        Ok(())
    }

    /// Transition to Failed and release resources: sources stop, sinks
    /// observe end-of-stream for every input origin, handlers are dropped.
    /// Returns `Ok(false)` for every caller but the one that won the
    /// transition; losers must not touch the plan's resources again.
    pub fn fail(&self) -> Result<bool> {
        loop {
            let current = self.status();
            if matches!(
                current,
                QueryPlanStatus::Failed | QueryPlanStatus::Stopped
            ) {
                return Ok(false);
            }
            if self
                .status
                .compare_exchange(
                    current as u8,
                    QueryPlanStatus::Failed as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        for source in &self.sources {
            source.stop()?;
        }
        for pipeline in &self.pipelines {
            pipeline.mark_failed();
            for handler in pipeline.operator_handlers() {
                handler.stop()?;
            }
        }
        for sink in &self.sinks {
            for source in &self.sources {
                sink.end_of_stream(source.origin_id())?;
            }
            sink.shutdown()?;
        }
        tracing::warn!(plan_id = %self.plan_id, query_id = %self.query_id, "query plan failed");
        Ok(true)
    }

    /// Depth-first forwarding of terminal buffers during a stop, bypassing
    /// the task queue (which would skip them as the plan is leaving Running).
    fn forward_locally(
        &self,
        mut pending: Vec<(PipelineId, TupleBuffer)>,
        pool: &BufferPool,
        worker: &mut WorkerContext,
    ) {
        while let Some((target, buffer)) = pending.pop() {
            let Some(pipeline) = self.pipeline(target) else {
                continue;
            };
            let mut ctx = pipeline.execution_context(pool.clone());
            if let Err(error) = pipeline.execute(buffer, &mut ctx, worker) {
                tracing::warn!(pipeline_id = %pipeline.id(), %error, "terminal forward failed");
                continue;
            }
            for emitted in ctx.take_emitted() {
                for successor in pipeline.successors() {
                    pending.push((*successor, emitted.clone()));
                }
            }
        }
    }
}
