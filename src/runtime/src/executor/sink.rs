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

//! Sink seam of the runtime.
//!
//! Physical sink connectors (file/TCP/network) live outside the runtime; they
//! plug in through [`DataSink`] and are driven by a [`SinkStage`] at the end
//! of a pipeline chain.

use std::sync::Arc;

use nebulastream_common::buffer::TupleBuffer;
use nebulastream_common::types::OriginId;

use crate::error::Result;
use crate::executor::stage::{
    ExecutionResult, PipelineExecutionContext, PipelineStage, WorkerContext,
};

/// An opaque sink medium. Implementations must tolerate concurrent `write`
/// calls from multiple worker threads.
pub trait DataSink: Send + Sync {
    fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn write(&self, buffer: &TupleBuffer) -> Result<()>;

    /// Signals that no further buffer of `origin` will arrive.
    fn end_of_stream(&self, _origin: OriginId) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Terminal stage forwarding every input buffer into a [`DataSink`].
pub struct SinkStage {
    sink: Arc<dyn DataSink>,
}

impl SinkStage {
    pub fn new(sink: Arc<dyn DataSink>) -> Arc<Self> {
        Arc::new(Self { sink })
    }

    pub fn sink(&self) -> &Arc<dyn DataSink> {
        &self.sink
    }
}

impl PipelineStage for SinkStage {
    fn execute(
        &self,
        buffer: TupleBuffer,
        _ctx: &mut PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> Result<ExecutionResult> {
        self.sink.write(&buffer)?;
        Ok(ExecutionResult::Ok)
    }
}
