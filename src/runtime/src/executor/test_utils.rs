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

//! Stage kernels, sources and sinks used by the runtime test suites. Real
//! kernels are produced by the query compiler; these hand-written ones cover
//! the same surface for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nebulastream_common::buffer::{BufferMetadata, BufferPool, TupleBuffer};
use nebulastream_common::catalog::Schema;
use nebulastream_common::types::{ChunkNumber, OperatorId, OriginId, SequenceNumber, Timestamp};

use crate::error::{Result, RuntimeError};
use crate::executor::sink::DataSink;
use crate::executor::stage::{
    ExecutionResult, PipelineExecutionContext, PipelineStage, WorkerContext,
};
use crate::task::executable_plan::DataSource;
use crate::task::query_manager::QueryManager;

/// Forwards every input buffer unchanged.
pub struct PassThroughStage;

impl PipelineStage for PassThroughStage {
    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> Result<ExecutionResult> {
        ctx.emit(buffer);
        Ok(ExecutionResult::Ok)
    }
}

/// Filters `i64` tuples of a fixed-width schema on equality against a
/// constant, the shape of the compiled kernel for `filter(field == value)`.
pub struct FilterEqStage {
    tuple_size: usize,
    field_offset: usize,
    value: i64,
}

impl FilterEqStage {
    pub fn new(schema: &Schema, field: &str, value: i64) -> Result<Self> {
        Ok(Self {
            tuple_size: schema.tuple_size(),
            field_offset: schema.field_offset(field).map_err(RuntimeError::Common)?,
            value,
        })
    }
}

impl PipelineStage for FilterEqStage {
    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> Result<ExecutionResult> {
        let mut output = ctx.allocate_buffer();
        let mut selected = 0u32;
        {
            let input = buffer.data();
            let out = output.data_mut();
            for tuple in 0..buffer.num_tuples() as usize {
                let offset = tuple * self.tuple_size;
                let field = offset + self.field_offset;
                let value = i64::from_le_bytes(
                    input[field..field + 8].try_into().expect("8-byte field"),
                );
                if value == self.value {
                    let dst = selected as usize * self.tuple_size;
                    out[dst..dst + self.tuple_size]
                        .copy_from_slice(&input[offset..offset + self.tuple_size]);
                    selected += 1;
                }
            }
        }
        let meta = output.metadata_mut();
        *meta = BufferMetadata {
            num_tuples: selected,
            creation_timestamp: meta.creation_timestamp,
            ..*buffer.metadata()
        };
        ctx.emit(output);
        Ok(ExecutionResult::Ok)
    }
}

/// Always fails; used to drive the error path.
pub struct FailingStage;

impl PipelineStage for FailingStage {
    fn execute(
        &self,
        _buffer: TupleBuffer,
        ctx: &mut PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> Result<ExecutionResult> {
        Err(RuntimeError::PipelineExecution {
            pipeline_id: ctx.pipeline_id(),
            reason: "injected failure".into(),
        })
    }
}

/// Collects every written buffer for later inspection.
#[derive(Default)]
pub struct CollectingSink {
    buffers: Mutex<Vec<TupleBuffer>>,
    eos_origins: Mutex<Vec<OriginId>>,
    shutdown: AtomicBool,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collected(&self) -> Vec<TupleBuffer> {
        self.buffers.lock().clone()
    }

    pub fn collected_tuples(&self) -> u64 {
        self.buffers
            .lock()
            .iter()
            .map(|b| b.num_tuples() as u64)
            .sum()
    }

    pub fn eos_origins(&self) -> Vec<OriginId> {
        self.eos_origins.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl DataSink for CollectingSink {
    fn write(&self, buffer: &TupleBuffer) -> Result<()> {
        self.buffers.lock().push(buffer.clone());
        Ok(())
    }

    fn end_of_stream(&self, origin: OriginId) -> Result<()> {
        self.eos_origins.lock().push(origin);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        Ok(())
    }
}

/// A source whose buffers are pumped in manually from the test body.
pub struct ManualSource {
    operator_id: OperatorId,
    origin_id: OriginId,
    running: AtomicBool,
    next_sequence: AtomicU64,
}

impl ManualSource {
    pub fn new(operator_id: OperatorId, origin_id: OriginId) -> Arc<Self> {
        Arc::new(Self {
            operator_id,
            origin_id,
            running: AtomicBool::new(false),
            next_sequence: AtomicU64::new(SequenceNumber::INITIAL.raw()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Build one buffer of `i64`-keyed tuples and hand it to the manager.
    pub fn pump_i64(
        &self,
        manager: &QueryManager,
        pool: &BufferPool,
        schema: &Schema,
        values: &[i64],
        watermark: Timestamp,
    ) -> Result<()> {
        let buffer = build_i64_buffer(
            pool,
            schema,
            values,
            BufferMetadata {
                origin_id: self.origin_id,
                sequence_number: SequenceNumber(
                    self.next_sequence.fetch_add(1, Ordering::AcqRel),
                ),
                chunk_number: ChunkNumber::INITIAL,
                last_chunk: true,
                watermark,
                ..Default::default()
            },
        );
        manager.add_work(self.operator_id, buffer)
    }
}

impl DataSource for ManualSource {
    fn operator_id(&self) -> OperatorId {
        self.operator_id
    }

    fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    fn start(&self, _manager: &QueryManager) -> Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }
}

/// Fill a pool buffer with tuples whose leading field is the given `i64`;
/// remaining schema bytes stay zeroed.
pub fn build_i64_buffer(
    pool: &BufferPool,
    schema: &Schema,
    values: &[i64],
    meta: BufferMetadata,
) -> TupleBuffer {
    let tuple_size = schema.tuple_size();
    let mut buffer = pool.acquire();
    assert!(values.len() * tuple_size <= buffer.capacity());
    {
        let data = buffer.data_mut();
        data[..values.len() * tuple_size].fill(0);
        for (i, value) in values.iter().enumerate() {
            let offset = i * tuple_size;
            data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
    }
    let creation_timestamp = buffer.metadata().creation_timestamp;
    *buffer.metadata_mut() = BufferMetadata {
        num_tuples: values.len() as u32,
        creation_timestamp,
        ..meta
    };
    buffer
}

/// Decode the leading `i64` field of every tuple in a buffer.
pub fn read_i64_column(buffer: &TupleBuffer, schema: &Schema) -> Vec<i64> {
    let tuple_size = schema.tuple_size();
    (0..buffer.num_tuples() as usize)
        .map(|i| {
            let offset = i * tuple_size;
            i64::from_le_bytes(
                buffer.data()[offset..offset + 8]
                    .try_into()
                    .expect("8-byte field"),
            )
        })
        .collect()
}
