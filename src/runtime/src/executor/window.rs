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

//! Watermark-driven tumbling-window aggregation.
//!
//! The compiled kernels for window operators delegate their slice storage to
//! a [`WindowOperatorHandler`]; this stage is the interpreted rendition of
//! that kernel: it appends records to the worker's shard, advances the
//! per-origin watermark, and when the global watermark passes a slice end it
//! combines the shards and emits one result row per closed window.
//!
//! Output buffers reuse the input buffer's (origin, sequence number); when a
//! trigger produces more rows than fit into one buffer, the output is split
//! into chunks 1..k with the last-chunk flag on the final one, so the chunk
//! set partitions the sequence number's output. Inputs are expected
//! single-chunk (sources emit whole buffers; the network source re-chunks).

use std::sync::Arc;

use nebulastream_common::buffer::{BufferMetadata, TupleBuffer};
use nebulastream_common::catalog::Schema;
use nebulastream_common::row::{RowLayout, RowReader, RowWriter};
use nebulastream_common::types::ChunkNumber;

use crate::error::{Result, RuntimeError};
use crate::executor::operator_handler::WindowOperatorHandler;
use crate::executor::stage::{
    ExecutionResult, PipelineExecutionContext, PipelineStage, WorkerContext,
};
use crate::task::watermark::WatermarkProcessor;

/// Splits one logical emission into chunked output buffers carrying the
/// input's origin and sequence number. `finish` seals the final chunk; if
/// nothing was appended it emits an empty watermark-only chunk so that
/// downstream sequence tracking still completes the sequence number.
pub struct ChunkedEmitter<'a> {
    ctx: &'a mut PipelineExecutionContext,
    meta: BufferMetadata,
    tuple_size: usize,
    next_chunk: ChunkNumber,
    current: Option<TupleBuffer>,
    tuples_in_current: u32,
    emitted_chunks: u32,
}

impl<'a> ChunkedEmitter<'a> {
    pub fn new(
        ctx: &'a mut PipelineExecutionContext,
        input_meta: &BufferMetadata,
        tuple_size: usize,
    ) -> Self {
        Self {
            ctx,
            meta: *input_meta,
            tuple_size,
            next_chunk: ChunkNumber::INITIAL,
            current: None,
            tuples_in_current: 0,
            emitted_chunks: 0,
        }
    }

    fn capacity_of(&self, buffer: &TupleBuffer) -> u32 {
        (buffer.capacity() / self.tuple_size) as u32
    }

    pub fn append_tuple(&mut self, tuple: &[u8]) -> Result<()> {
        debug_assert_eq!(tuple.len(), self.tuple_size);
        if let Some(buffer) = &self.current {
            if self.tuples_in_current >= self.capacity_of(buffer) {
                self.seal(false);
            }
        }
        let buffer = match &mut self.current {
            Some(buffer) => buffer,
            None => {
                self.current = Some(self.ctx.allocate_buffer());
                self.tuples_in_current = 0;
                self.current.as_mut().expect("just inserted")
            }
        };
        let offset = self.tuples_in_current as usize * self.tuple_size;
        buffer.data_mut()[offset..offset + self.tuple_size].copy_from_slice(tuple);
        self.tuples_in_current += 1;
        Ok(())
    }

    fn seal(&mut self, last: bool) {
        let Some(mut buffer) = self.current.take() else {
            return;
        };
        let creation_timestamp = buffer.metadata().creation_timestamp;
        *buffer.metadata_mut() = BufferMetadata {
            origin_id: self.meta.origin_id,
            sequence_number: self.meta.sequence_number,
            chunk_number: self.next_chunk,
            last_chunk: last,
            watermark: self.meta.watermark,
            creation_timestamp,
            num_tuples: self.tuples_in_current,
        };
        self.next_chunk = self.next_chunk.next();
        self.tuples_in_current = 0;
        self.emitted_chunks += 1;
        self.ctx.emit(buffer);
    }

    /// Seal the last chunk. With nothing appended at all, an empty
    /// watermark-only chunk goes out instead.
    pub fn finish(mut self) {
        if self.current.is_none() && self.emitted_chunks == 0 {
            self.current = Some(self.ctx.allocate_buffer());
            self.tuples_in_current = 0;
        }
        self.seal(true);
    }
}

/// Result row layout: (window_start: u64, window_end: u64, aggregate: i64).
pub fn window_result_schema() -> Schema {
    use nebulastream_common::catalog::DataType;
    Schema::empty()
        .with_field("window_start", DataType::UInt64)
        .with_field("window_end", DataType::UInt64)
        .with_field("aggregate", DataType::Int64)
}

/// Tumbling-window sum over an `i64` field, sliced by an event-time field.
pub struct WindowedAggregationStage {
    input_layout: RowLayout,
    result_layout: RowLayout,
    timestamp_field: usize,
    value_field: usize,
    handler_index: usize,
    watermarks: Arc<WatermarkProcessor>,
}

impl WindowedAggregationStage {
    pub fn new(
        input_schema: &Schema,
        timestamp_field: &str,
        value_field: &str,
        handler_index: usize,
        watermarks: Arc<WatermarkProcessor>,
    ) -> Result<Self> {
        Ok(Self {
            input_layout: RowLayout::new(input_schema),
            result_layout: RowLayout::new(&window_result_schema()),
            timestamp_field: input_schema
                .field_index(timestamp_field)
                .map_err(RuntimeError::Common)?,
            value_field: input_schema
                .field_index(value_field)
                .map_err(RuntimeError::Common)?,
            handler_index,
            watermarks,
        })
    }

    fn handler<'a>(
        &self,
        ctx: &'a PipelineExecutionContext,
    ) -> Result<&'a WindowOperatorHandler> {
        ctx.operator_handler(self.handler_index)
            .and_then(|handler| handler.as_any().downcast_ref::<WindowOperatorHandler>())
            .ok_or_else(|| RuntimeError::PipelineExecution {
                pipeline_id: ctx.pipeline_id(),
                reason: "window stage without window operator handler".into(),
            })
    }
}

impl PipelineStage for WindowedAggregationStage {
    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<ExecutionResult> {
        // 1. Stash every record into the worker's shard of its slice.
        {
            let handler = self.handler(ctx)?;
            let reader = RowReader::new(&self.input_layout, buffer.data());
            for tuple in 0..buffer.num_tuples() as usize {
                let timestamp = reader
                    .read_u64(tuple, self.timestamp_field)
                    .map_err(RuntimeError::Common)?;
                let value = reader
                    .read_i64(tuple, self.value_field)
                    .map_err(RuntimeError::Common)?;
                handler.append(worker.worker_id(), timestamp, &value.to_le_bytes());
            }
        }

        // 2. Advance the per-origin tracker; the global watermark decides
        //    which slices are complete.
        let advanced = self.watermarks.update(
            buffer.origin_id(),
            buffer.sequence_number(),
            buffer.chunk_number(),
            buffer.is_last_chunk(),
            buffer.watermark(),
        );

        // 3. Combine and emit every closed window, chunked onto the input's
        //    sequence number.
        let triggered = self.handler(ctx)?.trigger_slices(advanced);
        let meta = *buffer.metadata();
        drop(buffer);
        let mut emitter = ChunkedEmitter::new(ctx, &meta, self.result_layout.tuple_size());
        let mut row = vec![0u8; self.result_layout.tuple_size()];
        for slice in triggered {
            let mut sum = 0i64;
            for record in slice.records.iter() {
                sum += i64::from_le_bytes(record.try_into().expect("8-byte record"));
            }
            let mut writer = RowWriter::new(&self.result_layout, &mut row);
            writer.write_u64(0, 0, slice.bounds.start).map_err(RuntimeError::Common)?;
            writer.write_u64(0, 1, slice.bounds.end).map_err(RuntimeError::Common)?;
            writer.write_i64(0, 2, sum).map_err(RuntimeError::Common)?;
            emitter.append_tuple(&row)?;
        }
        emitter.finish();
        Ok(ExecutionResult::Ok)
    }
}

#[cfg(test)]
mod tests {
    use nebulastream_common::buffer::BufferPool;
    use nebulastream_common::catalog::DataType;
    use nebulastream_common::types::{
        OriginId, PipelineId, QuerySubPlanId, SequenceNumber, Timestamp,
    };

    use super::*;
    use crate::executor::operator_handler::OperatorHandler;

    fn input_schema() -> Schema {
        Schema::empty()
            .with_field("ts", DataType::UInt64)
            .with_field("value", DataType::Int64)
    }

    struct Harness {
        input_pool: BufferPool,
        output_pool: BufferPool,
        handler: Arc<WindowOperatorHandler>,
        stage: WindowedAggregationStage,
        next_sequence: u64,
    }

    impl Harness {
        fn new(output_buffer_size: usize) -> Self {
            let handler = WindowOperatorHandler::new(1, 8, 100);
            let watermarks = Arc::new(WatermarkProcessor::new([OriginId(1)]));
            let stage = WindowedAggregationStage::new(
                &input_schema(),
                "ts",
                "value",
                0,
                watermarks,
            )
            .unwrap();
            Self {
                input_pool: BufferPool::new(16, 1024),
                output_pool: BufferPool::new(16, output_buffer_size),
                handler,
                stage,
                next_sequence: 1,
            }
        }

        fn context(&self) -> PipelineExecutionContext {
            PipelineExecutionContext::new(
                QuerySubPlanId(1),
                PipelineId(1),
                self.output_pool.clone(),
                vec![self.handler.clone() as Arc<dyn OperatorHandler>],
            )
        }

        /// Feed one buffer of (ts, value) rows with the given watermark and
        /// collect the emitted chunks.
        fn feed(&mut self, rows: &[(u64, i64)], watermark: Timestamp) -> Vec<TupleBuffer> {
            let layout = RowLayout::new(&input_schema());
            let mut buffer = self.input_pool.acquire();
            {
                let data = buffer.data_mut();
                let mut writer = RowWriter::new(&layout, data);
                for (i, (ts, value)) in rows.iter().enumerate() {
                    writer.write_u64(i, 0, *ts).unwrap();
                    writer.write_i64(i, 1, *value).unwrap();
                }
            }
            let creation_timestamp = buffer.metadata().creation_timestamp;
            *buffer.metadata_mut() = BufferMetadata {
                origin_id: OriginId(1),
                sequence_number: SequenceNumber(self.next_sequence),
                chunk_number: ChunkNumber::INITIAL,
                last_chunk: true,
                watermark,
                creation_timestamp,
                num_tuples: rows.len() as u32,
            };
            self.next_sequence += 1;

            let mut ctx = self.context();
            let mut worker = WorkerContext::new(0, self.output_pool.clone());
            self.stage
                .execute(buffer, &mut ctx, &mut worker)
                .unwrap();
            ctx.take_emitted()
        }
    }

    fn result_rows(buffers: &[TupleBuffer]) -> Vec<(u64, u64, i64)> {
        let layout = RowLayout::new(&window_result_schema());
        let mut rows = Vec::new();
        for buffer in buffers {
            let reader = RowReader::new(&layout, buffer.data());
            for i in 0..buffer.num_tuples() as usize {
                rows.push((
                    reader.read_u64(i, 0).unwrap(),
                    reader.read_u64(i, 1).unwrap(),
                    reader.read_i64(i, 2).unwrap(),
                ));
            }
        }
        rows
    }

    #[test]
    fn windows_close_when_the_watermark_passes() {
        let mut harness = Harness::new(1024);

        // All rows fall into [0, 100); the watermark has not passed it yet.
        let chunks = harness.feed(&[(10, 1), (20, 2), (30, 3)], 50);
        assert_eq!(result_rows(&chunks), vec![]);
        // Watermark-only chunk keeps downstream sequence tracking alive.
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].num_tuples(), 0);
        assert!(chunks[0].is_last_chunk());

        // The next buffer pushes the watermark past the first window.
        let chunks = harness.feed(&[(120, 7)], 150);
        assert_eq!(result_rows(&chunks), vec![(0, 100, 6)]);
        assert_eq!(chunks[0].sequence_number(), SequenceNumber(2));

        // And the second window closes later, containing only the 120.
        let chunks = harness.feed(&[(250, 1)], 300);
        assert_eq!(result_rows(&chunks), vec![(100, 200, 7), (200, 300, 1)]);
    }

    #[test]
    fn large_triggers_are_chunked_over_the_sequence_number() {
        // Room for exactly two 24-byte result rows per buffer.
        let mut harness = Harness::new(48);

        // Fill five distinct windows, then close them all at once.
        let rows: Vec<(u64, i64)> = (0..5).map(|w| (w * 100 + 1, w as i64)).collect();
        let none = harness.feed(&rows, 10);
        assert_eq!(result_rows(&none), vec![]);

        let chunks = harness.feed(&[(1000, 0)], 1000);
        // Five result rows over two-row buffers: chunks 1..=3.
        assert_eq!(chunks.len(), 3);
        let numbers: Vec<u32> = chunks.iter().map(|c| c.chunk_number().raw()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(!chunks[0].is_last_chunk());
        assert!(!chunks[1].is_last_chunk());
        assert!(chunks[2].is_last_chunk());
        // All chunks share the input's sequence number and partition its
        // output.
        assert!(chunks
            .iter()
            .all(|c| c.sequence_number() == chunks[0].sequence_number()));
        assert_eq!(result_rows(&chunks).len(), 5);
        let total: i64 = result_rows(&chunks).iter().map(|(_, _, sum)| sum).sum();
        assert_eq!(total, 0 + 1 + 2 + 3 + 4);
    }
}
