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

//! Per-origin watermark and sequence/chunk tracking.
//!
//! The task queue preserves no ordering between buffers of the same origin;
//! this processor restores it by tracking, per origin, the largest contiguous
//! prefix of fully received sequence numbers (all chunks present, last chunk
//! seen). The global watermark is the minimum across origins of the prefix
//! watermark and only ever moves forward.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use nebulastream_common::types::{
    ChunkNumber, OriginId, SequenceNumber, Timestamp, EOS_WATERMARK,
};

#[derive(Default)]
struct SequenceProgress {
    chunks_seen: u32,
    /// Total chunk count, known once the last chunk arrived.
    total_chunks: Option<u32>,
    max_watermark: Timestamp,
}

impl SequenceProgress {
    fn is_complete(&self) -> bool {
        matches!(self.total_chunks, Some(total) if self.chunks_seen >= total)
    }
}

struct OriginPending {
    /// Next sequence number whose completion extends the prefix.
    next_sequence: u64,
    sequences: BTreeMap<u64, SequenceProgress>,
    prefix_watermark: Timestamp,
}

struct OriginState {
    pending: Mutex<OriginPending>,
    /// Watermark of the fully received prefix, readable without the lock.
    completed_watermark: AtomicU64,
    retired: AtomicBool,
}

/// Tracks watermarks across a fixed set of input origins.
pub struct WatermarkProcessor {
    origins: HashMap<OriginId, OriginState>,
    global: AtomicU64,
}

impl WatermarkProcessor {
    pub fn new(origins: impl IntoIterator<Item = OriginId>) -> Self {
        let origins: HashMap<_, _> = origins
            .into_iter()
            .map(|origin| {
                (
                    origin,
                    OriginState {
                        pending: Mutex::new(OriginPending {
                            next_sequence: SequenceNumber::INITIAL.raw(),
                            sequences: BTreeMap::new(),
                            prefix_watermark: 0,
                        }),
                        completed_watermark: AtomicU64::new(0),
                        retired: AtomicBool::new(false),
                    },
                )
            })
            .collect();
        Self {
            origins,
            global: AtomicU64::new(0),
        }
    }

    pub fn current_watermark(&self) -> Timestamp {
        self.global.load(Ordering::Acquire)
    }

    pub fn origin_watermark(&self, origin: OriginId) -> Option<Timestamp> {
        self.origins
            .get(&origin)
            .map(|state| state.completed_watermark.load(Ordering::Acquire))
    }

    /// Record one buffer of `origin` and return the (possibly advanced)
    /// global watermark. A watermark of [`EOS_WATERMARK`] retires the origin
    /// from the minimum.
    pub fn update(
        &self,
        origin: OriginId,
        sequence_number: SequenceNumber,
        chunk_number: ChunkNumber,
        last_chunk: bool,
        watermark: Timestamp,
    ) -> Timestamp {
        let Some(state) = self.origins.get(&origin) else {
            tracing::warn!(%origin, "watermark update for unknown origin");
            return self.current_watermark();
        };

        if watermark == EOS_WATERMARK {
            state.retired.store(true, Ordering::Release);
            state
                .completed_watermark
                .store(EOS_WATERMARK, Ordering::Release);
            return self.advance_global();
        }

        {
            let mut pending = state.pending.lock();
            let progress = pending
                .sequences
                .entry(sequence_number.raw())
                .or_default();
            progress.chunks_seen += 1;
            progress.max_watermark = progress.max_watermark.max(watermark);
            if last_chunk {
                progress.total_chunks = Some(chunk_number.raw());
            }

            // Extend the contiguous prefix of fully received sequences.
            while pending
                .sequences
                .get(&pending.next_sequence)
                .is_some_and(SequenceProgress::is_complete)
            {
                let next_sequence = pending.next_sequence;
                let done = pending
                    .sequences
                    .remove(&next_sequence)
                    .expect("checked above");
                pending.prefix_watermark = pending.prefix_watermark.max(done.max_watermark);
                pending.next_sequence += 1;
            }

            let prefix = pending.prefix_watermark;
            state.completed_watermark.store(prefix, Ordering::Release);
        }

        self.advance_global()
    }

    /// CAS-max loop keeping the global watermark monotone while it chases the
    /// minimum across non-retired origins. Once every origin retired, the
    /// watermark stays at its last value.
    fn advance_global(&self) -> Timestamp {
        let Some(minimum) = self
            .origins
            .values()
            .filter(|state| !state.retired.load(Ordering::Acquire))
            .map(|state| state.completed_watermark.load(Ordering::Acquire))
            .min()
        else {
            return self.global.load(Ordering::Acquire);
        };

        let mut current = self.global.load(Ordering::Acquire);
        while minimum > current {
            match self.global.compare_exchange(
                current,
                minimum,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return minimum,
                Err(actual) => current = actual,
            }
        }
        current
    }
}
