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

//! Fixed-size, reference-counted tuple buffers and the pool that owns them.
//!
//! A [`TupleBuffer`] is a handle onto a byte segment plus routing metadata
//! (origin, sequence number, chunk number, watermark). Handles are cheap to
//! clone; the segment returns to its pool when the last handle drops. Mutable
//! access is only granted while the handle is unique, so shared ownership can
//! never alias a mutation.

use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::{CommonError, Result};
use crate::types::{ChunkNumber, OriginId, SequenceNumber, Timestamp};
use crate::util::current_time_micros;

/// Routing metadata carried by every buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferMetadata {
    pub origin_id: OriginId,
    pub sequence_number: SequenceNumber,
    pub chunk_number: ChunkNumber,
    pub last_chunk: bool,
    pub watermark: Timestamp,
    pub creation_timestamp: Timestamp,
    pub num_tuples: u32,
}

enum Recycler {
    /// Returns the segment to its pool on last release.
    Pooled(Weak<PoolShared>),
    /// Oversized one-off allocation; freed on last release.
    Unpooled,
}

struct BufferCore {
    data: Box<[u8]>,
    meta: BufferMetadata,
    recycler: Recycler,
}

/// Handle onto one buffer segment. Clone bumps the reference count; dropping
/// the last handle recycles (or frees) the segment.
pub struct TupleBuffer {
    // `None` only transiently inside `drop`.
    core: Option<Arc<BufferCore>>,
}

impl TupleBuffer {
    fn with_core(core: BufferCore) -> Self {
        Self {
            core: Some(Arc::new(core)),
        }
    }

    fn core(&self) -> &Arc<BufferCore> {
        self.core.as_ref().expect("buffer core present until drop")
    }

    /// Mutable core access; `None` while any other handle is alive.
    fn core_mut(&mut self) -> Option<&mut BufferCore> {
        Arc::get_mut(self.core.as_mut().expect("buffer core present until drop"))
    }

    pub fn capacity(&self) -> usize {
        self.core().data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.core().data
    }

    /// Mutable view of the segment.
    ///
    /// Panics if the handle is shared: a task must exclusively own a buffer
    /// before writing to it.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.core_mut() {
            Some(core) => &mut core.data,
            None => panic!("mutable access to a shared tuple buffer"),
        }
    }

    pub fn try_data_mut(&mut self) -> Option<&mut [u8]> {
        self.core_mut().map(|core| &mut core.data[..])
    }

    pub fn metadata(&self) -> &BufferMetadata {
        &self.core().meta
    }

    /// Mutable metadata access; same exclusivity rule as [`Self::data_mut`].
    pub fn metadata_mut(&mut self) -> &mut BufferMetadata {
        match self.core_mut() {
            Some(core) => &mut core.meta,
            None => panic!("mutable access to a shared tuple buffer"),
        }
    }

    pub fn origin_id(&self) -> OriginId {
        self.core().meta.origin_id
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.core().meta.sequence_number
    }

    pub fn chunk_number(&self) -> ChunkNumber {
        self.core().meta.chunk_number
    }

    pub fn is_last_chunk(&self) -> bool {
        self.core().meta.last_chunk
    }

    pub fn watermark(&self) -> Timestamp {
        self.core().meta.watermark
    }

    pub fn creation_timestamp(&self) -> Timestamp {
        self.core().meta.creation_timestamp
    }

    pub fn num_tuples(&self) -> u32 {
        self.core().meta.num_tuples
    }

    pub fn is_unpooled(&self) -> bool {
        matches!(self.core().recycler, Recycler::Unpooled)
    }

    /// Number of live handles onto this segment.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(self.core())
    }
}

impl Clone for TupleBuffer {
    fn clone(&self) -> Self {
        Self {
            core: Some(Arc::clone(self.core())),
        }
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        // `into_inner` yields the core only for the last handle.
        if let Some(core) = Arc::into_inner(core) {
            if let Recycler::Pooled(pool) = core.recycler {
                if let Some(pool) = pool.upgrade() {
                    pool.recycle(core.data);
                }
            }
        }
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("capacity", &self.capacity())
            .field("meta", self.metadata())
            .field("unpooled", &self.is_unpooled())
            .finish()
    }
}

struct PoolShared {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
}

impl PoolShared {
    fn recycle(&self, data: Box<[u8]>) {
        // Metadata is rebuilt from scratch on the next acquire; the segment
        // content is deliberately left as-is.
        self.free.lock().push(data);
        self.available.notify_one();
    }
}

/// Pool of `capacity` preallocated segments of `buffer_size` bytes each.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                capacity,
                free: Mutex::new(free),
                available: Condvar::new(),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn free_buffers(&self) -> usize {
        self.shared.free.lock().len()
    }

    fn wrap(&self, data: Box<[u8]>) -> TupleBuffer {
        TupleBuffer::with_core(BufferCore {
            data,
            meta: BufferMetadata {
                creation_timestamp: current_time_micros(),
                ..Default::default()
            },
            recycler: Recycler::Pooled(Arc::downgrade(&self.shared)),
        })
    }

    /// Blocks until a pooled buffer becomes available. This is the
    /// backpressure point: producers stall here when downstream is slow.
    pub fn acquire(&self) -> TupleBuffer {
        let mut free = self.shared.free.lock();
        loop {
            if let Some(data) = free.pop() {
                drop(free);
                return self.wrap(data);
            }
            self.shared.available.wait(&mut free);
        }
    }

    /// Non-blocking acquire; fails with [`CommonError::PoolExhausted`] when
    /// no buffer is free.
    pub fn try_acquire(&self) -> Result<TupleBuffer> {
        let data = self.shared.free.lock().pop();
        match data {
            Some(data) => Ok(self.wrap(data)),
            None => Err(CommonError::PoolExhausted),
        }
    }

    /// One-off allocation outside the pool, used for oversized control
    /// payloads. The memory is freed when the last handle drops.
    pub fn acquire_unpooled(&self, size: usize) -> TupleBuffer {
        TupleBuffer::with_core(BufferCore {
            data: vec![0u8; size].into_boxed_slice(),
            meta: BufferMetadata {
                creation_timestamp: current_time_micros(),
                ..Default::default()
            },
            recycler: Recycler::Unpooled,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn try_acquire_fails_on_exhausted_pool() {
        let pool = BufferPool::new(1, 64);
        let held = pool.try_acquire().unwrap();
        assert_eq!(pool.free_buffers(), 0);
        assert_eq!(pool.try_acquire().unwrap_err(), CommonError::PoolExhausted);
        drop(held);
        assert_eq!(pool.free_buffers(), 1);
    }

    #[test]
    fn empty_pool_always_fails_non_blocking() {
        let pool = BufferPool::new(0, 64);
        assert_eq!(pool.try_acquire().unwrap_err(), CommonError::PoolExhausted);
    }

    #[test]
    fn blocking_acquire_wakes_on_release() {
        let pool = BufferPool::new(1, 64);
        let held = pool.acquire();

        let (tx, rx) = mpsc::channel();
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            let buffer = pool2.acquire();
            tx.send(()).unwrap();
            drop(buffer);
        });

        // The waiter must be parked while we hold the only buffer.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn clone_blocks_mutation_until_unique_again() {
        let pool = BufferPool::new(1, 64);
        let mut buffer = pool.acquire();
        buffer.data_mut()[0] = 17;

        let other = buffer.clone();
        assert_eq!(buffer.reference_count(), 2);
        assert!(buffer.try_data_mut().is_none());
        assert_eq!(pool.free_buffers(), 0);

        drop(other);
        assert_eq!(buffer.reference_count(), 1);
        buffer.data_mut()[1] = 42;
        assert_eq!(&buffer.data()[..2], &[17, 42]);
    }

    #[test]
    fn release_resets_metadata_but_not_content() {
        let pool = BufferPool::new(1, 64);
        let mut buffer = pool.acquire();
        buffer.data_mut()[0] = 0xAB;
        {
            let meta = buffer.metadata_mut();
            meta.origin_id = OriginId(3);
            meta.sequence_number = SequenceNumber(9);
            meta.chunk_number = ChunkNumber(2);
            meta.last_chunk = true;
            meta.watermark = 1234;
            meta.num_tuples = 5;
        }
        drop(buffer);

        let reacquired = pool.acquire();
        assert_eq!(reacquired.origin_id(), OriginId::default());
        assert_eq!(reacquired.sequence_number(), SequenceNumber::default());
        assert_eq!(reacquired.num_tuples(), 0);
        assert!(!reacquired.is_last_chunk());
        // Content is not zeroed on release.
        assert_eq!(reacquired.data()[0], 0xAB);
    }

    #[test]
    fn oversized_request_bypasses_the_pool() {
        let pool = BufferPool::new(1, 64);
        let big = pool.acquire_unpooled(1024);
        assert!(big.is_unpooled());
        assert_eq!(big.capacity(), 1024);
        assert_eq!(pool.free_buffers(), 1);
        drop(big);
        assert_eq!(pool.free_buffers(), 1);
    }
}
