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

//! Spanning-tuple resolution for variable-length inputs.
//!
//! A source cuts its raw byte stream into buffers at arbitrary positions, so
//! a tuple may span several consecutive buffers. Buffers arrive on parallel
//! worker threads in any order; the shredder detects, without serializing the
//! stream, the inclusive sequence-number interval whose concatenation holds
//! one spanning tuple.
//!
//! Coordination runs over a ring of `WIDTH` slots, one per in-flight sequence
//! number. Each slot carries a single atomic word:
//!
//! - bits 0..32: iteration tag (sequence number / WIDTH) guarding against ABA
//!   across ring wrap-arounds,
//! - bit 32: the slot has been indexed,
//! - bit 33: the buffer contains a tuple delimiter,
//! - bit 34: the span starting at this slot has been claimed.
//!
//! A span runs between two delimiter buffers `a < b` with only
//! non-delimiter buffers in between. Any thread that observes the complete
//! span (both endpoints plus all interior slots indexed) races a CAS on the
//! claim bit of the start slot `a`; the winner emits the interval exactly
//! once. Claiming strictly after observing completeness is what makes the
//! last-publishing thread a guaranteed witness, so no span is lost.
//!
//! Slot reclamation uses a parity byte per slot use (leading/trailing) in a
//! `2×WIDTH` tail vector; the tail only advances over slots whose both uses
//! were released, and admission of a sequence number beyond `tail + WIDTH`
//! fails with `SequenceOutOfRange`, which upstream treats as backpressure.
//!
//! The tuple delimiter is a single byte (e.g. `\n`); offsets in
//! [`StagedBuffer`] refer to it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use static_assertions::const_assert;

use nebulastream_common::buffer::TupleBuffer;
use nebulastream_common::types::SequenceNumber;

use crate::error::{Result, RuntimeError};

/// Ring width; sequence numbers are admitted within `[tail, tail + WIDTH)`.
pub const WIDTH: usize = 1024;
const_assert!(WIDTH.is_power_of_two());

const TAG_MASK: u64 = 0xFFFF_FFFF;
const INDEXED_BIT: u64 = 1 << 32;
const DELIMITER_BIT: u64 = 1 << 33;
const CLAIMED_BIT: u64 = 1 << 34;

fn tag_of(state: u64) -> u32 {
    (state & TAG_MASK) as u32
}

fn iteration_tag(abs: u64) -> u32 {
    (abs / WIDTH as u64) as u32
}

/// Parity marker meaning "this use of the slot is released for the given
/// iteration". Alternates between iterations so cells never need clearing.
fn release_marker(abs: u64) -> u8 {
    (((abs / WIDTH as u64) + 1) % 2) as u8
}

/// A raw input buffer staged for spanning-tuple assembly.
#[derive(Clone)]
pub struct StagedBuffer {
    pub buffer: TupleBuffer,
    /// Bytes of payload in `buffer`.
    pub size_in_bytes: u32,
    /// Offset of the first tuple delimiter; meaningful only when the buffer
    /// has one.
    pub offset_of_first_delimiter: u32,
    /// Offset of the last tuple delimiter; meaningful only when the buffer
    /// has one.
    pub offset_of_last_delimiter: u32,
}

impl StagedBuffer {
    pub fn with_delimiters(
        buffer: TupleBuffer,
        size_in_bytes: u32,
        offset_of_first_delimiter: u32,
        offset_of_last_delimiter: u32,
    ) -> Self {
        Self {
            buffer,
            size_in_bytes,
            offset_of_first_delimiter,
            offset_of_last_delimiter,
        }
    }

    pub fn without_delimiter(buffer: TupleBuffer, size_in_bytes: u32) -> Self {
        Self {
            buffer,
            size_in_bytes,
            offset_of_first_delimiter: 0,
            offset_of_last_delimiter: 0,
        }
    }

    /// Bytes after the last delimiter: the head of a spanning tuple.
    fn trailing_size(&self) -> u32 {
        self.size_in_bytes - self.offset_of_last_delimiter - 1
    }

    /// Bytes before the first delimiter: the tail of a spanning tuple.
    fn leading_size(&self) -> u32 {
        self.offset_of_first_delimiter
    }
}

/// One resolved spanning tuple: the inclusive buffer interval `[start, end]`
/// plus the staged buffers contributing bytes, in sequence order.
pub struct SpanningTuple {
    pub start: SequenceNumber,
    pub end: SequenceNumber,
    pub buffers: Vec<StagedBuffer>,
}

#[derive(Default)]
struct Stash {
    /// Consumed by the span this buffer terminates (or fully sits in).
    leading: Option<StagedBuffer>,
    /// Consumed by the span this buffer starts.
    trailing: Option<StagedBuffer>,
}

struct Slot {
    state: AtomicU64,
    stash: Mutex<Stash>,
}

/// Per-source spanning-tuple resolver. See the module docs for the protocol.
pub struct SequenceShredder {
    slots: Box<[Slot]>,
    /// Two parity cells per slot: `2*i` leading use, `2*i + 1` trailing use.
    tail_cells: Box<[AtomicU8]>,
    tail: AtomicU64,
}

impl SequenceShredder {
    pub fn new() -> Self {
        let slots: Box<[Slot]> = (0..WIDTH)
            .map(|_| Slot {
                state: AtomicU64::new(0),
                stash: Mutex::new(Stash::default()),
            })
            .collect();
        let tail_cells: Box<[AtomicU8]> = (0..2 * WIDTH).map(|_| AtomicU8::new(0)).collect();

        // Absolute index 0 is the stream-start sentinel: an indexed delimiter
        // slot with no bytes, so the leading part of the first real buffer
        // resolves like any other spanning tuple. Its leading use is released
        // up front; the trailing use releases with the first span.
        slots[0]
            .state
            .store(INDEXED_BIT | DELIMITER_BIT, Ordering::Release);
        tail_cells[0].store(release_marker(0), Ordering::Release);

        Self {
            slots,
            tail_cells,
            tail: AtomicU64::new(0),
        }
    }

    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    fn slot(&self, abs: u64) -> &Slot {
        &self.slots[(abs % WIDTH as u64) as usize]
    }

    fn cell(&self, abs: u64, trailing: bool) -> &AtomicU8 {
        let base = 2 * ((abs % WIDTH as u64) as usize);
        &self.tail_cells[base + trailing as usize]
    }

    fn release_use(&self, abs: u64, trailing: bool) {
        self.cell(abs, trailing)
            .store(release_marker(abs), Ordering::Release);
    }

    fn both_uses_released(&self, abs: u64) -> bool {
        let marker = release_marker(abs);
        self.cell(abs, false).load(Ordering::Acquire) == marker
            && self.cell(abs, true).load(Ordering::Acquire) == marker
    }

    /// Checks the admission window, advancing the tail over fully released
    /// slots if needed. Callers treat `false` as upstream backpressure.
    pub fn is_in_range(&self, sequence_number: SequenceNumber) -> bool {
        self.try_admit(sequence_number.raw()).is_ok()
    }

    fn try_admit(&self, s: u64) -> Result<()> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if s + 1 <= tail + WIDTH as u64 {
                return Ok(());
            }
            let mut progress = 0u64;
            while progress < WIDTH as u64 && self.both_uses_released(tail + progress) {
                progress += 1;
            }
            if progress == 0 {
                return Err(RuntimeError::SequenceOutOfRange {
                    sequence_number: SequenceNumber(s),
                    tail,
                });
            }
            // On a lost race another thread advanced for us; re-check either way.
            let _ = self.tail.compare_exchange(
                tail,
                tail + progress,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn is_valid_at(&self, state: u64, abs: u64) -> bool {
        tag_of(state) == iteration_tag(abs) && state & INDEXED_BIT != 0
    }

    /// Nearest delimiter slot below `s` with all slots in between indexed and
    /// delimiter-free. `None` when an unindexed slot interrupts the walk.
    fn scan_left(&self, s: u64) -> Option<u64> {
        for off in 1..WIDTH as u64 {
            if off > s {
                return None;
            }
            let abs = s - off;
            let state = self.slot(abs).state.load(Ordering::Acquire);
            if !self.is_valid_at(state, abs) {
                return None;
            }
            if state & DELIMITER_BIT != 0 {
                return Some(abs);
            }
        }
        None
    }

    fn scan_right(&self, s: u64) -> Option<u64> {
        for off in 1..WIDTH as u64 {
            let abs = s + off;
            let state = self.slot(abs).state.load(Ordering::Acquire);
            if !self.is_valid_at(state, abs) {
                return None;
            }
            if state & DELIMITER_BIT != 0 {
                return Some(abs);
            }
        }
        None
    }

    /// Try to win the span starting at `abs`; only one thread succeeds per
    /// iteration of the slot.
    fn claim(&self, abs: u64) -> bool {
        let slot = self.slot(abs);
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if !self.is_valid_at(state, abs)
                || state & DELIMITER_BIT == 0
                || state & CLAIMED_BIT != 0
            {
                return false;
            }
            match slot.state.compare_exchange(
                state,
                state | CLAIMED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Resolve the claimed span `[a, b]`: take the contributing stashes,
    /// release the slot uses, and build the interval. Returns `None` when the
    /// span carries no bytes at all (delimiter flush against a buffer edge).
    fn collect_span(&self, a: u64, b: u64) -> Option<SpanningTuple> {
        let a_staged = if a == 0 {
            None
        } else {
            self.slot(a).stash.lock().trailing.take()
        };
        let a_trailing_empty = a_staged
            .as_ref()
            .map_or(true, |staged| staged.trailing_size() == 0);

        let mut middles = Vec::new();
        for abs in a + 1..b {
            let mut stash = self.slot(abs).stash.lock();
            if let Some(staged) = stash.leading.take() {
                middles.push(staged);
            }
            stash.trailing = None;
        }

        let b_staged = self.slot(b).stash.lock().leading.take();
        let b_leading_empty = b_staged
            .as_ref()
            .map_or(true, |staged| staged.leading_size() == 0);

        self.release_use(a, true);
        for abs in a + 1..b {
            self.release_use(abs, false);
            self.release_use(abs, true);
        }
        self.release_use(b, false);

        // With an empty head the interval starts at the first contributing
        // buffer instead of the delimiter slot.
        let lo = if a_trailing_empty { a + 1 } else { a };
        if lo == b && b_leading_empty {
            return None;
        }

        let mut buffers = Vec::with_capacity((b - lo + 1) as usize);
        if let Some(staged) = a_staged {
            if !a_trailing_empty {
                buffers.push(staged);
            }
        }
        buffers.extend(middles);
        if let Some(staged) = b_staged {
            buffers.push(staged);
        }

        Some(SpanningTuple {
            start: SequenceNumber(lo),
            end: SequenceNumber(b),
            buffers,
        })
    }

    /// Index one staged buffer under its sequence number and emit every
    /// spanning tuple this buffer completes. Intervals for the same sequence
    /// number come out leading side first, then trailing.
    pub fn process_sequence_number(
        &self,
        staged: StagedBuffer,
        sequence_number: SequenceNumber,
        has_delimiter: bool,
    ) -> Result<Vec<SpanningTuple>> {
        let s = sequence_number.raw();
        debug_assert!(s >= SequenceNumber::INITIAL.raw());
        self.try_admit(s)?;

        {
            let mut stash = self.slot(s).stash.lock();
            stash.leading = Some(staged.clone());
            stash.trailing = Some(staged);
        }
        let mut state = iteration_tag(s) as u64 | INDEXED_BIT;
        if has_delimiter {
            state |= DELIMITER_BIT;
        }
        self.slot(s).state.store(state, Ordering::Release);

        let mut spans = Vec::new();
        if has_delimiter {
            if let Some(a) = self.scan_left(s) {
                if self.claim(a) {
                    spans.extend(self.collect_span(a, s));
                }
            }
            if let Some(b) = self.scan_right(s) {
                if self.claim(s) {
                    spans.extend(self.collect_span(s, b));
                }
            }
        } else if let Some(a) = self.scan_left(s) {
            if let Some(b) = self.scan_right(s) {
                if self.claim(a) {
                    spans.extend(self.collect_span(a, b));
                }
            }
        }
        Ok(spans)
    }
}

impl Default for SequenceShredder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64 as TestCounter;
    use std::sync::Arc;

    use nebulastream_common::buffer::BufferPool;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn staged(pool: &BufferPool, content: &[u8]) -> (StagedBuffer, Option<(u32, u32)>) {
        let mut buffer = pool.acquire_unpooled(content.len().max(1));
        buffer.data_mut()[..content.len()].copy_from_slice(content);
        let first = content.iter().position(|b| *b == b'\n');
        let last = content.iter().rposition(|b| *b == b'\n');
        match (first, last) {
            (Some(first), Some(last)) => (
                StagedBuffer::with_delimiters(
                    buffer,
                    content.len() as u32,
                    first as u32,
                    last as u32,
                ),
                Some((first as u32, last as u32)),
            ),
            _ => (
                StagedBuffer::without_delimiter(buffer, content.len() as u32),
                None,
            ),
        }
    }

    fn process(
        shredder: &SequenceShredder,
        pool: &BufferPool,
        sn: u64,
        content: &[u8],
    ) -> Vec<SpanningTuple> {
        let (buffer, delimiters) = staged(pool, content);
        shredder
            .process_sequence_number(buffer, SequenceNumber(sn), delimiters.is_some())
            .unwrap()
    }

    /// Concatenate the bytes a span contributes: the trailing slice of its
    /// head delimiter buffer, interior buffers in full, and the leading slice
    /// of its tail delimiter buffer.
    fn span_bytes(span: &SpanningTuple) -> Vec<u8> {
        let mut bytes = Vec::new();
        let n = span.buffers.len();
        for (i, staged) in span.buffers.iter().enumerate() {
            let data = &staged.buffer.data()[..staged.size_in_bytes as usize];
            let has_delimiter = data.contains(&b'\n');
            let (from, to) = if n == 1 {
                (0, staged.offset_of_first_delimiter as usize)
            } else if i == 0 && has_delimiter {
                (staged.offset_of_last_delimiter as usize + 1, data.len())
            } else if i + 1 == n && has_delimiter {
                (0, staged.offset_of_first_delimiter as usize)
            } else {
                (0, data.len())
            };
            bytes.extend_from_slice(&data[from..to]);
        }
        bytes
    }

    #[test]
    fn spanning_tuple_across_two_buffers() {
        let pool = BufferPool::new(0, 8);
        let shredder = SequenceShredder::new();

        // SN 1 carries a trailing partial tuple, no delimiter.
        let spans = process(&shredder, &pool, 1, b"abc");
        assert!(spans.is_empty());

        // SN 2 completes it.
        let spans = process(&shredder, &pool, 2, b"def\n");
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.start, SequenceNumber(1));
        assert_eq!(span.end, SequenceNumber(2));
        assert_eq!(span.buffers.len(), 2);
        assert_eq!(span_bytes(span), b"abcdef");

        // SN 3 terminates flush against SN 2's delimiter: no spanning
        // interval touches SN 2, only SN 3's own leading bytes come out.
        let spans = process(&shredder, &pool, 3, b"ghi\n");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, SequenceNumber(3));
        assert_eq!(spans[0].end, SequenceNumber(3));
        assert_eq!(span_bytes(&spans[0]), b"ghi");
    }

    #[test]
    fn out_of_order_arrival_resolves_on_last_witness() {
        let pool = BufferPool::new(0, 8);
        let shredder = SequenceShredder::new();

        // SN 1 resolves its own leading bytes against the stream start.
        let spans = process(&shredder, &pool, 1, b"x\nhead");
        assert_eq!(spans.len(), 1);
        assert_eq!(span_bytes(&spans[0]), b"x");

        // The far delimiter endpoint arrives before the interior buffer:
        // [1,3] cannot resolve yet, SN 2 is missing.
        assert!(process(&shredder, &pool, 3, b"tail\ny").is_empty());

        // The interior buffer is the last witness and wins the span.
        let spans = process(&shredder, &pool, 2, b"middle");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, SequenceNumber(1));
        assert_eq!(spans[0].end, SequenceNumber(3));
        assert_eq!(span_bytes(&spans[0]), b"headmiddletail");
    }

    #[test]
    fn window_boundary_admission() {
        let pool = BufferPool::new(0, 8);
        let shredder = SequenceShredder::new();

        // Highest admissible sequence number for tail = 0.
        assert!(shredder.is_in_range(SequenceNumber(WIDTH as u64 - 1)));
        // One past the window with nothing reclaimable fails.
        let (buffer, _) = staged(&pool, b"zz\nz");
        let result = shredder.process_sequence_number(
            buffer,
            SequenceNumber(WIDTH as u64),
            true,
        );
        assert!(matches!(
            result,
            Err(RuntimeError::SequenceOutOfRange { tail: 0, .. })
        ));

        // Resolving the first span releases the sentinel slot, the tail
        // advances, and the same sequence number is admitted.
        let spans = process(&shredder, &pool, 1, b"a\nrest");
        assert_eq!(spans.len(), 1);
        assert!(shredder.is_in_range(SequenceNumber(WIDTH as u64)));
        assert!(shredder.tail() >= 1);
    }

    #[test]
    fn multi_threaded_checksum() {
        // Port of the exhaustive shredder stress test: random delimiter
        // placement, N threads pulling sequence numbers from a shared
        // counter. Every span [lo, hi] contributes hi - lo; spans tile the
        // delimiter chain, so the contributions add up to upper - 1.
        const THREADS: usize = 4;
        const UPPER: u64 = 5000;

        let pool = BufferPool::new(0, 8);
        let shredder = Arc::new(SequenceShredder::new());
        let next = Arc::new(TestCounter::new(1));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let shredder = Arc::clone(&shredder);
                let next = Arc::clone(&next);
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(0xC0FFEE + t as u64);
                    let mut checksum = 0u64;
                    loop {
                        let s = next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        if s > UPPER {
                            return checksum;
                        }
                        // Force delimiters at both ends of the range so every
                        // span closes.
                        let delimiter = rng.gen_bool(0.5) || s == 1 || s == UPPER;
                        let content: &[u8] = if delimiter { b"a\nb\nc" } else { b"abc" };
                        loop {
                            let (buffer, _) = staged(&pool, content);
                            match shredder.process_sequence_number(
                                buffer,
                                SequenceNumber(s),
                                delimiter,
                            ) {
                                Ok(spans) => {
                                    for span in &spans {
                                        checksum += span.end.raw() - span.start.raw();
                                    }
                                    break;
                                }
                                Err(RuntimeError::SequenceOutOfRange { .. }) => {
                                    std::thread::yield_now();
                                }
                                Err(other) => panic!("unexpected error: {other}"),
                            }
                        }
                    }
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, UPPER - 1);
    }
}
