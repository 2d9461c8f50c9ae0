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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use nebulastream_common::types::Timestamp;
use nebulastream_common::util::current_time_micros;

/// Per-subplan processing counters, updated by workers after each completed
/// task and served on the control plane.
#[derive(Default)]
pub struct QueryStatistics {
    processed_tasks: AtomicU64,
    processed_buffers: AtomicU64,
    processed_tuples: AtomicU64,
    start_time: AtomicU64,
}

impl QueryStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        self.start_time
            .store(current_time_micros(), Ordering::Release);
    }

    pub fn record_task(&self, tuples: u64, is_reconfiguration: bool) {
        self.processed_tasks.fetch_add(1, Ordering::Relaxed);
        if !is_reconfiguration {
            self.processed_buffers.fetch_add(1, Ordering::Relaxed);
            self.processed_tuples.fetch_add(tuples, Ordering::Relaxed);
        }
    }

    pub fn processed_tasks(&self) -> u64 {
        self.processed_tasks.load(Ordering::Relaxed)
    }

    pub fn processed_buffers(&self) -> u64 {
        self.processed_buffers.load(Ordering::Relaxed)
    }

    pub fn processed_tuples(&self) -> u64 {
        self.processed_tuples.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueryStatisticsSnapshot {
        QueryStatisticsSnapshot {
            processed_tasks: self.processed_tasks(),
            processed_buffers: self.processed_buffers(),
            processed_tuples: self.processed_tuples(),
            start_time: self.start_time.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time copy of [`QueryStatistics`]; the payload of the
/// `GetQueryStatistics` control-plane reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatisticsSnapshot {
    pub processed_tasks: u64,
    pub processed_buffers: u64,
    pub processed_tuples: u64,
    pub start_time: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = QueryStatistics::new();
        stats.record_task(10, false);
        stats.record_task(5, false);
        stats.record_task(0, true);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed_tasks, 3);
        assert_eq!(snapshot.processed_buffers, 2);
        assert_eq!(snapshot.processed_tuples, 15);
    }
}
