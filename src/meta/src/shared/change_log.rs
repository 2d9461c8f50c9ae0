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

//! Timestamped deltas over a shared query plan.
//!
//! Every merge, removal or re-placement appends one entry holding the
//! upstream and downstream frontier of the modified region. Entries are
//! totally ordered by timestamp; the amendment phase consumes them in order
//! and re-records the ones that failed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use nebulastream_common::types::{OperatorId, Timestamp};
use nebulastream_common::util::current_time_micros;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub timestamp: Timestamp,
    /// Upstream frontier of the modified region (towards sources).
    pub upstream: BTreeSet<OperatorId>,
    /// Downstream frontier of the modified region (towards sinks).
    pub downstream: BTreeSet<OperatorId>,
}

impl ChangeLogEntry {
    pub fn new(upstream: BTreeSet<OperatorId>, downstream: BTreeSet<OperatorId>) -> Self {
        Self {
            timestamp: current_time_micros(),
            upstream,
            downstream,
        }
    }
}

#[derive(Default)]
pub struct ChangeLog {
    entries: BTreeMap<Timestamp, ChangeLogEntry>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; colliding timestamps shift forward to keep the
    /// total order.
    pub fn add_entry(&mut self, mut entry: ChangeLogEntry) {
        while self.entries.contains_key(&entry.timestamp) {
            entry.timestamp += 1;
        }
        self.entries.insert(entry.timestamp, entry);
    }

    /// All entries at or before `timestamp`, oldest first.
    pub fn entries_before(&self, timestamp: Timestamp) -> Vec<ChangeLogEntry> {
        self.entries
            .range(..=timestamp)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn has_pending_before(&self, timestamp: Timestamp) -> bool {
        self.entries.range(..=timestamp).next().is_some()
    }

    /// Drop every entry processed up to `timestamp`.
    pub fn update_processed_timestamp(&mut self, timestamp: Timestamp) {
        self.entries = self.entries.split_off(&(timestamp + 1));
    }

    /// Re-insert failed entries with fresh timestamps so a later pass
    /// retries them.
    pub fn record_failed_entries(&mut self, entries: Vec<ChangeLogEntry>) {
        for entry in entries {
            self.add_entry(ChangeLogEntry::new(entry.upstream, entry.downstream));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(up: u32, down: u32) -> ChangeLogEntry {
        ChangeLogEntry::new(
            BTreeSet::from([OperatorId(up)]),
            BTreeSet::from([OperatorId(down)]),
        )
    }

    #[test]
    fn entries_come_out_in_timestamp_order() {
        let mut log = ChangeLog::new();
        log.add_entry(entry(1, 2));
        log.add_entry(entry(3, 4));
        let entries = log.entries_before(current_time_micros() + 10);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].timestamp < entries[1].timestamp);
    }

    #[test]
    fn processed_entries_are_compacted_away() {
        let mut log = ChangeLog::new();
        log.add_entry(entry(1, 2));
        let cutoff = current_time_micros() + 10;
        log.update_processed_timestamp(cutoff);
        assert!(log.is_empty());
        assert!(!log.has_pending_before(cutoff + 1_000_000));
    }

    #[test]
    fn failed_entries_reappear_with_later_timestamps() {
        let mut log = ChangeLog::new();
        log.add_entry(entry(1, 2));
        let failed = log.entries_before(current_time_micros() + 10);
        log.update_processed_timestamp(current_time_micros() + 10);
        log.record_failed_entries(failed.clone());
        assert_eq!(log.len(), 1);
        let retried = log.entries_before(current_time_micros() + 20);
        assert_eq!(retried[0].upstream, failed[0].upstream);
        assert!(retried[0].timestamp >= failed[0].timestamp);
    }
}
