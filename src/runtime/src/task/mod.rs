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

//! Task scheduling: the shared MPMC queue, the worker pool that pumps it,
//! reconfiguration messages riding the queue in-band, and the per-origin
//! ordering trackers (watermark processor, sequence shredder).

pub mod executable_plan;
pub mod query_manager;
pub mod queue;
pub mod reconfiguration;
pub mod sequence_shredder;
pub mod statistics;
pub mod watermark;

use std::sync::Arc;

use nebulastream_common::buffer::TupleBuffer;

use crate::executor::pipeline::Pipeline;
use crate::task::reconfiguration::ReconfigurationMessage;

/// One unit of work on the shared queue.
pub enum Task {
    /// Pump one buffer through a pipeline.
    Data {
        pipeline: Arc<Pipeline>,
        buffer: TupleBuffer,
    },
    /// In-band control message; one copy per worker thread.
    Reconfiguration { message: Arc<ReconfigurationMessage> },
}

impl Task {
    pub fn is_reconfiguration(&self) -> bool {
        matches!(self, Task::Reconfiguration { .. })
    }
}
