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

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};

/// Node-wide runtime counters, registered into the embedder's registry.
#[derive(Clone)]
pub struct RuntimeMetrics {
    pub processed_tasks: IntCounter,
    pub processed_buffers: IntCounter,
    pub processed_tuples: IntCounter,
    pub reconfigurations: IntCounter,
    pub task_queue_depth: IntGauge,
}

impl RuntimeMetrics {
    pub fn new(registry: &Registry) -> Self {
        let processed_tasks = register_int_counter_with_registry!(
            "nebula_runtime_processed_tasks_total",
            "Tasks completed by the worker pool",
            registry
        )
        .unwrap();
        let processed_buffers = register_int_counter_with_registry!(
            "nebula_runtime_processed_buffers_total",
            "Data buffers pumped through pipelines",
            registry
        )
        .unwrap();
        let processed_tuples = register_int_counter_with_registry!(
            "nebula_runtime_processed_tuples_total",
            "Tuples carried by processed buffers",
            registry
        )
        .unwrap();
        let reconfigurations = register_int_counter_with_registry!(
            "nebula_runtime_reconfigurations_total",
            "Reconfiguration messages completed",
            registry
        )
        .unwrap();
        let task_queue_depth = register_int_gauge_with_registry!(
            "nebula_runtime_task_queue_depth",
            "Tasks currently waiting in the shared queue",
            registry
        )
        .unwrap();
        Self {
            processed_tasks,
            processed_buffers,
            processed_tuples,
            reconfigurations,
            task_queue_depth,
        }
    }

    /// Fresh metrics on a throwaway registry.
    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}
