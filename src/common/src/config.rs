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

//! Runtime and coordinator configuration.
//!
//! Configuration *loading* is the embedder's job; these structs only define
//! the tunables and their defaults.

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Size of one pooled tuple buffer in bytes.
    pub buffer_size: usize,
    /// Number of buffers preallocated in the global pool.
    pub buffers_in_pool: usize,
    /// Number of worker threads pumping the task queue.
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            buffers_in_pool: 1024,
            worker_threads: 4,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(CommonError::Configuration(
                "buffer_size must be non-zero".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(CommonError::Configuration(
                "worker_threads must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Re-plan shared query plans delta-by-delta instead of from scratch.
    pub incremental_placement: bool,
    /// How often a deploy/undeploy RPC is retried after a disconnect.
    pub deploy_retries: u32,
    /// Backoff between deploy retries in milliseconds.
    pub deploy_retry_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            incremental_placement: true,
            deploy_retries: 3,
            deploy_retry_backoff_ms: 100,
        }
    }
}
