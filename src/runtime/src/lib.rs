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

//! Node-local pipelined execution runtime.
//!
//! Buffers flow from sources through the shared task queue into pipelines and
//! onwards to their successors; reconfiguration messages ride the same queue
//! so that control changes observe the task order at the time of issuance.

pub mod error;
pub mod executor;
pub mod monitor;
pub mod task;

pub use error::{Result, RuntimeError};
