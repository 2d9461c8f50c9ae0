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

//! Pipelines, their execution kernels and the long-lived operator state they
//! carry.

pub mod operator_handler;
pub mod pipeline;
pub mod sink;
pub mod stage;
pub mod test_utils;
pub mod window;

pub use operator_handler::OperatorHandler;
pub use pipeline::{Pipeline, PipelineState};
pub use stage::{ExecutionResult, PipelineExecutionContext, PipelineStage, WorkerContext};
