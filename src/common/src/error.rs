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

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Non-blocking acquire on an exhausted buffer pool.
    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unknown field {field} in schema")]
    UnknownField { field: String },
}

pub type Result<T, E = CommonError> = std::result::Result<T, E>;
