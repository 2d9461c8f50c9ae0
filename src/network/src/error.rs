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

#[derive(Error, Debug)]
pub enum NetworkError {
    /// The peer went away; deploy/undeploy calls retry this a bounded number
    /// of times before giving up.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error("rpc failed: {0}")]
    Rpc(String),
}

impl From<serde_json::Error> for NetworkError {
    fn from(error: serde_json::Error) -> Self {
        NetworkError::Codec(error.to_string())
    }
}

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;
