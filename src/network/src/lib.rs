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

//! Cross-node plumbing: the data-plane wire protocol with its network
//! source/sink pair, and the control-plane RPC between coordinator and
//! workers.

pub mod error;
pub mod protocol;
pub mod rpc;
pub mod sink;
pub mod source;

pub use error::{NetworkError, Result};
