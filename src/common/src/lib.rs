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

//! Building blocks shared by the execution runtime and the coordination core:
//! typed identifiers, fixed-width schemas, the reference-counted tuple-buffer
//! pool and the runtime configuration.

pub mod buffer;
pub mod catalog;
pub mod config;
pub mod error;
pub mod row;
pub mod types;
pub mod util;

pub use error::{CommonError, Result};
