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

//! Coordination core: topology and source catalog, logical plans, the global
//! execution plan, operator placement, decomposition with network linking,
//! and shared query plans amended change-log entry by entry.

pub mod catalog;
pub mod error;
pub mod model;
pub mod placement;
pub mod service;
pub mod shared;

pub use error::{MetaError, Result};
