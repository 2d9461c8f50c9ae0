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

//! Coordinator-side data model: topology, logical plans and the global
//! execution plan. Graphs are arenas of id-indexed nodes; edges are id lists
//! (no shared-pointer cycles).

pub mod execution_plan;
pub mod logical_plan;
pub mod topology;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nebulastream_common::types::{OperatorId, PlanVersion, QueryId, QuerySubPlanId, SharedQueryId};

/// Monotone id source shared by everything the coordinator creates.
/// Operator ids must stay unique across all plans, or shared-plan merging
/// would collide.
#[derive(Debug)]
pub struct IdGenerator {
    next_operator: AtomicU32,
    next_query: AtomicU32,
    next_shared_query: AtomicU32,
    next_sub_plan: AtomicU32,
    next_version: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next_operator: AtomicU32::new(1),
            next_query: AtomicU32::new(1),
            next_shared_query: AtomicU32::new(1),
            next_sub_plan: AtomicU32::new(1),
            next_version: AtomicU64::new(1),
        }
    }

    pub fn next_operator_id(&self) -> OperatorId {
        OperatorId(self.next_operator.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_query_id(&self) -> QueryId {
        QueryId(self.next_query.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_shared_query_id(&self) -> SharedQueryId {
        SharedQueryId(self.next_shared_query.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_sub_plan_id(&self) -> QuerySubPlanId {
        QuerySubPlanId(self.next_sub_plan.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_version(&self) -> PlanVersion {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}
