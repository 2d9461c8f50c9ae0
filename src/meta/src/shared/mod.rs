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

//! Shared query plans, their change logs and the amendment phase.

pub mod amendment;
pub mod change_log;
pub mod shared_query_plan;

use std::collections::{BTreeMap, BTreeSet};

use nebulastream_common::types::{OperatorId, QueryId, SharedQueryId};

use crate::error::{MetaError, Result};
use crate::model::logical_plan::QueryPlan;
use crate::model::IdGenerator;
use crate::placement::PlacementStrategyKind;

pub use amendment::{DeploymentAction, DeploymentContext, PlacementAmendmentPhase};
pub use change_log::{ChangeLog, ChangeLogEntry};
pub use shared_query_plan::{
    ContainmentRelationship, MatchedOperatorPair, SharedQueryPlan, SharedQueryPlanStatus,
};

/// Find the maximal operators of `target` whose structural signature already
/// exists in the shared plan: the deepest equivalent prefix. A match on a
/// non-root operator means the incoming query can reuse the host's upstream
/// chain wholesale.
pub fn find_matches(shared: &SharedQueryPlan, target: &QueryPlan) -> Vec<MatchedOperatorPair> {
    let host_index = shared.signature_index();
    let target_signatures = target.signatures();

    let candidates: BTreeSet<OperatorId> = target_signatures
        .iter()
        .filter(|(_, signature)| host_index.contains_key(signature))
        .map(|(id, _)| *id)
        .collect();

    let mut pairs = Vec::new();
    for id in &candidates {
        let Ok(operator) = target.operator(*id) else {
            continue;
        };
        // Keep only the topmost matches; everything below them is implied.
        if operator.parents.iter().any(|p| candidates.contains(p)) {
            continue;
        }
        let signature = target_signatures[id];
        let host = host_index[&signature]
            .iter()
            .next()
            .copied()
            .expect("index entries are non-empty");
        pairs.push(MatchedOperatorPair {
            host,
            target: *id,
            containment: ContainmentRelationship::Equality,
        });
    }
    pairs
}

/// All shared query plans known to the coordinator.
#[derive(Default)]
pub struct GlobalQueryPlan {
    shared_plans: BTreeMap<SharedQueryId, SharedQueryPlan>,
    query_index: BTreeMap<QueryId, SharedQueryId>,
}

impl GlobalQueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a logical query: merged into an equivalent shared plan when the
    /// signatures allow it, otherwise wrapped into a new one. Returns the
    /// shared id and whether a merge happened.
    pub fn add_query(
        &mut self,
        ids: &IdGenerator,
        query_id: QueryId,
        plan: &QueryPlan,
        strategy: PlacementStrategyKind,
    ) -> Result<(SharedQueryId, bool)> {
        for (shared_id, shared) in &mut self.shared_plans {
            if shared.placement_strategy() != strategy
                || shared.status() == SharedQueryPlanStatus::Stopped
            {
                continue;
            }
            let matches = find_matches(shared, plan);
            if !matches.is_empty() {
                shared.add_query(query_id, plan, &matches)?;
                self.query_index.insert(query_id, *shared_id);
                tracing::info!(%query_id, shared_query_id = %shared_id, "query merged");
                return Ok((*shared_id, true));
            }
        }
        let shared_id = ids.next_shared_query_id();
        self.shared_plans.insert(
            shared_id,
            SharedQueryPlan::new(shared_id, query_id, plan, strategy),
        );
        self.query_index.insert(query_id, shared_id);
        tracing::info!(%query_id, shared_query_id = %shared_id, "new shared query plan");
        Ok((shared_id, false))
    }

    pub fn remove_query(&mut self, query_id: QueryId) -> Result<SharedQueryId> {
        let shared_id = self
            .query_index
            .remove(&query_id)
            .ok_or(MetaError::UnknownQuery(query_id))?;
        let shared = self
            .shared_plans
            .get_mut(&shared_id)
            .ok_or(MetaError::UnknownSharedQuery(shared_id))?;
        shared.remove_query(query_id)?;
        Ok(shared_id)
    }

    pub fn shared_plan(&self, shared_id: SharedQueryId) -> Result<&SharedQueryPlan> {
        self.shared_plans
            .get(&shared_id)
            .ok_or(MetaError::UnknownSharedQuery(shared_id))
    }

    pub fn shared_plan_mut(&mut self, shared_id: SharedQueryId) -> Result<&mut SharedQueryPlan> {
        self.shared_plans
            .get_mut(&shared_id)
            .ok_or(MetaError::UnknownSharedQuery(shared_id))
    }

    pub fn shared_plans_mut(&mut self) -> impl Iterator<Item = &mut SharedQueryPlan> {
        self.shared_plans.values_mut()
    }

    pub fn shared_query_for(&self, query_id: QueryId) -> Option<SharedQueryId> {
        self.query_index.get(&query_id).copied()
    }
}
