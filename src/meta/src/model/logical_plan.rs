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

//! Logical query plans.
//!
//! Operators form a DAG stored as an arena keyed by operator id; children
//! point upstream (towards sources), parents downstream (towards sinks).
//! Operators are immutable after parsing except for the placement
//! annotations (pinned node, placed flag, operator state).

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use nebulastream_common::catalog::Schema;
use nebulastream_common::types::{OperatorId, QueryId, WorkerId};
use nebulastream_network::protocol::{NesPartition, NodeLocation};

use crate::error::{MetaError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Field(String),
    Literal(i64),
    Eq(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn literal(value: i64) -> Self {
        Expr::Literal(value)
    }

    pub fn eq(self, other: Expr) -> Self {
        Expr::Eq(Box::new(self), Box::new(other))
    }

    pub fn gt(self, other: Expr) -> Self {
        Expr::Gt(Box::new(self), Box::new(other))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorKind {
    Source {
        logical_source: String,
        schema: Schema,
    },
    Filter {
        predicate: Expr,
    },
    Map {
        field: String,
        expr: Expr,
    },
    Window {
        size_ms: u64,
        slide_ms: u64,
        function: AggregateFunction,
        field: String,
    },
    Join {
        predicate: Expr,
    },
    Sink {
        name: String,
    },
    /// Receiving half of a cross-node edge; inserted by the decomposer.
    NetworkSource {
        partition: NesPartition,
        schema: Schema,
    },
    /// Sending half of a cross-node edge; inserted by the decomposer.
    NetworkSink {
        partition: NesPartition,
        destination: NodeLocation,
    },
}

impl OperatorKind {
    pub fn is_source(&self) -> bool {
        matches!(self, OperatorKind::Source { .. } | OperatorKind::NetworkSource { .. })
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, OperatorKind::Sink { .. } | OperatorKind::NetworkSink { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(
            self,
            OperatorKind::NetworkSource { .. } | OperatorKind::NetworkSink { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Source { .. } => "Source",
            OperatorKind::Filter { .. } => "Filter",
            OperatorKind::Map { .. } => "Map",
            OperatorKind::Window { .. } => "Window",
            OperatorKind::Join { .. } => "Join",
            OperatorKind::Sink { .. } => "Sink",
            OperatorKind::NetworkSource { .. } => "NetworkSource",
            OperatorKind::NetworkSink { .. } => "NetworkSink",
        }
    }
}

/// Placement lifecycle of one operator inside a shared plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorState {
    #[default]
    ToBePlaced,
    Placed,
    ToBeReplaced,
    ToBeRemoved,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalOperator {
    pub id: OperatorId,
    pub kind: OperatorKind,
    /// Upstream neighbours (towards sources).
    pub children: Vec<OperatorId>,
    /// Downstream neighbours (towards sinks).
    pub parents: Vec<OperatorId>,
    pub pinned_node_id: Option<WorkerId>,
    pub placed: bool,
    pub state: OperatorState,
}

impl LogicalOperator {
    fn new(id: OperatorId, kind: OperatorKind) -> Self {
        Self {
            id,
            kind,
            children: Vec::new(),
            parents: Vec::new(),
            pinned_node_id: None,
            placed: false,
            state: OperatorState::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    query_id: QueryId,
    operators: BTreeMap<OperatorId, LogicalOperator>,
    roots: Vec<OperatorId>,
}

impl QueryPlan {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            operators: BTreeMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn set_query_id(&mut self, query_id: QueryId) {
        self.query_id = query_id;
    }

    /// Insert an operator above the given children. Operators without
    /// parents are roots (sinks, typically).
    pub fn add_operator(
        &mut self,
        id: OperatorId,
        kind: OperatorKind,
        children: &[OperatorId],
    ) -> OperatorId {
        let mut node = LogicalOperator::new(id, kind);
        node.children = children.to_vec();
        for child in children {
            if let Some(child_node) = self.operators.get_mut(child) {
                child_node.parents.push(id);
            }
            self.roots.retain(|r| r != child);
        }
        self.operators.insert(id, node);
        self.roots.push(id);
        id
    }

    /// Raw arena insert used by shared-plan merging; the operator's edges
    /// must already be consistent with the arena.
    pub fn insert_operator(&mut self, operator: LogicalOperator) {
        if operator.parents.is_empty() && !self.roots.contains(&operator.id) {
            self.roots.push(operator.id);
        }
        self.operators.insert(operator.id, operator);
    }

    pub fn operator(&self, id: OperatorId) -> Result<&LogicalOperator> {
        self.operators.get(&id).ok_or(MetaError::UnknownOperator(id))
    }

    pub fn operator_mut(&mut self, id: OperatorId) -> Result<&mut LogicalOperator> {
        self.operators
            .get_mut(&id)
            .ok_or(MetaError::UnknownOperator(id))
    }

    pub fn contains(&self, id: OperatorId) -> bool {
        self.operators.contains_key(&id)
    }

    pub fn operators(&self) -> impl Iterator<Item = &LogicalOperator> {
        self.operators.values()
    }

    pub fn operator_ids(&self) -> Vec<OperatorId> {
        self.operators.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn root_operators(&self) -> Vec<OperatorId> {
        self.roots.clone()
    }

    pub fn leaf_operators(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.children.is_empty())
            .map(|op| op.id)
            .collect()
    }

    pub fn add_root(&mut self, id: OperatorId) {
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    pub fn remove_as_root(&mut self, id: OperatorId) {
        self.roots.retain(|r| *r != id);
    }

    /// Wire `parent` downstream of `child`.
    pub fn add_edge(&mut self, child: OperatorId, parent: OperatorId) -> Result<()> {
        {
            let child_node = self.operator_mut(child)?;
            if !child_node.parents.contains(&parent) {
                child_node.parents.push(parent);
            }
        }
        let parent_node = self.operator_mut(parent)?;
        if !parent_node.children.contains(&child) {
            parent_node.children.push(child);
        }
        self.roots.retain(|r| *r != child);
        Ok(())
    }

    pub fn remove_edge(&mut self, child: OperatorId, parent: OperatorId) -> Result<()> {
        self.operator_mut(child)?.parents.retain(|p| *p != parent);
        self.operator_mut(parent)?.children.retain(|c| *c != child);
        Ok(())
    }

    pub fn remove_operator(&mut self, id: OperatorId) -> Result<LogicalOperator> {
        let node = self
            .operators
            .remove(&id)
            .ok_or(MetaError::UnknownOperator(id))?;
        for child in &node.children {
            if let Some(c) = self.operators.get_mut(child) {
                c.parents.retain(|p| *p != id);
            }
        }
        for parent in &node.parents {
            if let Some(p) = self.operators.get_mut(parent) {
                p.children.retain(|c| *c != id);
            }
        }
        self.roots.retain(|r| *r != id);
        Ok(node)
    }

    /// Upstream closure of `start` (towards sources), excluding `start`.
    pub fn upstream_of(&self, start: OperatorId) -> BTreeSet<OperatorId> {
        self.closure(start, |op| &op.children)
    }

    /// Downstream closure of `start` (towards sinks), excluding `start`.
    pub fn downstream_of(&self, start: OperatorId) -> BTreeSet<OperatorId> {
        self.closure(start, |op| &op.parents)
    }

    fn closure(
        &self,
        start: OperatorId,
        next: impl Fn(&LogicalOperator) -> &Vec<OperatorId>,
    ) -> BTreeSet<OperatorId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.operators.get(&current) {
                for n in next(node) {
                    if seen.insert(*n) {
                        queue.push_back(*n);
                    }
                }
            }
        }
        seen
    }

    /// Operators lying between the two frontiers, endpoints included: every
    /// operator downstream of some upstream-frontier operator and upstream of
    /// some downstream-frontier operator.
    pub fn operators_between(
        &self,
        upstream: &BTreeSet<OperatorId>,
        downstream: &BTreeSet<OperatorId>,
    ) -> BTreeSet<OperatorId> {
        let mut above_upstream: BTreeSet<OperatorId> = upstream.clone();
        for u in upstream {
            above_upstream.extend(self.downstream_of(*u));
        }
        let mut below_downstream: BTreeSet<OperatorId> = downstream.clone();
        for d in downstream {
            below_downstream.extend(self.upstream_of(*d));
        }
        above_upstream
            .intersection(&below_downstream)
            .copied()
            .collect()
    }

    /// Structural hash signature of the subtree rooted at `id`: the operator
    /// kind combined with the sorted signatures of its children. Equal
    /// signatures mean structurally equivalent upstream computation.
    pub fn signature(&self, id: OperatorId) -> Result<u64> {
        let mut memo = BTreeMap::new();
        self.signature_memo(id, &mut memo)
    }

    fn signature_memo(&self, id: OperatorId, memo: &mut BTreeMap<OperatorId, u64>) -> Result<u64> {
        if let Some(sig) = memo.get(&id) {
            return Ok(*sig);
        }
        let node = self.operator(id)?;
        let mut child_signatures = Vec::with_capacity(node.children.len());
        for child in &node.children {
            child_signatures.push(self.signature_memo(*child, memo)?);
        }
        child_signatures.sort_unstable();
        let mut hasher = DefaultHasher::new();
        node.kind.hash(&mut hasher);
        child_signatures.hash(&mut hasher);
        let signature = hasher.finish();
        memo.insert(id, signature);
        Ok(signature)
    }

    /// Signatures of every operator in the plan.
    pub fn signatures(&self) -> BTreeMap<OperatorId, u64> {
        let mut memo = BTreeMap::new();
        for id in self.operators.keys() {
            let _ = self.signature_memo(*id, &mut memo);
        }
        memo
    }

    /// Walk upstream to the nearest source to determine the record layout
    /// flowing out of `id`. Shape-preserving operators pass their first
    /// child's schema through.
    pub fn output_schema(&self, id: OperatorId) -> Option<Schema> {
        let node = self.operators.get(&id)?;
        match &node.kind {
            OperatorKind::Source { schema, .. } | OperatorKind::NetworkSource { schema, .. } => {
                Some(schema.clone())
            }
            _ => node
                .children
                .first()
                .and_then(|child| self.output_schema(*child)),
        }
    }
}

#[cfg(test)]
mod tests {
    use nebulastream_common::catalog::DataType;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::IdGenerator;

    fn filter_plan(ids: &IdGenerator) -> (QueryPlan, OperatorId, OperatorId, OperatorId) {
        let schema = Schema::empty().with_field("f1", DataType::Int64);
        let mut plan = QueryPlan::new(QueryId(1));
        let source = plan.add_operator(
            ids.next_operator_id(),
            OperatorKind::Source {
                logical_source: "cars".into(),
                schema,
            },
            &[],
        );
        let filter = plan.add_operator(
            ids.next_operator_id(),
            OperatorKind::Filter {
                predicate: Expr::field("f1").eq(Expr::literal(5)),
            },
            &[source],
        );
        let sink = plan.add_operator(
            ids.next_operator_id(),
            OperatorKind::Sink { name: "out".into() },
            &[filter],
        );
        (plan, source, filter, sink)
    }

    #[test]
    fn roots_and_leaves() {
        let ids = IdGenerator::new();
        let (plan, source, _, sink) = filter_plan(&ids);
        assert_eq!(plan.root_operators(), vec![sink]);
        assert_eq!(plan.leaf_operators(), vec![source]);
    }

    #[test]
    fn closures_and_between() {
        let ids = IdGenerator::new();
        let (plan, source, filter, sink) = filter_plan(&ids);
        assert_eq!(plan.upstream_of(sink), BTreeSet::from([source, filter]));
        assert_eq!(plan.downstream_of(source), BTreeSet::from([filter, sink]));
        let between = plan.operators_between(
            &BTreeSet::from([source]),
            &BTreeSet::from([sink]),
        );
        assert_eq!(between, BTreeSet::from([source, filter, sink]));
    }

    #[test]
    fn equal_prefixes_have_equal_signatures() {
        let ids = IdGenerator::new();
        let (plan_a, _, filter_a, sink_a) = filter_plan(&ids);
        let (plan_b, _, filter_b, sink_b) = filter_plan(&ids);
        assert_eq!(
            plan_a.signature(filter_a).unwrap(),
            plan_b.signature(filter_b).unwrap()
        );
        // Sinks with the same name are structurally equal too; a different
        // predicate breaks equality.
        assert_eq!(
            plan_a.signature(sink_a).unwrap(),
            plan_b.signature(sink_b).unwrap()
        );

        let mut plan_c = QueryPlan::new(QueryId(3));
        let source = plan_c.add_operator(
            ids.next_operator_id(),
            OperatorKind::Source {
                logical_source: "cars".into(),
                schema: Schema::empty().with_field("f1", DataType::Int64),
            },
            &[],
        );
        let other_filter = plan_c.add_operator(
            ids.next_operator_id(),
            OperatorKind::Filter {
                predicate: Expr::field("f1").gt(Expr::literal(10)),
            },
            &[source],
        );
        assert_ne!(
            plan_a.signature(filter_a).unwrap(),
            plan_c.signature(other_filter).unwrap()
        );
    }

    #[test]
    fn serde_round_trip_preserves_structure_and_annotations() {
        let ids = IdGenerator::new();
        let (mut plan, source, _, _) = filter_plan(&ids);
        {
            let op = plan.operator_mut(source).unwrap();
            op.pinned_node_id = Some(WorkerId(3));
            op.placed = true;
            op.state = OperatorState::Placed;
        }
        let json = serde_json::to_string(&plan).unwrap();
        let back: QueryPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn output_schema_flows_from_the_source() {
        let ids = IdGenerator::new();
        let (plan, _, filter, sink) = filter_plan(&ids);
        assert_eq!(plan.output_schema(filter).unwrap().tuple_size(), 8);
        assert_eq!(plan.output_schema(sink).unwrap().len(), 1);
    }
}
