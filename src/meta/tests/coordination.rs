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

//! Coordinator-level scenarios: placement through the control-plane surface,
//! cross-node network pairs, two-query merging and placement failure.

use std::collections::{BTreeMap, BTreeSet};

use nebulastream_common::catalog::{DataType, Schema};
use nebulastream_common::types::WorkerId;
use nebulastream_meta::model::logical_plan::{
    Expr, OperatorKind, OperatorState, QueryPlan,
};
use nebulastream_meta::placement::PlacementStrategyKind;
use nebulastream_meta::service::Coordinator;
use nebulastream_meta::shared::{DeploymentAction, DeploymentContext, SharedQueryPlanStatus};
use nebulastream_network::protocol::NesPartition;
use nebulastream_network::rpc::{
    ControlService, NodeType, RegisterNodeRequest, RegisterPhysicalSourceRequest, ReplyPayload,
};

fn schema() -> Schema {
    Schema::empty().with_field("f1", DataType::Int64)
}

fn register_worker(coordinator: &Coordinator, host: &str, slots: u32) -> WorkerId {
    let reply = coordinator.register_node(RegisterNodeRequest {
        address: host.into(),
        grpc_port: 9000,
        data_port: 9001,
        cpu_count: slots,
        node_type: NodeType::Worker,
        properties: BTreeMap::new(),
    });
    assert!(reply.success);
    match reply.payload {
        Some(ReplyPayload::WorkerId(id)) => id,
        _ => panic!("register_node reply without worker id"),
    }
}

fn register_source_on(coordinator: &Coordinator, worker: WorkerId) {
    assert!(coordinator
        .register_logical_source("cars".into(), schema())
        .success);
    assert!(coordinator
        .register_physical_source(RegisterPhysicalSourceRequest {
            worker_id: worker,
            physical_name: "cars_phys".into(),
            logical_name: "cars".into(),
            source_type: "csv".into(),
            config: BTreeMap::new(),
        })
        .success);
}

fn filter_query(coordinator: &Coordinator, sink_name: &str) -> QueryPlan {
    let ids = coordinator.ids();
    let mut plan = QueryPlan::new(ids.next_query_id());
    let source = plan.add_operator(
        ids.next_operator_id(),
        OperatorKind::Source {
            logical_source: "cars".into(),
            schema: schema(),
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
    plan.add_operator(
        ids.next_operator_id(),
        OperatorKind::Sink {
            name: sink_name.into(),
        },
        &[filter],
    );
    plan
}

fn network_pairs(contexts: &[DeploymentContext]) -> (Vec<NesPartition>, Vec<NesPartition>) {
    let mut sinks = Vec::new();
    let mut sources = Vec::new();
    for context in contexts {
        if context.action == DeploymentAction::Undeploy {
            continue;
        }
        for operator in context.sub_plan.operators.values() {
            match &operator.kind {
                OperatorKind::NetworkSink { partition, .. } => sinks.push(*partition),
                OperatorKind::NetworkSource { partition, .. } => sources.push(*partition),
                _ => {}
            }
        }
    }
    sinks.sort();
    sources.sort();
    (sinks, sources)
}

/// S1: one sink node, one source node, filter between them. Slots are one
/// each; the sink is zero-cost, the filter takes the sink node's slot.
#[test]
fn single_source_filter_placement() -> anyhow::Result<()> {
    let coordinator = Coordinator::new();
    let n1 = register_worker(&coordinator, "n1", 1);
    let n2 = register_worker(&coordinator, "n2", 1);
    assert!(coordinator.add_parent(n2, n1).success);
    register_source_on(&coordinator, n2);

    let plan = filter_query(&coordinator, "sink");
    let (shared_id, contexts) =
        coordinator.submit_query(plan, PlacementStrategyKind::BottomUp)?;

    // Two sub plans, one per node, connected by exactly one network pair.
    let deploys: Vec<_> = contexts
        .iter()
        .filter(|c| c.action == DeploymentAction::Deploy)
        .collect();
    assert_eq!(deploys.len(), 2);
    let (sinks, sources) = network_pairs(&contexts);
    assert_eq!(sinks.len(), 1);
    assert_eq!(sinks, sources);

    // Every pinned operator sits on a node with remaining slots >= 0, and
    // nothing is left unplaced.
    coordinator.with_shared_plan(shared_id, |shared| {
        for operator in shared.plan().operators() {
            assert_eq!(operator.state, OperatorState::Placed);
            assert!(operator.pinned_node_id.is_some());
        }
    })?;
    let topology = coordinator.topology().lock();
    assert_eq!(topology.free_slots(n2)?, 0); // source
    assert_eq!(topology.free_slots(n1)?, 0); // filter; sink is free
    drop(topology);

    assert_eq!(
        coordinator.with_shared_plan(shared_id, |s| s.status())?,
        SharedQueryPlanStatus::Processed
    );
    Ok(())
}

/// S2: an intermediate node between source and sink, filter pinned to the
/// sink node. The transit node bridges with a network source/sink pair.
#[test]
fn cross_node_network_pair_with_transit_bridge() -> anyhow::Result<()> {
    let coordinator = Coordinator::new();
    let n1 = register_worker(&coordinator, "n1", 4);
    let n3 = register_worker(&coordinator, "n3", 4);
    let n2 = register_worker(&coordinator, "n2", 4);
    assert!(coordinator.add_parent(n3, n1).success);
    assert!(coordinator.add_parent(n2, n3).success);
    register_source_on(&coordinator, n2);

    let mut plan = filter_query(&coordinator, "sink");
    // Pin the filter (and the sink) to n1.
    let filter_id = plan
        .operators()
        .find(|op| matches!(op.kind, OperatorKind::Filter { .. }))
        .map(|op| op.id)
        .unwrap();
    plan.operator_mut(filter_id)?.pinned_node_id = Some(n1);

    let (_, contexts) = coordinator.submit_query(plan, PlacementStrategyKind::BottomUp)?;

    let by_worker: BTreeMap<WorkerId, &DeploymentContext> = contexts
        .iter()
        .filter(|c| c.action == DeploymentAction::Deploy)
        .map(|c| (c.worker_id, c))
        .collect();
    assert_eq!(by_worker.len(), 3);

    let kinds = |worker: WorkerId| -> Vec<&'static str> {
        let mut names: Vec<_> = by_worker[&worker]
            .sub_plan
            .operators
            .values()
            .map(|op| op.kind.name())
            .collect();
        names.sort();
        names
    };
    assert_eq!(kinds(n2), vec!["NetworkSink", "Source"]);
    assert_eq!(kinds(n3), vec!["NetworkSink", "NetworkSource"]);
    assert_eq!(kinds(n1), vec!["Filter", "NetworkSource", "Sink"]);

    // Each NesPartition appears in exactly one matching sink/source pair.
    let (sinks, sources) = network_pairs(&contexts);
    assert_eq!(sinks, sources);
    let unique: BTreeSet<_> = sinks.iter().collect();
    assert_eq!(unique.len(), sinks.len());
    assert_eq!(sinks.len(), 2);
    Ok(())
}

/// S3: two queries with an identical prefix merge into one shared plan with
/// two sink branches.
#[test]
fn two_query_merge() -> anyhow::Result<()> {
    let coordinator = Coordinator::new();
    let n1 = register_worker(&coordinator, "n1", 4);
    let n2 = register_worker(&coordinator, "n2", 4);
    assert!(coordinator.add_parent(n2, n1).success);
    register_source_on(&coordinator, n2);

    let plan_a = filter_query(&coordinator, "sinkA");
    let query_a = plan_a.query_id();
    let (shared_a, _) = coordinator.submit_query(plan_a, PlacementStrategyKind::BottomUp)?;

    let plan_b = filter_query(&coordinator, "sinkB");
    let query_b = plan_b.query_id();
    let (shared_b, contexts_b) =
        coordinator.submit_query(plan_b, PlacementStrategyKind::BottomUp)?;

    // Same shared plan; one source+filter feeding two sink branches.
    assert_eq!(shared_a, shared_b);
    coordinator
        .with_shared_plan(shared_b, |shared| {
            let sources = shared
                .plan()
                .operators()
                .filter(|op| matches!(op.kind, OperatorKind::Source { .. }))
                .count();
            let filters = shared
                .plan()
                .operators()
                .filter(|op| matches!(op.kind, OperatorKind::Filter { .. }))
                .count();
            let sinks = shared
                .plan()
                .operators()
                .filter(|op| matches!(op.kind, OperatorKind::Sink { .. }))
                .count();
            assert_eq!((sources, filters, sinks), (1, 1, 2));
            assert!(shared.contains_query(query_a));
            assert!(shared.contains_query(query_b));
        })?;

    // B's amendment re-deploys both changed nodes as updates.
    assert!(!contexts_b.is_empty());
    assert!(contexts_b
        .iter()
        .all(|c| c.action == DeploymentAction::Update));

    // Stopping B leaves A's branch deployed.
    let stop_contexts = coordinator.stop_query(query_b)?;
    assert!(stop_contexts
        .iter()
        .any(|c| c.action == DeploymentAction::Undeploy));
    coordinator.with_shared_plan(shared_a, |shared| {
        assert!(shared.contains_query(query_a));
        assert!(!shared.contains_query(query_b));
        let sinks = shared
            .plan()
            .operators()
            .filter(|op| matches!(op.kind, OperatorKind::Sink { .. }))
            .count();
        assert_eq!(sinks, 1);
    })?;
    Ok(())
}

/// S6: pinned sources with no topology path to the pinned sink. Placement
/// fails, the plan is PartiallyProcessed and carries no partial annotations.
#[test]
fn unreachable_sink_fails_without_partial_annotations() -> anyhow::Result<()> {
    let coordinator = Coordinator::new();
    let n1 = register_worker(&coordinator, "n1", 4);
    let n2 = register_worker(&coordinator, "n2", 4);
    let n3 = register_worker(&coordinator, "n3", 4);
    // No edges at all: the leaves cannot reach the root.
    register_source_on(&coordinator, n2);
    assert!(coordinator
        .register_physical_source(RegisterPhysicalSourceRequest {
            worker_id: n3,
            physical_name: "cars_phys_2".into(),
            logical_name: "cars".into(),
            source_type: "csv".into(),
            config: BTreeMap::new(),
        })
        .success);
    let _ = n1;

    // Two source operators, so both leaves end up pinned.
    let ids = coordinator.ids();
    let mut plan = QueryPlan::new(ids.next_query_id());
    let left = plan.add_operator(
        ids.next_operator_id(),
        OperatorKind::Source {
            logical_source: "cars".into(),
            schema: schema(),
        },
        &[],
    );
    let right = plan.add_operator(
        ids.next_operator_id(),
        OperatorKind::Source {
            logical_source: "cars".into(),
            schema: schema(),
        },
        &[],
    );
    let join = plan.add_operator(
        ids.next_operator_id(),
        OperatorKind::Join {
            predicate: Expr::field("f1").eq(Expr::field("f1")),
        },
        &[left, right],
    );
    plan.add_operator(
        ids.next_operator_id(),
        OperatorKind::Sink {
            name: "sink".into(),
        },
        &[join],
    );

    let (shared_id, contexts) = coordinator.submit_query(plan, PlacementStrategyKind::BottomUp)?;

    assert!(contexts.is_empty());
    coordinator.with_shared_plan(shared_id, |shared| {
        assert_eq!(shared.status(), SharedQueryPlanStatus::PartiallyProcessed);
        for operator in shared.plan().operators() {
            assert!(!operator.placed);
            assert_ne!(operator.state, OperatorState::Placed);
        }
    })?;
    // The failed entry is retried by the next pass (and fails again).
    let retry = coordinator.amend_all()?;
    assert!(retry.is_empty());
    Ok(())
}

/// Amending with an empty change log is a no-op.
#[test]
fn empty_amendment_is_idempotent() -> anyhow::Result<()> {
    let coordinator = Coordinator::new();
    let n1 = register_worker(&coordinator, "n1", 4);
    let n2 = register_worker(&coordinator, "n2", 4);
    assert!(coordinator.add_parent(n2, n1).success);
    register_source_on(&coordinator, n2);

    let plan = filter_query(&coordinator, "sink");
    let (_, contexts) = coordinator.submit_query(plan, PlacementStrategyKind::BottomUp)?;
    assert!(!contexts.is_empty());

    assert!(coordinator.amend_all()?.is_empty());
    assert!(coordinator.amend_all()?.is_empty());
    Ok(())
}

/// The coordinator snapshot restores workers and logical sources.
#[test]
fn snapshot_round_trip() -> anyhow::Result<()> {
    let coordinator = Coordinator::new();
    let n1 = register_worker(&coordinator, "n1", 4);
    register_source_on(&coordinator, n1);

    let snapshot = coordinator.snapshot();
    let restored = Coordinator::restore(&snapshot)?;
    assert!(restored.catalog().lock().contains_logical_source("cars"));
    assert!(restored.topology().lock().contains(n1));
    Ok(())
}
