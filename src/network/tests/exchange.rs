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

//! Wire-level round trips: a network sink/source pair bridging two runtimes,
//! and the control-plane request/reply loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nebulastream_common::config::RuntimeConfig;
use nebulastream_common::types::{
    ChunkNumber, OperatorId, OriginId, PipelineId, QueryId, QuerySubPlanId, SequenceNumber,
    WorkerId,
};
use nebulastream_runtime::executor::pipeline::Pipeline;
use nebulastream_runtime::executor::sink::{DataSink, SinkStage};
use nebulastream_runtime::executor::test_utils::{CollectingSink, PassThroughStage};
use nebulastream_runtime::monitor::RuntimeMetrics;
use nebulastream_runtime::task::executable_plan::{DataSource, ExecutableQueryPlan};
use nebulastream_runtime::task::query_manager::QueryManager;
use nebulastream_network::protocol::{NesPartition, NodeLocation};
use nebulastream_network::rpc::{
    serve_control, ControlClient, ControlReply, ControlService, RegisterNodeRequest, NodeType,
    ReplyPayload,
};
use nebulastream_network::sink::NetworkSink;
use nebulastream_network::source::{DataExchangeService, NetworkSource};
use nebulastream_network::NetworkError;

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// A buffer written into a network sink arrives at the paired source with
/// all six routing attributes intact.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffer_attributes_survive_the_wire() {
    let partition = NesPartition::new(QueryId(3), OperatorId(77), 0, 1);

    // Receiving side: exchange endpoint feeding a passthrough pipeline.
    let manager = QueryManager::new(
        RuntimeConfig {
            worker_threads: 1,
            buffers_in_pool: 16,
            buffer_size: 256,
        },
        RuntimeMetrics::for_test(),
    )
    .unwrap();
    manager.start().unwrap();

    let exchange = DataExchangeService::new();
    let (data_addr, _accept) = exchange.serve_on("127.0.0.1:0").await.unwrap();

    let collecting = CollectingSink::new();
    let plan_id = QuerySubPlanId(1);
    let sink_pipeline = Pipeline::new(
        PipelineId(2),
        QueryId(3),
        plan_id,
        vec![OriginId(9)],
        vec![],
        SinkStage::new(collecting.clone()),
        vec![],
    );
    let head = Pipeline::new(
        PipelineId(1),
        QueryId(3),
        plan_id,
        vec![OriginId(9)],
        vec![PipelineId(2)],
        Arc::new(PassThroughStage),
        vec![],
    );
    let network_source = NetworkSource::new(
        OperatorId(50),
        OriginId(9),
        partition,
        exchange.clone(),
        manager.buffer_pool().clone(),
    );
    let sources: Vec<Arc<dyn DataSource>> = vec![network_source];
    let sinks: Vec<Arc<dyn DataSink>> = vec![collecting.clone()];
    let plan =
        ExecutableQueryPlan::new(plan_id, QueryId(3), sources, sinks, vec![head, sink_pipeline]);
    manager.register_query(plan).unwrap();

    let manager_for_start = manager.clone();
    tokio::task::spawn_blocking(move || manager_for_start.start_query(plan_id).unwrap())
        .await
        .unwrap();

    // Sending side.
    let sink = NetworkSink::new(
        partition,
        NodeLocation {
            worker_id: WorkerId(2),
            host: "127.0.0.1".into(),
            data_port: data_addr.port(),
        },
        8,
        tokio::runtime::Handle::current(),
    );
    sink.setup().unwrap();

    let sender_pool = nebulastream_common::buffer::BufferPool::new(4, 256);
    let mut buffer = sender_pool.acquire();
    {
        let meta = buffer.metadata_mut();
        meta.origin_id = OriginId(9);
        meta.sequence_number = SequenceNumber(41);
        meta.chunk_number = ChunkNumber(2);
        meta.last_chunk = true;
        meta.watermark = 123_456;
        meta.num_tuples = 3;
    }
    buffer.data_mut()[..24].copy_from_slice(&[0xAB; 24]);
    sink.write(&buffer).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !collecting
            .collected()
            .is_empty())
        .await
    );
    let received = &collecting.collected()[0];
    assert_eq!(received.origin_id(), OriginId(9));
    assert_eq!(received.sequence_number(), SequenceNumber(41));
    assert_eq!(received.chunk_number(), ChunkNumber(2));
    assert!(received.is_last_chunk());
    assert_eq!(received.watermark(), 123_456);
    assert_eq!(received.num_tuples(), 3);
    assert_eq!(&received.data()[..24], &[0xAB; 24]);

    let sink_for_shutdown = sink.clone();
    tokio::task::spawn_blocking(move || sink_for_shutdown.shutdown().unwrap())
        .await
        .unwrap();
    let manager_for_stop = manager.clone();
    tokio::task::spawn_blocking(move || {
        manager_for_stop.stop_query(plan_id).unwrap();
        manager_for_stop.shutdown();
    })
    .await
    .unwrap();
}

struct ToyCoordinator {
    next_worker: AtomicU32,
}

impl ControlService for ToyCoordinator {
    fn register_node(&self, request: RegisterNodeRequest) -> ControlReply {
        assert_eq!(request.node_type, NodeType::Worker);
        let id = self.next_worker.fetch_add(1, Ordering::SeqCst);
        ControlReply::ok_with(ReplyPayload::WorkerId(WorkerId(id)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_plane_round_trip() {
    let service = Arc::new(ToyCoordinator {
        next_worker: AtomicU32::new(1),
    });
    let (addr, _serve) = serve_control("127.0.0.1:0", service).await.unwrap();
    let client = ControlClient::new(addr.to_string());

    let request = RegisterNodeRequest {
        address: "10.0.0.8".into(),
        grpc_port: 9090,
        data_port: 9191,
        cpu_count: 8,
        node_type: NodeType::Worker,
        properties: Default::default(),
    };
    assert_eq!(client.register_node(request.clone()).await.unwrap(), WorkerId(1));
    assert_eq!(client.register_node(request).await.unwrap(), WorkerId(2));

    // Methods the endpoint does not serve come back as failures with reasons.
    let error = client
        .undeploy_query(QuerySubPlanId(5))
        .await
        .unwrap_err();
    assert!(matches!(error, NetworkError::Rpc(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deploy_retries_then_reports_disconnect() {
    // Nobody listens on this address; the bounded retry must surface the
    // disconnect instead of hanging.
    let client = ControlClient::new("127.0.0.1:1".to_string())
        .with_retry_policy(2, Duration::from_millis(10));
    let error = client.undeploy_query(QuerySubPlanId(1)).await.unwrap_err();
    assert!(matches!(error, NetworkError::Disconnected(_)));
}
