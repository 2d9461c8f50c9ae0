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

//! Network source: the downstream half of a cross-node edge.
//!
//! One data-exchange endpoint per worker accepts channels from remote
//! network sinks. Incoming frames are matched to a registered partition,
//! copied into pool buffers and re-injected into the task queue under the
//! source's operator id. Pool exhaustion stalls the channel read, which is
//! exactly the backpressure the wire is supposed to carry upstream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use nebulastream_common::buffer::BufferPool;
use nebulastream_common::types::{OperatorId, OriginId};
use nebulastream_common::CommonError;
use nebulastream_runtime::error::Result as RuntimeResult;
use nebulastream_runtime::task::executable_plan::DataSource;
use nebulastream_runtime::task::query_manager::QueryManager;

use crate::error::Result;
use crate::protocol::{decode_frame, NesPartition};

#[derive(Clone)]
struct Registration {
    operator_id: OperatorId,
    manager: QueryManager,
    pool: BufferPool,
}

/// Accepts data channels and routes frames to registered partitions.
pub struct DataExchangeService {
    registrations: RwLock<HashMap<NesPartition, Registration>>,
}

impl DataExchangeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registrations: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(
        &self,
        partition: NesPartition,
        operator_id: OperatorId,
        manager: QueryManager,
        pool: BufferPool,
    ) {
        self.registrations.write().insert(
            partition,
            Registration {
                operator_id,
                manager,
                pool,
            },
        );
    }

    pub fn unregister(&self, partition: NesPartition) {
        self.registrations.write().remove(&partition);
    }

    fn lookup(&self, partition: NesPartition) -> Option<Registration> {
        self.registrations.read().get(&partition).cloned()
    }

    /// Bind the data endpoint; returns the bound address and accept task.
    pub async fn serve_on(
        self: &Arc<Self>,
        bind_addr: &str,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let exchange = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let exchange = Arc::clone(&exchange);
                        tokio::spawn(async move {
                            if let Err(error) = exchange.run_channel(stream).await {
                                tracing::warn!(%peer, %error, "data channel failed");
                            }
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "data accept failed");
                        return;
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    async fn run_channel(&self, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        while let Some(frame) = framed.next().await {
            let (header, payload) = decode_frame(frame?.freeze())?;
            let Some(registration) = self.lookup(header.partition) else {
                tracing::warn!(partition = %header.partition, "frame for unknown partition dropped");
                continue;
            };

            // Backpressure point: stall the channel until the pool frees up.
            let mut buffer = loop {
                match registration.pool.try_acquire() {
                    Ok(buffer) => break buffer,
                    Err(CommonError::PoolExhausted) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(error) => {
                        return Err(crate::error::NetworkError::Codec(error.to_string()))
                    }
                }
            };
            header.apply_to(&mut buffer);
            let len = payload.len().min(buffer.capacity());
            buffer.data_mut()[..len].copy_from_slice(&payload[..len]);

            if let Err(error) = registration
                .manager
                .add_work(registration.operator_id, buffer)
            {
                tracing::warn!(%error, "failed to enqueue received buffer");
            }
        }
        // Single ack at stream close.
        framed.send(bytes::Bytes::from_static(b"\x01")).await?;
        Ok(())
    }
}

/// The runtime-facing source backed by a registered exchange partition.
pub struct NetworkSource {
    operator_id: OperatorId,
    origin_id: OriginId,
    partition: NesPartition,
    exchange: Arc<DataExchangeService>,
    pool: BufferPool,
}

impl NetworkSource {
    pub fn new(
        operator_id: OperatorId,
        origin_id: OriginId,
        partition: NesPartition,
        exchange: Arc<DataExchangeService>,
        pool: BufferPool,
    ) -> Arc<Self> {
        Arc::new(Self {
            operator_id,
            origin_id,
            partition,
            exchange,
            pool,
        })
    }

    pub fn partition(&self) -> NesPartition {
        self.partition
    }
}

impl DataSource for NetworkSource {
    fn operator_id(&self) -> OperatorId {
        self.operator_id
    }

    fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    fn start(&self, manager: &QueryManager) -> RuntimeResult<()> {
        self.exchange.register(
            self.partition,
            self.operator_id,
            manager.clone(),
            self.pool.clone(),
        );
        Ok(())
    }

    fn stop(&self) -> RuntimeResult<()> {
        self.exchange.unregister(self.partition);
        Ok(())
    }
}
