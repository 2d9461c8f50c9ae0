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

//! Network sink: the upstream half of a cross-node edge.
//!
//! Worker threads hand buffers over synchronously; a tokio writer task frames
//! them onto the TCP channel identified by the sink's partition. The receiver
//! acknowledges only at stream close.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use nebulastream_common::buffer::TupleBuffer;
use nebulastream_common::types::{OriginId, EOS_WATERMARK};
use nebulastream_runtime::error::{Result as RuntimeResult, RuntimeError};
use nebulastream_runtime::executor::sink::DataSink;

use crate::protocol::{encode_frame, ChannelHeader, NesPartition, NodeLocation};

enum SinkCommand {
    Buffer(TupleBuffer),
    EndOfStream(OriginId),
}

/// Sends every written buffer to the paired network source at `destination`.
pub struct NetworkSink {
    partition: NesPartition,
    destination: NodeLocation,
    tuple_size: usize,
    handle: tokio::runtime::Handle,
    tx: Mutex<Option<mpsc::UnboundedSender<SinkCommand>>>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NetworkSink {
    pub fn new(
        partition: NesPartition,
        destination: NodeLocation,
        tuple_size: usize,
        handle: tokio::runtime::Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            partition,
            destination,
            tuple_size,
            handle,
            tx: Mutex::new(None),
            writer: Mutex::new(None),
        })
    }

    pub fn partition(&self) -> NesPartition {
        self.partition
    }

    fn failed(&self, reason: impl Into<String>) -> RuntimeError {
        RuntimeError::PipelineExecution {
            pipeline_id: Default::default(),
            reason: reason.into(),
        }
    }
}

impl DataSink for NetworkSink {
    fn setup(&self) -> RuntimeResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let address = self.destination.address();
        let partition = self.partition;
        let tuple_size = self.tuple_size;
        let writer = self
            .handle
            .spawn(async move { write_channel(address, partition, tuple_size, rx).await });
        *self.tx.lock() = Some(tx);
        *self.writer.lock() = Some(writer);
        Ok(())
    }

    fn write(&self, buffer: &TupleBuffer) -> RuntimeResult<()> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| self.failed("network sink not set up"))?;
        tx.send(SinkCommand::Buffer(buffer.clone()))
            .map_err(|_| self.failed(format!("channel to {} is gone", self.destination.address())))
    }

    fn end_of_stream(&self, origin: OriginId) -> RuntimeResult<()> {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(SinkCommand::EndOfStream(origin));
        }
        Ok(())
    }

    fn shutdown(&self) -> RuntimeResult<()> {
        // Dropping the sender closes the channel; the writer flushes, shuts
        // the stream down and waits for the close-ack.
        self.tx.lock().take();
        if let Some(writer) = self.writer.lock().take() {
            let handle = self.handle.clone();
            let _ = std::thread::spawn(move || {
                let _ = handle.block_on(writer);
            })
            .join();
        }
        Ok(())
    }
}

async fn write_channel(
    address: String,
    partition: NesPartition,
    tuple_size: usize,
    mut rx: mpsc::UnboundedReceiver<SinkCommand>,
) {
    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%address, %partition, %error, "network sink connect failed");
            return;
        }
    };
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(command) = rx.recv().await {
        let frame = match command {
            SinkCommand::Buffer(buffer) => encode_frame(partition, &buffer, tuple_size),
            SinkCommand::EndOfStream(origin) => encode_eos(partition, origin),
        };
        if let Err(error) = framed.send(frame).await {
            tracing::error!(%address, %partition, %error, "network sink send failed");
            return;
        }
    }

    // Stream close: flush and wait for the receiver's single ack frame.
    let _ = framed.flush().await;
    let _ = framed.close().await;
    if let Some(Ok(ack)) = framed.next().await {
        tracing::debug!(%partition, ack_len = ack.len(), "channel close acknowledged");
    }
}

fn encode_eos(partition: NesPartition, origin: OriginId) -> bytes::Bytes {
    let header = ChannelHeader {
        partition,
        origin_id: origin,
        sequence_number: Default::default(),
        chunk_number: Default::default(),
        last_chunk: true,
        watermark: EOS_WATERMARK,
        num_tuples: 0,
    };
    let mut frame = bytes::BytesMut::new();
    header.encode(&mut frame);
    frame.freeze()
}
