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

//! Data-plane wire protocol.
//!
//! Every transfer between a network sink and its paired network source
//! carries a fixed header followed by `num_tuples × tuple_size` payload
//! bytes. All integers are big-endian. The 16-byte [`NesPartition`] is the
//! identity matched on both ends of a channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use nebulastream_common::buffer::TupleBuffer;
use nebulastream_common::types::{
    ChunkNumber, OperatorId, OriginId, QueryId, SequenceNumber, Timestamp, WorkerId,
};

use crate::error::{NetworkError, Result};

/// Pairs one network sink to exactly one network source.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NesPartition {
    pub query_id: QueryId,
    pub operator_id: OperatorId,
    pub sub_partition: u32,
    pub partition: u32,
}

impl NesPartition {
    pub const ENCODED_LEN: usize = 16;

    pub fn new(query_id: QueryId, operator_id: OperatorId, sub_partition: u32, partition: u32) -> Self {
        Self {
            query_id,
            operator_id,
            sub_partition,
            partition,
        }
    }
}

impl std::fmt::Display for NesPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}::{}::{}::{}",
            self.query_id, self.operator_id, self.sub_partition, self.partition
        )
    }
}

/// Where a network sink connects to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeLocation {
    pub worker_id: WorkerId,
    pub host: String,
    pub data_port: u16,
}

impl NodeLocation {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }
}

/// Header preceding every payload on a data channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelHeader {
    pub partition: NesPartition,
    pub origin_id: OriginId,
    pub sequence_number: SequenceNumber,
    pub chunk_number: ChunkNumber,
    pub last_chunk: bool,
    pub watermark: Timestamp,
    pub num_tuples: u32,
}

impl ChannelHeader {
    pub const ENCODED_LEN: usize = NesPartition::ENCODED_LEN + 8 + 8 + 4 + 1 + 8 + 4;

    pub fn for_buffer(partition: NesPartition, buffer: &TupleBuffer) -> Self {
        Self {
            partition,
            origin_id: buffer.origin_id(),
            sequence_number: buffer.sequence_number(),
            chunk_number: buffer.chunk_number(),
            last_chunk: buffer.is_last_chunk(),
            watermark: buffer.watermark(),
            num_tuples: buffer.num_tuples(),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::ENCODED_LEN);
        dst.put_u32(self.partition.query_id.raw());
        dst.put_u32(self.partition.operator_id.raw());
        dst.put_u32(self.partition.sub_partition);
        dst.put_u32(self.partition.partition);
        dst.put_u64(self.origin_id.raw());
        dst.put_u64(self.sequence_number.raw());
        dst.put_u32(self.chunk_number.raw());
        dst.put_u8(self.last_chunk as u8);
        dst.put_u64(self.watermark);
        dst.put_u32(self.num_tuples);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        if src.remaining() < Self::ENCODED_LEN {
            return Err(NetworkError::Codec(format!(
                "short header: {} of {} bytes",
                src.remaining(),
                Self::ENCODED_LEN
            )));
        }
        let partition = NesPartition {
            query_id: QueryId(src.get_u32()),
            operator_id: OperatorId(src.get_u32()),
            sub_partition: src.get_u32(),
            partition: src.get_u32(),
        };
        Ok(Self {
            partition,
            origin_id: OriginId(src.get_u64()),
            sequence_number: SequenceNumber(src.get_u64()),
            chunk_number: ChunkNumber(src.get_u32()),
            last_chunk: src.get_u8() != 0,
            watermark: src.get_u64(),
            num_tuples: src.get_u32(),
        })
    }

    /// Stamp the decoded routing metadata onto a freshly acquired buffer.
    pub fn apply_to(&self, buffer: &mut TupleBuffer) {
        let meta = buffer.metadata_mut();
        meta.origin_id = self.origin_id;
        meta.sequence_number = self.sequence_number;
        meta.chunk_number = self.chunk_number;
        meta.last_chunk = self.last_chunk;
        meta.watermark = self.watermark;
        meta.num_tuples = self.num_tuples;
    }
}

/// One header + payload, framed for a length-delimited transport.
pub fn encode_frame(partition: NesPartition, buffer: &TupleBuffer, tuple_size: usize) -> Bytes {
    let header = ChannelHeader::for_buffer(partition, buffer);
    let payload_len = header.num_tuples as usize * tuple_size;
    let mut frame = BytesMut::with_capacity(ChannelHeader::ENCODED_LEN + payload_len);
    header.encode(&mut frame);
    frame.put_slice(&buffer.data()[..payload_len.min(buffer.capacity())]);
    frame.freeze()
}

/// Split one received frame into its header and payload bytes.
pub fn decode_frame(mut frame: Bytes) -> Result<(ChannelHeader, Bytes)> {
    let header = ChannelHeader::decode(&mut frame)?;
    Ok((header, frame))
}

#[cfg(test)]
mod tests {
    use nebulastream_common::buffer::BufferPool;

    use super::*;

    #[test]
    fn header_round_trip_preserves_all_attributes() {
        let header = ChannelHeader {
            partition: NesPartition::new(QueryId(7), OperatorId(42), 1, 3),
            origin_id: OriginId(11),
            sequence_number: SequenceNumber(1234),
            chunk_number: ChunkNumber(2),
            last_chunk: true,
            watermark: 987_654,
            num_tuples: 128,
        };
        let mut encoded = BytesMut::new();
        header.encode(&mut encoded);
        assert_eq!(encoded.len(), ChannelHeader::ENCODED_LEN);

        let decoded = ChannelHeader::decode(&mut encoded.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn short_header_is_rejected() {
        let mut short = Bytes::from_static(&[0u8; 10]);
        assert!(ChannelHeader::decode(&mut short).is_err());
    }

    #[test]
    fn frame_round_trip_reproduces_buffer() {
        let pool = BufferPool::new(2, 256);
        let mut buffer = pool.acquire();
        {
            let meta = buffer.metadata_mut();
            meta.origin_id = OriginId(5);
            meta.sequence_number = SequenceNumber(9);
            meta.chunk_number = ChunkNumber(1);
            meta.last_chunk = true;
            meta.watermark = 777;
            meta.num_tuples = 4;
        }
        buffer.data_mut()[..32].copy_from_slice(&[7u8; 32]);

        let partition = NesPartition::new(QueryId(1), OperatorId(2), 0, 0);
        let frame = encode_frame(partition, &buffer, 8);
        let (header, payload) = decode_frame(frame).unwrap();

        assert_eq!(header, ChannelHeader::for_buffer(partition, &buffer));
        assert_eq!(payload.len(), 32);
        assert!(payload.iter().all(|b| *b == 7));

        let mut received = pool.acquire();
        header.apply_to(&mut received);
        received.data_mut()[..payload.len()].copy_from_slice(&payload);
        assert_eq!(received.origin_id(), OriginId(5));
        assert_eq!(received.sequence_number(), SequenceNumber(9));
        assert_eq!(received.chunk_number(), ChunkNumber(1));
        assert!(received.is_last_chunk());
        assert_eq!(received.watermark(), 777);
        assert_eq!(received.num_tuples(), 4);
    }
}
