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

//! Typed identifiers used across the runtime and the coordinator.
//!
//! All identifiers are thin newtypes so that a sequence number can never be
//! confused with a chunk number or an operator id at a call site.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! def_id {
    ($(#[$attr:meta])* $name:ident, $raw:ty) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $raw);

        impl $name {
            pub const fn new(raw: $raw) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> $raw {
                self.0
            }
        }

        impl From<$raw> for $name {
            fn from(raw: $raw) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

def_id!(
    /// Identifies one logical source stream. Every tuple buffer belongs to
    /// exactly one origin.
    OriginId,
    u64
);

def_id!(
    /// Monotone per-origin buffer counter, starting at [`SequenceNumber::INITIAL`].
    SequenceNumber,
    u64
);

def_id!(
    /// Sub-index within one sequence number, starting at [`ChunkNumber::INITIAL`].
    ChunkNumber,
    u32
);

def_id!(QueryId, u32);
def_id!(SharedQueryId, u32);
def_id!(OperatorId, u32);
def_id!(PipelineId, u32);
def_id!(
    /// Identifies one decomposed (per-node) query sub plan.
    QuerySubPlanId,
    u32
);
def_id!(WorkerId, u32);

impl SequenceNumber {
    /// Sequence numbers are 1-based; 0 is reserved as the pre-stream sentinel.
    pub const INITIAL: SequenceNumber = SequenceNumber(1);

    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}

impl ChunkNumber {
    /// Chunk numbers are 1-based.
    pub const INITIAL: ChunkNumber = ChunkNumber(1);

    pub fn next(self) -> ChunkNumber {
        ChunkNumber(self.0 + 1)
    }
}

/// Event-time timestamp in microseconds since the unix epoch.
pub type Timestamp = u64;

/// Watermark value signalling that an origin has ended.
pub const EOS_WATERMARK: Timestamp = Timestamp::MAX;

/// Version counter for re-deployments of a decomposed query plan.
pub type PlanVersion = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_newtypes_do_not_mix_ordering() {
        assert!(SequenceNumber(2) > SequenceNumber::INITIAL);
        assert_eq!(ChunkNumber::INITIAL.next(), ChunkNumber(2));
        assert_eq!(OriginId::from(7).raw(), 7);
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&QueryId(42)).unwrap();
        assert_eq!(json, "42");
        let back: QueryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, QueryId(42));
    }
}
