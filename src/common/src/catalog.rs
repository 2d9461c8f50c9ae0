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

//! Fixed-width tuple schemas.
//!
//! Tuples travel through the runtime as flat, fixed-width byte records; a
//! [`Schema`] describes the field layout and the resulting tuple size, which
//! in turn bounds how many tuples fit into one buffer.

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Fixed-length character field.
    Char { len: u32 },
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::Char { len } => *len as usize,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// An ordered list of fixed-width fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style helper used all over the tests.
    pub fn with_field(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.fields.push(Field::new(name, data_type));
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Width of one serialized tuple in bytes.
    pub fn tuple_size(&self) -> usize {
        self.fields.iter().map(|f| f.data_type.size_in_bytes()).sum()
    }

    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| CommonError::UnknownField {
                field: name.to_owned(),
            })
    }

    /// Byte offset of the named field within a tuple.
    pub fn field_offset(&self, name: &str) -> Result<usize> {
        let index = self.field_index(name)?;
        Ok(self.fields[..index]
            .iter()
            .map(|f| f.data_type.size_in_bytes())
            .sum())
    }

    /// How many tuples of this schema fit into a buffer of `buffer_size` bytes.
    pub fn capacity_in_buffer(&self, buffer_size: usize) -> usize {
        let tuple_size = self.tuple_size();
        if tuple_size == 0 {
            0
        } else {
            buffer_size / tuple_size
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_schema() -> Schema {
        Schema::empty()
            .with_field("key", DataType::UInt64)
            .with_field("value", DataType::Int32)
            .with_field("flag", DataType::Bool)
            .with_field("tag", DataType::Char { len: 16 })
    }

    #[test]
    fn tuple_size_and_offsets() {
        let schema = test_schema();
        assert_eq!(schema.tuple_size(), 8 + 4 + 1 + 16);
        assert_eq!(schema.field_offset("key").unwrap(), 0);
        assert_eq!(schema.field_offset("value").unwrap(), 8);
        assert_eq!(schema.field_offset("tag").unwrap(), 13);
        assert!(schema.field_offset("missing").is_err());
    }

    #[test]
    fn capacity_rounds_down() {
        let schema = Schema::empty().with_field("f1", DataType::Int64);
        assert_eq!(schema.capacity_in_buffer(4096), 512);
        assert_eq!(schema.capacity_in_buffer(7), 0);
    }

    #[test]
    fn serde_round_trip_preserves_names_types_and_order() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
        let names: Vec<_> = back.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["key", "value", "flag", "tag"]);
    }
}
