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

//! Fixed-width row access over raw buffer bytes.
//!
//! Tuples are laid out field after field, little-endian, with no padding;
//! a [`RowLayout`] precomputes the offsets so stages can read and write
//! fields without re-walking the schema per tuple.

use crate::catalog::{DataType, Schema};
use crate::error::{CommonError, Result};

#[derive(Clone, Copy, Debug)]
struct FieldSlot {
    offset: usize,
    size: usize,
    data_type: DataType,
}

/// Precomputed field offsets for one schema.
#[derive(Clone, Debug)]
pub struct RowLayout {
    slots: Vec<FieldSlot>,
    tuple_size: usize,
}

impl RowLayout {
    pub fn new(schema: &Schema) -> Self {
        let mut slots = Vec::with_capacity(schema.len());
        let mut offset = 0;
        for field in schema.fields() {
            let size = field.data_type.size_in_bytes();
            slots.push(FieldSlot {
                offset,
                size,
                data_type: field.data_type,
            });
            offset += size;
        }
        Self {
            slots,
            tuple_size: offset,
        }
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn num_fields(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, field_index: usize) -> Result<FieldSlot> {
        self.slots
            .get(field_index)
            .copied()
            .ok_or_else(|| CommonError::UnknownField {
                field: format!("#{field_index}"),
            })
    }

    /// How many full tuples fit into `buffer_len` bytes.
    pub fn capacity(&self, buffer_len: usize) -> usize {
        if self.tuple_size == 0 {
            0
        } else {
            buffer_len / self.tuple_size
        }
    }
}

/// Read-only view over the tuples in a byte slice.
pub struct RowReader<'a> {
    layout: &'a RowLayout,
    data: &'a [u8],
}

impl<'a> RowReader<'a> {
    pub fn new(layout: &'a RowLayout, data: &'a [u8]) -> Self {
        Self { layout, data }
    }

    fn field_bytes(&self, tuple_index: usize, field_index: usize) -> Result<&'a [u8]> {
        let slot = self.layout.slot(field_index)?;
        let base = tuple_index * self.layout.tuple_size + slot.offset;
        self.data
            .get(base..base + slot.size)
            .ok_or_else(|| CommonError::Configuration("tuple index out of bounds".into()))
    }

    pub fn read_i64(&self, tuple_index: usize, field_index: usize) -> Result<i64> {
        let bytes = self.field_bytes(tuple_index, field_index)?;
        match bytes.len() {
            8 => Ok(i64::from_le_bytes(bytes.try_into().expect("8 bytes"))),
            4 => Ok(i32::from_le_bytes(bytes.try_into().expect("4 bytes")) as i64),
            2 => Ok(i16::from_le_bytes(bytes.try_into().expect("2 bytes")) as i64),
            1 => Ok(bytes[0] as i8 as i64),
            other => Err(CommonError::Configuration(format!(
                "cannot widen a {other}-byte field to i64"
            ))),
        }
    }

    pub fn read_u64(&self, tuple_index: usize, field_index: usize) -> Result<u64> {
        Ok(self.read_i64(tuple_index, field_index)? as u64)
    }

    pub fn read_f64(&self, tuple_index: usize, field_index: usize) -> Result<f64> {
        let bytes = self.field_bytes(tuple_index, field_index)?;
        match bytes.len() {
            8 => Ok(f64::from_le_bytes(bytes.try_into().expect("8 bytes"))),
            4 => Ok(f32::from_le_bytes(bytes.try_into().expect("4 bytes")) as f64),
            other => Err(CommonError::Configuration(format!(
                "cannot widen a {other}-byte field to f64"
            ))),
        }
    }

    pub fn read_bool(&self, tuple_index: usize, field_index: usize) -> Result<bool> {
        Ok(self.field_bytes(tuple_index, field_index)?[0] != 0)
    }

    /// The raw bytes of one whole tuple.
    pub fn tuple(&self, tuple_index: usize) -> Result<&'a [u8]> {
        let base = tuple_index * self.layout.tuple_size;
        self.data
            .get(base..base + self.layout.tuple_size)
            .ok_or_else(|| CommonError::Configuration("tuple index out of bounds".into()))
    }
}

/// Mutable view appending or overwriting tuples in a byte slice.
pub struct RowWriter<'a> {
    layout: &'a RowLayout,
    data: &'a mut [u8],
}

impl<'a> RowWriter<'a> {
    pub fn new(layout: &'a RowLayout, data: &'a mut [u8]) -> Self {
        Self { layout, data }
    }

    fn field_bytes_mut(&mut self, tuple_index: usize, field_index: usize) -> Result<&mut [u8]> {
        let slot = self.layout.slot(field_index)?;
        let base = tuple_index * self.layout.tuple_size + slot.offset;
        self.data
            .get_mut(base..base + slot.size)
            .ok_or_else(|| CommonError::Configuration("tuple index out of bounds".into()))
    }

    pub fn write_i64(&mut self, tuple_index: usize, field_index: usize, value: i64) -> Result<()> {
        let bytes = self.field_bytes_mut(tuple_index, field_index)?;
        match bytes.len() {
            8 => bytes.copy_from_slice(&value.to_le_bytes()),
            4 => bytes.copy_from_slice(&(value as i32).to_le_bytes()),
            2 => bytes.copy_from_slice(&(value as i16).to_le_bytes()),
            1 => bytes[0] = value as u8,
            other => {
                return Err(CommonError::Configuration(format!(
                    "cannot narrow i64 into a {other}-byte field"
                )))
            }
        }
        Ok(())
    }

    pub fn write_u64(&mut self, tuple_index: usize, field_index: usize, value: u64) -> Result<()> {
        self.write_i64(tuple_index, field_index, value as i64)
    }

    pub fn write_f64(&mut self, tuple_index: usize, field_index: usize, value: f64) -> Result<()> {
        let bytes = self.field_bytes_mut(tuple_index, field_index)?;
        match bytes.len() {
            8 => bytes.copy_from_slice(&value.to_le_bytes()),
            4 => bytes.copy_from_slice(&(value as f32).to_le_bytes()),
            other => {
                return Err(CommonError::Configuration(format!(
                    "cannot narrow f64 into a {other}-byte field"
                )))
            }
        }
        Ok(())
    }

    pub fn write_bool(&mut self, tuple_index: usize, field_index: usize, value: bool) -> Result<()> {
        self.field_bytes_mut(tuple_index, field_index)?[0] = value as u8;
        Ok(())
    }

    /// Copy one whole tuple from another buffer.
    pub fn copy_tuple(&mut self, tuple_index: usize, tuple: &[u8]) -> Result<()> {
        if tuple.len() != self.layout.tuple_size {
            return Err(CommonError::Configuration("tuple width mismatch".into()));
        }
        let base = tuple_index * self.layout.tuple_size;
        self.data
            .get_mut(base..base + tuple.len())
            .ok_or_else(|| CommonError::Configuration("tuple index out of bounds".into()))?
            .copy_from_slice(tuple);
        Ok(())
    }
}
