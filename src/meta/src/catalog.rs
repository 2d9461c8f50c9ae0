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

//! Source catalog: logical sources (name and schema) and the physical
//! sources workers registered for them. Placement resolves un-pinned source
//! operators through this catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use nebulastream_common::catalog::Schema;
use nebulastream_common::types::WorkerId;

use crate::error::{MetaError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalSource {
    pub worker_id: WorkerId,
    pub physical_name: String,
    pub logical_name: String,
    pub source_type: String,
    pub config: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct SourceCatalog {
    logical: BTreeMap<String, Schema>,
    physical: BTreeMap<String, Vec<PhysicalSource>>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same name again replaces the schema; workers re-send
    /// their definitions on startup.
    pub fn register_logical_source(&mut self, name: impl Into<String>, schema: Schema) {
        let name = name.into();
        if self.logical.insert(name.clone(), schema).is_some() {
            tracing::info!(source = %name, "logical source re-registered");
        }
    }

    pub fn register_physical_source(&mut self, source: PhysicalSource) -> Result<()> {
        if !self.logical.contains_key(&source.logical_name) {
            return Err(MetaError::UnknownLogicalSource(source.logical_name.clone()));
        }
        self.physical
            .entry(source.logical_name.clone())
            .or_default()
            .push(source);
        Ok(())
    }

    pub fn schema(&self, logical_name: &str) -> Result<&Schema> {
        self.logical
            .get(logical_name)
            .ok_or_else(|| MetaError::UnknownLogicalSource(logical_name.to_owned()))
    }

    pub fn contains_logical_source(&self, logical_name: &str) -> bool {
        self.logical.contains_key(logical_name)
    }

    /// Workers hosting a physical source for the logical stream.
    pub fn source_nodes_for_logical_source(&self, logical_name: &str) -> Result<Vec<WorkerId>> {
        if !self.logical.contains_key(logical_name) {
            return Err(MetaError::UnknownLogicalSource(logical_name.to_owned()));
        }
        Ok(self
            .physical
            .get(logical_name)
            .map(|sources| sources.iter().map(|s| s.worker_id).collect())
            .unwrap_or_default())
    }

    pub fn snapshot(&self) -> BTreeMap<String, Schema> {
        self.logical.clone()
    }

    pub fn restore(snapshot: BTreeMap<String, Schema>) -> Self {
        Self {
            logical: snapshot,
            physical: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use nebulastream_common::catalog::DataType;

    use super::*;

    #[test]
    fn physical_sources_require_their_logical_source() {
        let mut catalog = SourceCatalog::new();
        let orphan = PhysicalSource {
            worker_id: WorkerId(2),
            physical_name: "cars_1".into(),
            logical_name: "cars".into(),
            source_type: "csv".into(),
            config: BTreeMap::new(),
        };
        assert!(matches!(
            catalog.register_physical_source(orphan.clone()),
            Err(MetaError::UnknownLogicalSource(_))
        ));

        catalog.register_logical_source(
            "cars",
            Schema::empty().with_field("f1", DataType::Int64),
        );
        catalog.register_physical_source(orphan).unwrap();
        assert_eq!(
            catalog.source_nodes_for_logical_source("cars").unwrap(),
            vec![WorkerId(2)]
        );
    }

    #[test]
    fn snapshot_restores_schemas_only() {
        let mut catalog = SourceCatalog::new();
        catalog.register_logical_source(
            "cars",
            Schema::empty().with_field("f1", DataType::Int64),
        );
        let restored = SourceCatalog::restore(catalog.snapshot());
        assert!(restored.contains_logical_source("cars"));
        assert!(restored
            .source_nodes_for_logical_source("cars")
            .unwrap()
            .is_empty());
    }
}
