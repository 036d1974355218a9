//! In-memory workflow definition store

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CreateWorkflowDefinition, WorkflowDefinitionRow};
use crate::store::DefinitionStore;

use super::InMemoryState;

/// In-memory implementation of [`DefinitionStore`].
#[derive(Clone)]
pub struct InMemoryDefinitionStore {
    state: Arc<InMemoryState>,
}

impl InMemoryDefinitionStore {
    pub fn new(state: Arc<InMemoryState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn create(
        &self,
        input: CreateWorkflowDefinition,
    ) -> Result<WorkflowDefinitionRow, StoreError> {
        let now = Utc::now();
        let mut definitions = self.state.definitions.write();

        if definitions
            .values()
            .any(|d| d.name == input.name && d.version == input.version)
        {
            return Err(StoreError::Database(format!(
                "duplicate definition {}@{}",
                input.name, input.version
            )));
        }

        if input.activate {
            for def in definitions.values_mut() {
                if def.name == input.name && def.is_active {
                    def.is_active = false;
                    def.updated_at = now;
                }
            }
        }

        let row = WorkflowDefinitionRow {
            id: Uuid::now_v7(),
            name: input.name,
            version: input.version,
            graph: input.graph,
            is_active: input.activate,
            created_at: now,
            updated_at: now,
        };
        definitions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_graph(
        &self,
        id: Uuid,
        graph: serde_json::Value,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        let mut definitions = self.state.definitions.write();
        Ok(definitions.get_mut(&id).map(|def| {
            def.graph = graph;
            def.updated_at = Utc::now();
            def.clone()
        }))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        Ok(self.state.definitions.read().get(&id).cloned())
    }

    async fn get_by_name_and_version(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        Ok(self
            .state
            .definitions
            .read()
            .values()
            .find(|d| d.name == name && d.version == version)
            .cloned())
    }

    async fn get_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinitionRow>, StoreError> {
        Ok(self
            .state
            .definitions
            .read()
            .values()
            .find(|d| d.name == name && d.is_active)
            .cloned())
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<WorkflowDefinitionRow>, StoreError> {
        let mut rows: Vec<WorkflowDefinitionRow> = self
            .state
            .definitions
            .read()
            .values()
            .filter(|d| d.name == name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(rows)
    }

    async fn activate_version(&self, name: &str, version: i32) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut definitions = self.state.definitions.write();

        if !definitions
            .values()
            .any(|d| d.name == name && d.version == version)
        {
            return Ok(false);
        }

        for def in definitions.values_mut() {
            if def.name == name {
                let activate = def.version == version;
                if def.is_active != activate {
                    def.is_active = activate;
                    def.updated_at = now;
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryDefinitionStore {
        InMemoryDefinitionStore::new(InMemoryState::new())
    }

    fn input(name: &str, version: i32, activate: bool) -> CreateWorkflowDefinition {
        CreateWorkflowDefinition {
            name: name.to_string(),
            version,
            graph: serde_json::json!({"startNodeId": "a", "nodes": {}, "edges": []}),
            activate,
        }
    }

    #[tokio::test]
    async fn test_single_active_version_per_name() {
        let defs = store();
        defs.create(input("sync", 1, true)).await.unwrap();
        defs.create(input("sync", 2, true)).await.unwrap();

        let active = defs.get_active_by_name("sync").await.unwrap().unwrap();
        assert_eq!(active.version, 2);

        let versions = defs.list_versions("sync").await.unwrap();
        assert_eq!(versions.iter().filter(|d| d.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_activate_version_swaps_atomically() {
        let defs = store();
        defs.create(input("sync", 1, true)).await.unwrap();
        defs.create(input("sync", 2, false)).await.unwrap();

        assert!(defs.activate_version("sync", 2).await.unwrap());
        let active = defs.get_active_by_name("sync").await.unwrap().unwrap();
        assert_eq!(active.version, 2);

        // Unknown version leaves activation untouched.
        assert!(!defs.activate_version("sync", 9).await.unwrap());
        let active = defs.get_active_by_name("sync").await.unwrap().unwrap();
        assert_eq!(active.version, 2);
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let defs = store();
        defs.create(input("sync", 1, false)).await.unwrap();
        assert!(defs.create(input("sync", 1, false)).await.is_err());
    }

    #[tokio::test]
    async fn test_graph_round_trip() {
        let defs = store();
        let graph = serde_json::json!({
            "startNodeId": "a",
            "nodes": {"a": {"kind": "simple", "executor": "echo"}},
            "edges": []
        });
        let created = defs
            .create(CreateWorkflowDefinition {
                name: "seq".to_string(),
                version: 1,
                graph: graph.clone(),
                activate: true,
            })
            .await
            .unwrap();

        let loaded = defs.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.graph, graph);
    }
}
