//! In-memory node instance store
//!
//! Enforces the sub-node uniqueness invariant
//! `(workflow_instance_id, parent_node_id, child_index)` and keeps the loop
//! fan-out all-or-nothing like the PostgreSQL transaction.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use conveyor_core::status::{LoopProgress, NodeStatus};

use crate::error::StoreError;
use crate::models::{CreateNodeInstance, NodeInstanceRow};
use crate::store::NodeStore;

use super::InMemoryState;

/// In-memory implementation of [`NodeStore`].
#[derive(Clone)]
pub struct InMemoryNodeStore {
    state: Arc<InMemoryState>,
}

impl InMemoryNodeStore {
    pub fn new(state: Arc<InMemoryState>) -> Self {
        Self { state }
    }

    fn build_row(input: &CreateNodeInstance) -> NodeInstanceRow {
        let now = Utc::now();
        NodeInstanceRow {
            id: Uuid::now_v7(),
            workflow_instance_id: input.workflow_instance_id,
            parent_node_id: input.parent_node_id,
            node_id: input.node_id.clone(),
            node_name: input.node_name.clone(),
            node_type: input.node_type.clone(),
            status: "pending".to_string(),
            child_index: input.child_index,
            input_data: input.input_data.clone(),
            result: None,
            loop_progress: None,
            job_id: None,
            retry_count: 0,
            error_message: None,
            error_details: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The sub-node identity conflict check backing the unique index.
    fn conflicts(
        nodes: &std::collections::HashMap<Uuid, NodeInstanceRow>,
        input: &CreateNodeInstance,
    ) -> bool {
        match input.parent_node_id {
            Some(parent) => nodes.values().any(|n| {
                n.workflow_instance_id == input.workflow_instance_id
                    && n.parent_node_id == Some(parent)
                    && n.child_index == input.child_index
            }),
            None => nodes.values().any(|n| {
                n.workflow_instance_id == input.workflow_instance_id
                    && n.parent_node_id.is_none()
                    && n.node_id == input.node_id
            }),
        }
    }

    fn sort_children(rows: &mut [NodeInstanceRow]) {
        rows.sort_by(|a, b| {
            a.child_index
                .unwrap_or(0)
                .cmp(&b.child_index.unwrap_or(0))
                .then(a.id.cmp(&b.id))
        });
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn create(&self, input: CreateNodeInstance) -> Result<NodeInstanceRow, StoreError> {
        let mut nodes = self.state.nodes.write();
        if Self::conflicts(&nodes, &input) {
            return Err(StoreError::Database(format!(
                "duplicate node instance for node '{}'",
                input.node_id
            )));
        }

        let row = Self::build_row(&input);
        nodes.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_many(
        &self,
        inputs: Vec<CreateNodeInstance>,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let mut nodes = self.state.nodes.write();

        // All-or-nothing: validate the whole batch before inserting any row.
        for input in &inputs {
            if Self::conflicts(&nodes, input) {
                return Err(StoreError::Database(format!(
                    "duplicate node instance for node '{}'",
                    input.node_id
                )));
            }
        }

        let rows: Vec<NodeInstanceRow> = inputs.iter().map(Self::build_row).collect();
        for row in &rows {
            nodes.insert(row.id, row.clone());
        }
        Ok(rows)
    }

    async fn create_loop_children(
        &self,
        parent_instance_id: Uuid,
        children: Vec<CreateNodeInstance>,
        progress: LoopProgress,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let progress_json = serde_json::to_value(&progress)?;
        let mut nodes = self.state.nodes.write();

        if !nodes.contains_key(&parent_instance_id) {
            return Err(StoreError::NodeNotFound(parent_instance_id));
        }
        for child in &children {
            if Self::conflicts(&nodes, child) {
                return Err(StoreError::Database(format!(
                    "duplicate loop child index {:?}",
                    child.child_index
                )));
            }
        }

        let rows: Vec<NodeInstanceRow> = children.iter().map(Self::build_row).collect();
        for row in &rows {
            nodes.insert(row.id, row.clone());
        }

        let parent = nodes
            .get_mut(&parent_instance_id)
            .expect("parent checked above");
        parent.loop_progress = Some(progress_json);
        parent.updated_at = Utc::now();

        Ok(rows)
    }

    async fn get(&self, id: Uuid) -> Result<Option<NodeInstanceRow>, StoreError> {
        Ok(self.state.nodes.read().get(&id).cloned())
    }

    async fn find_by_workflow_and_node_id(
        &self,
        workflow_instance_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeInstanceRow>, StoreError> {
        Ok(self
            .state
            .nodes
            .read()
            .values()
            .find(|n| {
                n.workflow_instance_id == workflow_instance_id
                    && n.node_id == node_id
                    && n.parent_node_id.is_none()
            })
            .cloned())
    }

    async fn find_top_level(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let mut rows: Vec<NodeInstanceRow> = self
            .state
            .nodes
            .read()
            .values()
            .filter(|n| n.workflow_instance_id == workflow_instance_id && n.parent_node_id.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn find_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let mut rows: Vec<NodeInstanceRow> = self
            .state
            .nodes
            .read()
            .values()
            .filter(|n| n.parent_node_id == Some(parent_instance_id))
            .cloned()
            .collect();
        Self::sort_children(&mut rows);
        Ok(rows)
    }

    async fn find_all_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let nodes = self.state.nodes.read();
        let mut result = vec![];
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut frontier = vec![parent_instance_id];

        // Breadth-first with a visited set; parent-pointer cycles terminate.
        while let Some(parent) = frontier.pop() {
            if !visited.insert(parent) {
                continue;
            }
            let mut level: Vec<NodeInstanceRow> = nodes
                .values()
                .filter(|n| n.parent_node_id == Some(parent))
                .cloned()
                .collect();
            Self::sort_children(&mut level);
            for child in &level {
                frontier.push(child.id);
            }
            result.extend(level);
        }
        Ok(result)
    }

    async fn find_pending_child_nodes(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let mut rows: Vec<NodeInstanceRow> = self
            .state
            .nodes
            .read()
            .values()
            .filter(|n| n.parent_node_id == Some(parent_instance_id) && n.status == "pending")
            .cloned()
            .collect();
        Self::sort_children(&mut rows);
        Ok(rows)
    }

    async fn find_by_status(
        &self,
        workflow_instance_id: Uuid,
        status: NodeStatus,
    ) -> Result<Vec<NodeInstanceRow>, StoreError> {
        let wanted = status.to_string();
        let mut rows: Vec<NodeInstanceRow> = self
            .state
            .nodes
            .read()
            .values()
            .filter(|n| n.workflow_instance_id == workflow_instance_id && n.status == wanted)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NodeStatus,
        error_message: Option<&str>,
        error_details: Option<serde_json::Value>,
    ) -> Result<NodeInstanceRow, StoreError> {
        let now = Utc::now();
        let mut nodes = self.state.nodes.write();
        let node = nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;

        let from: NodeStatus = node.parsed_status().map_err(StoreError::Serialization)?;
        if !from.can_transition_to(status) {
            return Err(StoreError::invalid_transition(from, status));
        }

        node.status = status.to_string();
        if let Some(message) = error_message {
            node.error_message = Some(message.to_string());
        }
        if let Some(details) = error_details {
            node.error_details = Some(details);
        }
        if status == NodeStatus::Running && node.started_at.is_none() {
            node.started_at = Some(now);
        }
        if status.is_terminal() {
            node.completed_at = Some(now);
        }
        node.updated_at = now;
        Ok(node.clone())
    }

    async fn set_result(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError> {
        let mut nodes = self.state.nodes.write();
        if let Some(node) = nodes.get_mut(&id) {
            node.result = Some(result);
            node.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_job_id(&self, id: Uuid, job_id: Option<Uuid>) -> Result<(), StoreError> {
        let mut nodes = self.state.nodes.write();
        if let Some(node) = nodes.get_mut(&id) {
            node.job_id = job_id;
            node.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, StoreError> {
        let mut nodes = self.state.nodes.write();
        let node = nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        node.retry_count += 1;
        node.updated_at = Utc::now();
        Ok(node.retry_count)
    }

    async fn update_loop_progress(
        &self,
        id: Uuid,
        progress: LoopProgress,
    ) -> Result<(), StoreError> {
        let progress_json = serde_json::to_value(&progress)?;
        let mut nodes = self.state.nodes.write();
        let node = nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        node.loop_progress = Some(progress_json);
        node.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conveyor_core::status::LoopPhase;

    fn store() -> InMemoryNodeStore {
        InMemoryNodeStore::new(InMemoryState::new())
    }

    fn top_level(wf: Uuid, node_id: &str, node_type: &str) -> CreateNodeInstance {
        CreateNodeInstance {
            workflow_instance_id: wf,
            parent_node_id: None,
            node_id: node_id.to_string(),
            node_name: node_id.to_string(),
            node_type: node_type.to_string(),
            child_index: None,
            input_data: None,
        }
    }

    fn child(wf: Uuid, parent: Uuid, index: i32) -> CreateNodeInstance {
        CreateNodeInstance {
            workflow_instance_id: wf,
            parent_node_id: Some(parent),
            node_id: format!("loop[{}]", index),
            node_name: format!("loop[{}]", index),
            node_type: "simple".to_string(),
            child_index: Some(index),
            input_data: Some(serde_json::json!({"iterationIndex": index})),
        }
    }

    #[tokio::test]
    async fn test_top_level_lookup_ignores_sub_nodes() {
        let nodes = store();
        let wf = Uuid::now_v7();

        let parent = nodes.create(top_level(wf, "l", "loop")).await.unwrap();
        let mut sub = child(wf, parent.id, 0);
        sub.node_id = "l".to_string();
        nodes.create(sub).await.unwrap();

        let found = nodes
            .find_by_workflow_and_node_id(wf, "l")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, parent.id);
        assert!(found.is_top_level());
    }

    #[tokio::test]
    async fn test_loop_fan_out_is_atomic() {
        let nodes = store();
        let wf = Uuid::now_v7();
        let parent = nodes.create(top_level(wf, "l", "loop")).await.unwrap();

        // Pre-existing child at index 1 makes the batch conflict.
        nodes.create(child(wf, parent.id, 1)).await.unwrap();

        let result = nodes
            .create_loop_children(
                parent.id,
                vec![child(wf, parent.id, 0), child(wf, parent.id, 1)],
                LoopProgress::executing(2),
            )
            .await;
        assert!(result.is_err());

        // Nothing landed: no new children, progress untouched.
        let children = nodes.find_child_nodes(parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        let parent_row = nodes.get(parent.id).await.unwrap().unwrap();
        assert!(parent_row.loop_progress.is_none());
    }

    #[tokio::test]
    async fn test_loop_fan_out_success_sets_progress() {
        let nodes = store();
        let wf = Uuid::now_v7();
        let parent = nodes.create(top_level(wf, "l", "loop")).await.unwrap();

        let children = nodes
            .create_loop_children(
                parent.id,
                (0..3).map(|i| child(wf, parent.id, i)).collect(),
                LoopProgress::executing(3),
            )
            .await
            .unwrap();
        assert_eq!(children.len(), 3);

        let parent_row = nodes.get(parent.id).await.unwrap().unwrap();
        let progress = parent_row.parsed_loop_progress().unwrap();
        assert_eq!(progress.status, LoopPhase::Executing);
        assert_eq!(progress.total_count, 3);
    }

    #[tokio::test]
    async fn test_empty_fan_out_still_sets_progress() {
        let nodes = store();
        let wf = Uuid::now_v7();
        let parent = nodes.create(top_level(wf, "l", "loop")).await.unwrap();

        let children = nodes
            .create_loop_children(parent.id, vec![], LoopProgress::executing(0))
            .await
            .unwrap();
        assert!(children.is_empty());

        let progress = nodes
            .get(parent.id)
            .await
            .unwrap()
            .unwrap()
            .parsed_loop_progress()
            .unwrap();
        assert_eq!(progress.total_count, 0);
        assert_eq!(progress.status, LoopPhase::Executing);
    }

    #[tokio::test]
    async fn test_children_ordered_by_index() {
        let nodes = store();
        let wf = Uuid::now_v7();
        let parent = nodes.create(top_level(wf, "l", "loop")).await.unwrap();

        // Insert out of order.
        for index in [2, 0, 1] {
            nodes.create(child(wf, parent.id, index)).await.unwrap();
        }

        let children = nodes.find_child_nodes(parent.id).await.unwrap();
        let indices: Vec<i32> = children.iter().filter_map(|c| c.child_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_find_all_child_nodes_recurses() {
        let nodes = store();
        let wf = Uuid::now_v7();
        let root = nodes.create(top_level(wf, "p", "parallel")).await.unwrap();
        let mid = nodes.create(child(wf, root.id, 0)).await.unwrap();
        nodes.create(child(wf, mid.id, 0)).await.unwrap();
        nodes.create(child(wf, mid.id, 1)).await.unwrap();

        let all = nodes.find_all_child_nodes(root.id).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_pending_children_shrink_as_they_complete() {
        let nodes = store();
        let wf = Uuid::now_v7();
        let parent = nodes.create(top_level(wf, "l", "loop")).await.unwrap();
        let children = nodes
            .create_loop_children(
                parent.id,
                (0..3).map(|i| child(wf, parent.id, i)).collect(),
                LoopProgress::executing(3),
            )
            .await
            .unwrap();

        nodes
            .update_status(children[0].id, NodeStatus::Running, None, None)
            .await
            .unwrap();
        nodes
            .update_status(children[0].id, NodeStatus::Completed, None, None)
            .await
            .unwrap();

        let pending = nodes.find_pending_child_nodes(parent.id).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].child_index, Some(1));
    }

    #[tokio::test]
    async fn test_terminal_node_rejects_transitions() {
        let nodes = store();
        let wf = Uuid::now_v7();
        let node = nodes.create(top_level(wf, "a", "simple")).await.unwrap();

        nodes
            .update_status(node.id, NodeStatus::Running, None, None)
            .await
            .unwrap();
        nodes
            .update_status(node.id, NodeStatus::Completed, None, None)
            .await
            .unwrap();

        let err = nodes
            .update_status(node.id, NodeStatus::Running, None, None)
            .await;
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));
    }
}
