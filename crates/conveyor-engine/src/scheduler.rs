//! Workflow scheduler
//!
//! Drives workflow instances to completion:
//!
//! 1. acquire `workflow:{instance_id}` in the lock table; losing means
//!    another worker owns the instance
//! 2. repeatedly tick the runnable node set (a node becomes runnable when
//!    every in-edge points at a completed node), renewing the lock at half
//!    TTL
//! 3. when all terminal graph nodes completed, mark the instance
//!    `completed`; a terminally failed node fails the instance
//! 4. release the lock
//!
//! Interrupted instances (running with an expired owner lock, or stopped
//! explicitly) are picked up by [`WorkflowScheduler::resume_workflow`] and
//! re-driven through the same loop; per-node state makes the re-drive
//! land exactly where the previous owner left off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use conveyor_core::definition::WorkflowGraph;
use conveyor_core::executor::DependencyResult;
use conveyor_core::registry::ExecutorRegistry;
use conveyor_core::status::{InstanceStatus, LockType, NodeStatus};
use conveyor_core::{EngineConfig, ValidationError, WorkflowDefinition};
use conveyor_storage::models::{
    CreateExecutionLog, CreateNodeInstance, CreateWorkflowInstance, NodeInstanceRow,
    WorkflowDefinitionRow, WorkflowInstanceRow,
};
use conveyor_storage::{
    workflow_lock_key, DefinitionStore as _, ExecutionLogStore as _, InstanceStore as _,
    LockStore as _, NodeStore as _, QueueStore as _, Stores,
};

use crate::error::{EngineError, Result};
use crate::node_exec::{NodeExecutionService, NodeProgress};

/// Options for starting a workflow instance.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub input_data: Option<Value>,
    pub max_retries: i32,
}

/// Outcome of one drive attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The instance reached a terminal status.
    Finished(InstanceStatus),

    /// Another worker holds the instance lock.
    LockBusy,

    /// The instance halted without a terminal status (paused/interrupted).
    Halted(InstanceStatus),
}

/// The scheduler. One value serves a whole process; instances are
/// serialized per-entity through the lock table, never in memory.
#[derive(Clone)]
pub struct WorkflowScheduler {
    stores: Stores,
    registry: Arc<ExecutorRegistry>,
    node_exec: NodeExecutionService,
    config: EngineConfig,
    worker_id: String,
}

impl WorkflowScheduler {
    pub fn new(
        stores: Stores,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
        queue_name: impl Into<String>,
    ) -> Self {
        let queue_name = queue_name.into();
        let node_exec =
            NodeExecutionService::new(stores.clone(), Arc::clone(&registry), queue_name);

        Self {
            stores,
            registry,
            node_exec,
            config,
            worker_id: format!("scheduler-{}", Uuid::now_v7()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn node_exec(&self) -> &NodeExecutionService {
        &self.node_exec
    }

    /// Create a new instance of a stored definition. Validation covers the
    /// graph structure and executor references; the instance is not driven
    /// yet.
    #[instrument(skip(self, definition, options), fields(definition = %definition.name))]
    pub async fn start_workflow(
        &self,
        definition: &WorkflowDefinitionRow,
        options: StartOptions,
    ) -> Result<WorkflowInstanceRow> {
        let parsed: WorkflowDefinition = parse_definition(definition)?;
        parsed.validate(Some(&self.registry.name_set()))?;

        let instance = self
            .stores
            .instances
            .create(CreateWorkflowInstance {
                definition_id: definition.id,
                definition_name: definition.name.clone(),
                version: definition.version,
                input_data: options.input_data,
                max_retries: options.max_retries,
            })
            .await?;

        info!(instance_id = %instance.id, "workflow instance created");
        self.log_instance(&instance, "info", "workflow instance created");
        Ok(instance)
    }

    /// Drive an instance until it is terminal, halted, or owned elsewhere.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run_workflow(&self, instance_id: Uuid) -> Result<RunOutcome> {
        let lock_key = workflow_lock_key(instance_id);

        let acquired = self
            .stores
            .locks
            .acquire(
                &lock_key,
                &self.worker_id,
                self.config.lock_ttl,
                LockType::Workflow,
                None,
            )
            .await?;
        if !acquired {
            debug!(%instance_id, "workflow lock busy");
            return Ok(RunOutcome::LockBusy);
        }

        let outcome = self.drive_locked(instance_id, &lock_key).await;

        // Release-in-finally semantics for the workflow lock.
        if let Err(e) = self.stores.locks.release(&lock_key, Some(&self.worker_id)).await {
            warn!(error = %e, "failed to release workflow lock");
        }

        outcome
    }

    /// Resume an interrupted instance: flip it back to running, then drive.
    pub async fn resume_workflow(&self, instance_id: Uuid) -> Result<RunOutcome> {
        let instance = self
            .stores
            .instances
            .get(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;

        match instance.status.as_str() {
            "interrupted" => {
                self.stores
                    .instances
                    .update_status(instance_id, InstanceStatus::Running, None)
                    .await?;
                info!(%instance_id, "resuming interrupted workflow");
            }
            "running" | "pending" => {}
            other => {
                return Err(EngineError::invalid_state(format!(
                    "cannot resume instance in status {}",
                    other
                )));
            }
        }

        self.run_workflow(instance_id).await
    }

    /// Stop a running instance: it halts at the next tick and stays
    /// resumable.
    #[instrument(skip(self))]
    pub async fn stop_workflow(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        self.stores
            .instances
            .update_status(instance_id, InstanceStatus::Interrupted, Some(reason))
            .await?;
        info!(%instance_id, reason, "workflow stopped");
        Ok(())
    }

    /// Cancel an instance terminally. Non-terminal nodes are cancelled and
    /// their queued jobs removed; in-flight jobs run to completion but
    /// their results are discarded.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        self.stores
            .instances
            .update_status(instance_id, InstanceStatus::Cancelled, Some(reason))
            .await?;

        let nodes = self.stores.nodes.find_top_level(instance_id).await?;
        let mut frontier: Vec<NodeInstanceRow> = nodes;
        while let Some(node) = frontier.pop() {
            frontier.extend(self.stores.nodes.find_child_nodes(node.id).await?);

            let status: NodeStatus = match node.parsed_status() {
                Ok(status) => status,
                Err(_) => continue,
            };
            if status.is_terminal() || status == NodeStatus::Failed {
                continue;
            }
            if let Some(job_id) = node.job_id {
                // Waiting jobs are removed; executing ones finish advisorily.
                let _ = self.stores.queue.cancel_job(job_id).await;
            }
            if let Err(e) = self
                .stores
                .nodes
                .update_status(node.id, NodeStatus::Cancelled, Some(reason), None)
                .await
            {
                debug!(node_instance_id = %node.id, error = %e, "node not cancellable");
            }
        }

        info!(%instance_id, reason, "workflow cancelled");
        Ok(())
    }

    /// Current status of an instance.
    pub async fn get_workflow_status(&self, instance_id: Uuid) -> Result<InstanceStatus> {
        let instance = self
            .stores
            .instances
            .get(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        instance
            .parsed_status()
            .map_err(EngineError::invalid_state)
    }

    // =========================================================================
    // Drive loop (runs while holding the workflow lock)
    // =========================================================================

    async fn drive_locked(&self, instance_id: Uuid, lock_key: &str) -> Result<RunOutcome> {
        let mut last_renew = Instant::now();

        loop {
            // A stop/cancel lands as a guarded status write; observe it at
            // the top of every tick.
            let instance = self
                .stores
                .instances
                .get(instance_id)
                .await?
                .ok_or(EngineError::InstanceNotFound(instance_id))?;
            let status: InstanceStatus = instance
                .parsed_status()
                .map_err(EngineError::invalid_state)?;

            match status {
                InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Cancelled => {
                    return Ok(RunOutcome::Finished(status));
                }
                InstanceStatus::Interrupted | InstanceStatus::Paused => {
                    return Ok(RunOutcome::Halted(status));
                }
                InstanceStatus::Pending => {
                    self.stores
                        .instances
                        .update_status(instance_id, InstanceStatus::Running, None)
                        .await?;
                    continue;
                }
                InstanceStatus::Running => {}
            }

            // Renew the workflow lock at half TTL so a live drive never
            // loses ownership.
            if last_renew.elapsed() >= self.config.lock_renew_interval() {
                let renewed = self
                    .stores
                    .locks
                    .renew(
                        lock_key,
                        &self.worker_id,
                        Utc::now()
                            + chrono::Duration::from_std(self.config.lock_ttl)
                                .unwrap_or_default(),
                        None,
                    )
                    .await?;
                if !renewed {
                    warn!(%instance_id, "lost workflow lock, abandoning drive");
                    return Ok(RunOutcome::LockBusy);
                }
                last_renew = Instant::now();
            }

            let definition = self
                .stores
                .definitions
                .get_by_id(instance.definition_id)
                .await?
                .ok_or_else(|| {
                    EngineError::DefinitionNotFound(instance.definition_id.to_string())
                })?;
            let graph = parse_definition(&definition)?.graph;

            if let Some(outcome) = self.tick_instance(&instance, &graph).await? {
                return Ok(outcome);
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One pass over the graph. Returns `Some` when the instance settled.
    async fn tick_instance(
        &self,
        instance: &WorkflowInstanceRow,
        graph: &WorkflowGraph,
    ) -> Result<Option<RunOutcome>> {
        let existing = self.stores.nodes.find_top_level(instance.id).await?;
        let mut by_node_id: HashMap<String, NodeInstanceRow> = existing
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();

        let mut progressed: HashMap<String, NodeProgress> = HashMap::new();
        let mut current_node: Option<String> = None;

        for (node_id, spec) in &graph.nodes {
            let row = match by_node_id.remove(node_id) {
                Some(row) => row,
                None => {
                    if !self.is_runnable(instance, graph, node_id, &progressed).await? {
                        continue;
                    }
                    self.stores
                        .nodes
                        .create(CreateNodeInstance {
                            workflow_instance_id: instance.id,
                            parent_node_id: None,
                            node_id: node_id.clone(),
                            node_name: node_id.clone(),
                            node_type: spec.kind().to_string(),
                            child_index: None,
                            input_data: if *node_id == graph.start_node_id {
                                instance.input_data.clone()
                            } else {
                                None
                            },
                        })
                        .await?
                }
            };

            let status: NodeStatus = row
                .parsed_status()
                .map_err(EngineError::invalid_state)?;
            if status.is_terminal() && status != NodeStatus::Failed {
                progressed.insert(
                    node_id.clone(),
                    match status {
                        NodeStatus::Completed => NodeProgress::Completed,
                        _ => NodeProgress::Cancelled,
                    },
                );
                continue;
            }

            let deps = self.dependency_results(instance, graph, node_id).await?;
            let progress = self
                .node_exec
                .tick_node(instance, row, spec.clone(), deps)
                .await?;

            if progress == NodeProgress::InFlight && current_node.is_none() {
                current_node = Some(node_id.clone());
            }
            progressed.insert(node_id.clone(), progress);
        }

        self.stores
            .instances
            .set_current_node(instance.id, current_node.as_deref())
            .await?;

        // Terminal node failure fails the instance.
        if let Some((node_id, message)) = progressed.iter().find_map(|(id, p)| match p {
            NodeProgress::Failed(message) => Some((id.clone(), message.clone())),
            _ => None,
        }) {
            let message = format!("node '{}' failed: {}", node_id, message);
            let updated = self
                .stores
                .instances
                .update_status(instance.id, InstanceStatus::Failed, Some(&message))
                .await?;
            self.log_instance(&updated, "error", &message);
            info!(instance_id = %instance.id, %message, "workflow failed");
            return Ok(Some(RunOutcome::Finished(InstanceStatus::Failed)));
        }

        // All sink nodes completed: the instance is done.
        let sinks = graph.terminal_node_ids();
        let done = !sinks.is_empty()
            && sinks
                .iter()
                .all(|id| matches!(progressed.get(*id), Some(NodeProgress::Completed)));
        if done {
            let results = self.collect_results(instance, &sinks).await?;
            self.stores.instances.set_result(instance.id, results).await?;
            let updated = self
                .stores
                .instances
                .update_status(instance.id, InstanceStatus::Completed, None)
                .await?;
            self.log_instance(&updated, "info", "workflow completed");
            info!(instance_id = %instance.id, "workflow completed");
            return Ok(Some(RunOutcome::Finished(InstanceStatus::Completed)));
        }

        Ok(None)
    }

    /// A node is runnable once every predecessor completed.
    async fn is_runnable(
        &self,
        instance: &WorkflowInstanceRow,
        graph: &WorkflowGraph,
        node_id: &str,
        progressed: &HashMap<String, NodeProgress>,
    ) -> Result<bool> {
        let predecessors = graph.predecessors(node_id);
        if predecessors.is_empty() {
            // Only the declared start node runs spontaneously.
            return Ok(node_id == graph.start_node_id);
        }

        for pred in predecessors {
            if matches!(progressed.get(pred), Some(NodeProgress::Completed)) {
                continue;
            }
            let done = self
                .stores
                .nodes
                .find_by_workflow_and_node_id(instance.id, pred)
                .await?
                .is_some_and(|row| row.status == "completed");
            if !done {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Results of the completed predecessors, for executor context.
    async fn dependency_results(
        &self,
        instance: &WorkflowInstanceRow,
        graph: &WorkflowGraph,
        node_id: &str,
    ) -> Result<Vec<DependencyResult>> {
        let mut deps = vec![];
        for pred in graph.predecessors(node_id) {
            if let Some(row) = self
                .stores
                .nodes
                .find_by_workflow_and_node_id(instance.id, pred)
                .await?
            {
                if let Some(result) = row.result {
                    deps.push(DependencyResult {
                        node_id: pred.to_string(),
                        result,
                    });
                }
            }
        }
        Ok(deps)
    }

    async fn collect_results(
        &self,
        instance: &WorkflowInstanceRow,
        sinks: &[&str],
    ) -> Result<Value> {
        let mut results = serde_json::Map::new();
        for sink in sinks {
            if let Some(row) = self
                .stores
                .nodes
                .find_by_workflow_and_node_id(instance.id, sink)
                .await?
            {
                results.insert(sink.to_string(), row.result.unwrap_or(Value::Null));
            }
        }
        Ok(Value::Object(results))
    }

    fn log_instance(&self, instance: &WorkflowInstanceRow, level: &str, message: &str) {
        let log = CreateExecutionLog {
            workflow_instance_id: Some(instance.id),
            node_instance_id: None,
            level: level.to_string(),
            phase: "scheduler".to_string(),
            message: message.to_string(),
            details: None,
        };
        let logs = Arc::clone(&self.stores.execution_logs);
        tokio::spawn(async move {
            if let Err(e) = logs.create(log).await {
                warn!(error = %e, "execution log write failed");
            }
        });
    }
}

fn parse_definition(row: &WorkflowDefinitionRow) -> Result<WorkflowDefinition> {
    let graph: WorkflowGraph = serde_json::from_value(row.graph.clone())
        .map_err(|e| ValidationError::new(format!("malformed graph: {}", e)))?;
    Ok(WorkflowDefinition::new(row.name.clone(), row.version, graph))
}

/// Wait for an instance to settle; test and schedule-service helper.
pub async fn wait_for_terminal(
    stores: &Stores,
    instance_id: Uuid,
    timeout: Duration,
) -> Result<InstanceStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        let instance = stores
            .instances
            .get(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let status: InstanceStatus = instance
            .parsed_status()
            .map_err(EngineError::invalid_state)?;
        if status.is_terminal() {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout(timeout.as_millis() as u64));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
