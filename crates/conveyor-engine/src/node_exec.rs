//! Node execution service
//!
//! Drives the per-node state machine:
//!
//! ```text
//! pending → running → completed
//!                  \→ failed → (retry?) → running again
//!                  \→ cancelled
//! ```
//!
//! Kind dispatch:
//! - `simple` enqueues one queue job and completes when the job lands in
//!   the success table
//! - `parallel` fans out one child per branch in a single transaction and
//!   joins on the configured policy
//! - `loop` runs two phases (`creating`: invoke the data source and fan
//!   out children in ONE transaction; `executing`: drive children),
//!   resumable at either boundary
//!
//! Each call to [`NodeExecutionService::tick_node`] performs one
//! non-blocking step; the scheduler calls it repeatedly under the
//! instance's workflow lock.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use conveyor_core::definition::{
    JoinPolicy, LoopExecutorConfig, LoopSourceSpec, NodeRetrySpec, NodeSpec, OnChildFailure,
};
use conveyor_core::executor::{DependencyResult, ExecutionContext};
use conveyor_core::registry::ExecutorRegistry;
use conveyor_core::status::{LoopPhase, LoopProgress, NodeStatus};
use conveyor_storage::models::{
    CreateExecutionLog, CreateNodeInstance, CreateQueueJob, NodeInstanceRow, WorkflowInstanceRow,
};
use conveyor_storage::{
    ExecutionLogStore as _, NodeStore as _, QueueStore as _, Stores,
};

use crate::error::{EngineError, Result};

/// Progress of one node after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeProgress {
    /// Work is in flight; tick again later.
    InFlight,

    /// The node reached `completed`.
    Completed,

    /// The node failed terminally.
    Failed(String),

    /// The node was cancelled or skipped.
    Cancelled,
}

impl NodeProgress {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeProgress::InFlight)
    }
}

/// Per-node executor of the workflow state machine.
#[derive(Clone)]
pub struct NodeExecutionService {
    stores: Stores,
    registry: Arc<ExecutorRegistry>,
    queue_name: String,
}

impl NodeExecutionService {
    pub fn new(
        stores: Stores,
        registry: Arc<ExecutorRegistry>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            registry,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Advance one node by one step. `deps` carries upstream results for
    /// top-level nodes; fan-out children get their inputs at creation.
    pub fn tick_node<'a>(
        &'a self,
        instance: &'a WorkflowInstanceRow,
        node: NodeInstanceRow,
        spec: NodeSpec,
        deps: Vec<DependencyResult>,
    ) -> BoxFuture<'a, Result<NodeProgress>> {
        Box::pin(async move {
            let status: NodeStatus = node
                .parsed_status()
                .map_err(EngineError::invalid_state)?;

            match status {
                NodeStatus::Completed => Ok(NodeProgress::Completed),
                NodeStatus::Cancelled | NodeStatus::Skipped => Ok(NodeProgress::Cancelled),
                NodeStatus::Failed => Ok(NodeProgress::Failed(
                    node.error_message
                        .clone()
                        .unwrap_or_else(|| "node failed".to_string()),
                )),
                NodeStatus::Pending | NodeStatus::FailedRetry => {
                    self.start_node(instance, node, spec, deps).await
                }
                NodeStatus::Running => match spec {
                    NodeSpec::Simple {
                        executor,
                        input_data,
                        retry,
                    } => {
                        self.poll_simple(
                            instance,
                            node,
                            &executor,
                            input_data,
                            retry.unwrap_or_default(),
                            deps,
                        )
                        .await
                    }
                    NodeSpec::Parallel {
                        branches,
                        join_policy,
                    } => {
                        self.poll_fan_out(instance, node, FanOut::Parallel {
                            branches,
                            join_policy,
                        })
                        .await
                    }
                    NodeSpec::Loop {
                        source,
                        child,
                        executor_config,
                        on_child_failure,
                    } => {
                        self.poll_loop(
                            instance,
                            node,
                            source,
                            *child,
                            executor_config,
                            on_child_failure,
                        )
                        .await
                    }
                },
            }
        })
    }

    /// First dispatch of a pending node.
    async fn start_node(
        &self,
        instance: &WorkflowInstanceRow,
        node: NodeInstanceRow,
        spec: NodeSpec,
        deps: Vec<DependencyResult>,
    ) -> Result<NodeProgress> {
        if instance_is_halted(instance) {
            self.stores
                .nodes
                .update_status(node.id, NodeStatus::Cancelled, None, None)
                .await?;
            return Ok(NodeProgress::Cancelled);
        }

        let node = self
            .stores
            .nodes
            .update_status(node.id, NodeStatus::Running, None, None)
            .await?;
        self.log_node(instance, &node, "info", "node started");

        match spec {
            NodeSpec::Simple {
                executor,
                input_data,
                ..
            } => {
                self.dispatch_simple(instance, &node, &executor, input_data.as_ref(), &deps)
                    .await?;
                Ok(NodeProgress::InFlight)
            }
            NodeSpec::Parallel { branches, .. } => {
                self.fan_out_parallel(&node, &branches).await?;
                Ok(NodeProgress::InFlight)
            }
            NodeSpec::Loop {
                source,
                child,
                executor_config,
                on_child_failure,
            } => {
                self.run_creating_phase(instance, &node, &source).await?;
                // Re-read and fall through to the executing phase so an
                // empty fan-out completes in the same tick.
                let node = self
                    .stores
                    .nodes
                    .get(node.id)
                    .await?
                    .ok_or(conveyor_storage::StoreError::NodeNotFound(node.id))?;
                if node.parsed_status() == Ok(NodeStatus::Failed) {
                    return Ok(NodeProgress::Failed(
                        node.error_message.unwrap_or_default(),
                    ));
                }
                self.poll_loop(
                    instance,
                    node,
                    source,
                    *child,
                    executor_config,
                    on_child_failure,
                )
                .await
            }
        }
    }

    // =========================================================================
    // Simple nodes
    // =========================================================================

    async fn dispatch_simple(
        &self,
        instance: &WorkflowInstanceRow,
        node: &NodeInstanceRow,
        executor: &str,
        spec_input: Option<&Value>,
        deps: &[DependencyResult],
    ) -> Result<()> {
        // Fail fast on unknown executors: fatal for the node, not retried.
        if !self.registry.contains(executor) {
            self.stores
                .nodes
                .update_status(
                    node.id,
                    NodeStatus::Failed,
                    Some(&format!("unknown executor: {}", executor)),
                    None,
                )
                .await?;
            return Ok(());
        }

        let payload = merge_inputs(deps, spec_input, node.input_data.as_ref());
        let metadata = json!({
            "workflowInstanceId": instance.id,
            "nodeInstanceId": node.id,
            "dependencies": deps,
        });

        let job = self
            .stores
            .queue
            .submit(
                CreateQueueJob::new(&self.queue_name, &node.node_name, executor, payload)
                    .with_max_attempts(1)
                    .with_metadata(metadata),
            )
            .await?;
        self.stores.nodes.set_job_id(node.id, Some(job.id)).await?;

        debug!(node_instance_id = %node.id, job_id = %job.id, "dispatched node job");
        Ok(())
    }

    async fn poll_simple(
        &self,
        instance: &WorkflowInstanceRow,
        node: NodeInstanceRow,
        executor: &str,
        spec_input: Option<Value>,
        retry: NodeRetrySpec,
        deps: Vec<DependencyResult>,
    ) -> Result<NodeProgress> {
        let Some(job_id) = node.job_id else {
            // Crashed between submit and link; re-dispatch (at-least-once).
            warn!(node_instance_id = %node.id, "running node without job link, re-dispatching");
            self.dispatch_simple(instance, &node, executor, spec_input.as_ref(), &deps)
                .await?;
            return Ok(NodeProgress::InFlight);
        };

        if let Some(success) = self.stores.queue.get_success(job_id).await? {
            let result = success.result.unwrap_or(Value::Null);
            self.stores.nodes.set_result(node.id, result).await?;
            let node = self
                .stores
                .nodes
                .update_status(node.id, NodeStatus::Completed, None, None)
                .await?;
            self.log_node(instance, &node, "info", "node completed");
            return Ok(NodeProgress::Completed);
        }

        if let Some(job) = self.stores.queue.get_job(job_id).await? {
            if job.status != "failed" {
                return Ok(NodeProgress::InFlight);
            }

            let message = job
                .error_message
                .clone()
                .unwrap_or_else(|| "job failed".to_string());

            // Retry budget: reset the same job so its id (and history)
            // carries over.
            if (node.retry_count as u32) < retry.max_retries {
                let retries = self.stores.nodes.increment_retry_count(node.id).await?;
                self.stores.queue.retry_failed_job(job_id).await?;
                debug!(
                    node_instance_id = %node.id,
                    retries,
                    "node job failed, retry scheduled"
                );
                return Ok(NodeProgress::InFlight);
            }

            let details = json!({
                "jobId": job_id,
                "errorCode": job.error_code,
                "attempts": job.attempts,
            });
            let node = self
                .stores
                .nodes
                .update_status(node.id, NodeStatus::Failed, Some(&message), Some(details))
                .await?;
            self.log_node(instance, &node, "error", &message);
            return Ok(NodeProgress::Failed(message));
        }

        if let Some(failure) = self.stores.queue.get_failure(job_id).await? {
            let message = failure
                .error_message
                .unwrap_or_else(|| "job rejected".to_string());
            self.stores
                .nodes
                .update_status(node.id, NodeStatus::Failed, Some(&message), None)
                .await?;
            return Ok(NodeProgress::Failed(message));
        }

        // Job vanished without a success or failure record; re-dispatch.
        warn!(node_instance_id = %node.id, %job_id, "node job lost, re-dispatching");
        self.dispatch_simple(instance, &node, executor, spec_input.as_ref(), &deps)
            .await?;
        Ok(NodeProgress::InFlight)
    }

    // =========================================================================
    // Parallel nodes
    // =========================================================================

    async fn fan_out_parallel(&self, node: &NodeInstanceRow, branches: &[NodeSpec]) -> Result<()> {
        let children: Vec<CreateNodeInstance> = branches
            .iter()
            .enumerate()
            .map(|(index, branch)| CreateNodeInstance {
                workflow_instance_id: node.workflow_instance_id,
                parent_node_id: Some(node.id),
                node_id: format!("{}#{}", node.node_id, index),
                node_name: format!("{}#{}", node.node_name, index),
                node_type: branch.kind().to_string(),
                child_index: Some(index as i32),
                input_data: None,
            })
            .collect();

        let count = children.len() as i32;
        self.stores
            .nodes
            .create_loop_children(node.id, children, LoopProgress::executing(count))
            .await?;

        debug!(node_instance_id = %node.id, branches = count, "parallel fan-out");
        Ok(())
    }

    async fn poll_fan_out(
        &self,
        instance: &WorkflowInstanceRow,
        node: NodeInstanceRow,
        fan_out: FanOut,
    ) -> Result<NodeProgress> {
        let children = self.stores.nodes.find_child_nodes(node.id).await?;

        // Recovery: running parallel node without children redoes fan-out.
        if children.is_empty() {
            if let FanOut::Parallel { ref branches, .. } = fan_out {
                if !branches.is_empty() {
                    self.fan_out_parallel(&node, branches).await?;
                    return Ok(NodeProgress::InFlight);
                }
            }
        }

        // Drive non-terminal children.
        let tick_all = fan_out.parallel_children();
        let mut ticked = 0usize;
        for child in &children {
            let child_status: NodeStatus = child
                .parsed_status()
                .map_err(EngineError::invalid_state)?;
            if child_status.is_terminal() {
                continue;
            }
            if !tick_all && ticked >= 1 {
                break;
            }
            if let Some(cap) = fan_out.concurrency_cap() {
                if ticked >= cap {
                    break;
                }
            }

            let child_spec = fan_out.child_spec(child.child_index.unwrap_or(0) as usize)?;
            self.tick_node(instance, child.clone(), child_spec, vec![])
                .await?;
            ticked += 1;
        }

        // Re-read and settle.
        let children = self.stores.nodes.find_child_nodes(node.id).await?;
        let total = children.len() as i32;
        let completed = children.iter().filter(|c| c.status == "completed").count() as i32;
        let failed = children
            .iter()
            .filter(|c| matches!(c.status.as_str(), "failed" | "cancelled"))
            .count() as i32;

        let mut progress = node.parsed_loop_progress().unwrap_or_else(|| {
            LoopProgress::executing(total)
        });
        progress.total_count = total;
        progress.completed_count = completed;
        progress.failed_count = failed;

        // Abort policy stops scheduling pending children once one failed.
        if failed > 0 && fan_out.aborts_on_child_failure() {
            for child in &children {
                if child.status == "pending" {
                    self.stores
                        .nodes
                        .update_status(child.id, NodeStatus::Cancelled, None, None)
                        .await?;
                }
            }
        }

        if !progress.is_settled() {
            self.stores
                .nodes
                .update_loop_progress(node.id, progress)
                .await?;
            return Ok(NodeProgress::InFlight);
        }

        progress.status = LoopPhase::Completed;
        self.stores
            .nodes
            .update_loop_progress(node.id, progress.clone())
            .await?;

        let succeeded = match fan_out.join_policy() {
            JoinPolicy::All => progress.failed_count == 0,
            JoinPolicy::AnySuccess => progress.completed_count > 0,
        };

        if succeeded {
            let result = aggregate_child_results(&children);
            self.stores.nodes.set_result(node.id, result).await?;
            let node = self
                .stores
                .nodes
                .update_status(node.id, NodeStatus::Completed, None, None)
                .await?;
            self.log_node(instance, &node, "info", "node completed");
            Ok(NodeProgress::Completed)
        } else {
            let message = format!("{} of {} children failed", progress.failed_count, total);
            let node = self
                .stores
                .nodes
                .update_status(node.id, NodeStatus::Failed, Some(&message), None)
                .await?;
            self.log_node(instance, &node, "error", &message);
            Ok(NodeProgress::Failed(message))
        }
    }

    // =========================================================================
    // Loop nodes
    // =========================================================================

    /// The `creating` phase: invoke the data source and fan children out in
    /// one transaction. Safe to re-run: existing children short-circuit.
    async fn run_creating_phase(
        &self,
        instance: &WorkflowInstanceRow,
        node: &NodeInstanceRow,
        source: &LoopSourceSpec,
    ) -> Result<()> {
        // Replay guard: a crash after the fan-out transaction leaves
        // children behind; adopt them instead of re-running the source.
        let existing = self.stores.nodes.find_child_nodes(node.id).await?;
        if !existing.is_empty() {
            let mut progress = node
                .parsed_loop_progress()
                .unwrap_or_else(|| LoopProgress::executing(existing.len() as i32));
            progress.status = LoopPhase::Executing;
            progress.total_count = existing.len() as i32;
            self.stores
                .nodes
                .update_loop_progress(node.id, progress)
                .await?;
            return Ok(());
        }

        self.stores
            .nodes
            .update_loop_progress(node.id, LoopProgress::creating())
            .await?;

        let executor = match self.registry.get(&source.executor) {
            Ok(executor) => executor,
            Err(e) => {
                self.stores
                    .nodes
                    .update_status(node.id, NodeStatus::Failed, Some(&e.to_string()), None)
                    .await?;
                return Ok(());
            }
        };

        let ctx = ExecutionContext {
            config: source.config.clone(),
            input_data: node
                .input_data
                .clone()
                .or_else(|| instance.input_data.clone())
                .unwrap_or(Value::Null),
            workflow_instance_id: Some(instance.id),
            node_instance_id: Some(node.id),
            ..Default::default()
        };
        let outcome = executor.execute(ctx).await;

        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "loop source failed".to_string());
            self.stores
                .nodes
                .update_status(node.id, NodeStatus::Failed, Some(&message), outcome.error_details)
                .await?;
            self.log_node(instance, node, "error", &message);
            return Ok(());
        }

        let items: Vec<Value> = match outcome.data {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => vec![],
            Some(other) => {
                let message = format!(
                    "loop source must return an array, got {}",
                    json_kind(&other)
                );
                self.stores
                    .nodes
                    .update_status(node.id, NodeStatus::Failed, Some(&message), None)
                    .await?;
                return Ok(());
            }
        };

        let children: Vec<CreateNodeInstance> = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let mut input = json!({ "iterationIndex": index });
                match item {
                    Value::Object(fields) => {
                        for (key, value) in fields {
                            input[key.clone()] = value.clone();
                        }
                    }
                    other => input["item"] = other.clone(),
                }
                CreateNodeInstance {
                    workflow_instance_id: node.workflow_instance_id,
                    parent_node_id: Some(node.id),
                    node_id: format!("{}[{}]", node.node_id, index),
                    node_name: format!("{}[{}]", node.node_name, index),
                    node_type: "simple".to_string(),
                    child_index: Some(index as i32),
                    input_data: Some(input),
                }
            })
            .collect();

        // The fan-out transaction: all children plus the phase flip, or
        // nothing.
        let total = children.len() as i32;
        self.stores
            .nodes
            .create_loop_children(node.id, children, LoopProgress::executing(total))
            .await?;

        debug!(node_instance_id = %node.id, items = total, "loop fan-out");
        Ok(())
    }

    async fn poll_loop(
        &self,
        instance: &WorkflowInstanceRow,
        node: NodeInstanceRow,
        source: LoopSourceSpec,
        child_template: NodeSpec,
        executor_config: LoopExecutorConfig,
        on_child_failure: OnChildFailure,
    ) -> Result<NodeProgress> {
        let progress = node.parsed_loop_progress();

        match progress.as_ref().map(|p| p.status) {
            None | Some(LoopPhase::Creating) => {
                // Interrupted mid-creation: redo the phase (the fan-out
                // transaction either fully landed or not at all).
                self.run_creating_phase(instance, &node, &source).await?;
                let node = self
                    .stores
                    .nodes
                    .get(node.id)
                    .await?
                    .ok_or(conveyor_storage::StoreError::NodeNotFound(node.id))?;
                if node.parsed_status() == Ok(NodeStatus::Failed) {
                    return Ok(NodeProgress::Failed(node.error_message.unwrap_or_default()));
                }
                match node.parsed_loop_progress().map(|p| p.status) {
                    Some(LoopPhase::Executing) => {
                        self.poll_fan_out(
                            instance,
                            node,
                            FanOut::Loop {
                                child_template,
                                executor_config,
                                on_child_failure,
                            },
                        )
                        .await
                    }
                    Some(LoopPhase::Completed) => Ok(NodeProgress::Completed),
                    _ => Ok(NodeProgress::InFlight),
                }
            }
            Some(LoopPhase::Executing) => {
                self.poll_fan_out(
                    instance,
                    node,
                    FanOut::Loop {
                        child_template,
                        executor_config,
                        on_child_failure,
                    },
                )
                .await
            }
            Some(LoopPhase::Completed) => Ok(NodeProgress::Completed),
        }
    }

    fn log_node(&self, instance: &WorkflowInstanceRow, node: &NodeInstanceRow, level: &str, message: &str) {
        // Best-effort: a failed log write never fails the step.
        let log = CreateExecutionLog {
            workflow_instance_id: Some(instance.id),
            node_instance_id: Some(node.id),
            level: level.to_string(),
            phase: "node_execution".to_string(),
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

/// The two fan-out shapes share the child-driving loop.
enum FanOut {
    Parallel {
        branches: Vec<NodeSpec>,
        join_policy: JoinPolicy,
    },
    Loop {
        child_template: NodeSpec,
        executor_config: LoopExecutorConfig,
        on_child_failure: OnChildFailure,
    },
}

impl FanOut {
    fn child_spec(&self, index: usize) -> Result<NodeSpec> {
        match self {
            FanOut::Parallel { branches, .. } => branches
                .get(index)
                .cloned()
                .ok_or_else(|| EngineError::invalid_state(format!("no branch at index {}", index))),
            FanOut::Loop { child_template, .. } => Ok(child_template.clone()),
        }
    }

    fn parallel_children(&self) -> bool {
        match self {
            FanOut::Parallel { .. } => true,
            FanOut::Loop {
                executor_config, ..
            } => executor_config.parallel,
        }
    }

    fn concurrency_cap(&self) -> Option<usize> {
        match self {
            FanOut::Parallel { .. } => None,
            FanOut::Loop {
                executor_config, ..
            } => executor_config.concurrency.map(|c| c.max(1) as usize),
        }
    }

    fn join_policy(&self) -> JoinPolicy {
        match self {
            FanOut::Parallel { join_policy, .. } => *join_policy,
            // Loop completion policy: any failed child fails the loop.
            FanOut::Loop { .. } => JoinPolicy::All,
        }
    }

    fn aborts_on_child_failure(&self) -> bool {
        matches!(
            self,
            FanOut::Loop {
                on_child_failure: OnChildFailure::Abort,
                ..
            }
        )
    }
}

fn instance_is_halted(instance: &WorkflowInstanceRow) -> bool {
    matches!(
        instance.status.as_str(),
        "cancelled" | "failed" | "interrupted" | "paused"
    )
}

/// Merge executor input: dependency outputs first, static spec input next,
/// then the row's own input (fan-out data) on top.
fn merge_inputs(
    deps: &[DependencyResult],
    spec_input: Option<&Value>,
    row_input: Option<&Value>,
) -> Value {
    let mut merged = serde_json::Map::new();

    for dep in deps {
        if let Value::Object(fields) = &dep.result {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    for layer in [spec_input, row_input].into_iter().flatten() {
        if let Value::Object(fields) = layer {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(merged)
}

/// Child results ordered by `child_index`; failed children contribute null.
fn aggregate_child_results(children: &[NodeInstanceRow]) -> Value {
    let mut ordered: Vec<&NodeInstanceRow> = children.iter().collect();
    ordered.sort_by_key(|c| (c.child_index.unwrap_or(0), c.id));
    Value::Array(
        ordered
            .iter()
            .map(|c| c.result.clone().unwrap_or(Value::Null))
            .collect(),
    )
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_merge_inputs_layering() {
        let deps = vec![DependencyResult {
            node_id: "a".to_string(),
            result: json!({"x": 1, "y": 1}),
        }];
        let spec = json!({"y": 2, "z": 2});
        let row = json!({"z": 3});

        let merged = merge_inputs(&deps, Some(&spec), Some(&row));
        assert_eq!(merged, json!({"x": 1, "y": 2, "z": 3}));
    }

    #[test]
    fn test_merge_inputs_empty() {
        assert_eq!(merge_inputs(&[], None, None), json!({}));
    }

    #[test]
    fn test_aggregate_orders_by_child_index() {
        let mk = |index: i32, result: Value| {
            let mut row = NodeInstanceRow {
                id: Uuid::now_v7(),
                workflow_instance_id: Uuid::nil(),
                parent_node_id: None,
                node_id: String::new(),
                node_name: String::new(),
                node_type: "simple".to_string(),
                status: "completed".to_string(),
                child_index: Some(index),
                input_data: None,
                result: None,
                loop_progress: None,
                job_id: None,
                retry_count: 0,
                error_message: None,
                error_details: None,
                started_at: None,
                completed_at: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            };
            row.result = Some(result);
            row
        };

        let children = vec![mk(2, json!(3)), mk(0, json!(1)), mk(1, json!(2))];
        assert_eq!(aggregate_child_results(&children), json!([1, 2, 3]));
    }
}
