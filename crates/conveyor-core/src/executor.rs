//! Executor contract
//!
//! An executor is a named, pluggable handler that performs the actual work
//! behind a `simple` node or an ad-hoc queue job. The engine talks to
//! executors in JSON: the context carries configuration, input data and the
//! results of dependency nodes; the outcome carries success/failure plus
//! optional progress, metrics and follow-up tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Result of a dependency node, made available to downstream executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyResult {
    pub node_id: String,
    pub result: serde_json::Value,
}

/// Everything an executor receives for one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Static executor configuration from the node spec.
    #[serde(default)]
    pub config: serde_json::Value,

    /// Input payload (node `input_data` merged with submit-time data).
    #[serde(default)]
    pub input_data: serde_json::Value,

    /// Results of upstream nodes this node depends on.
    #[serde(default)]
    pub dependencies: Vec<DependencyResult>,

    /// Correlation ids for logging and idempotency hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_instance_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_instance_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,

    /// Free-form metadata (queue job metadata, loop iteration index, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(input_data: serde_json::Value) -> Self {
        Self {
            input_data,
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<DependencyResult>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Result of the dependency with the given node id, if present.
    pub fn dependency(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.dependencies
            .iter()
            .find(|d| d.node_id == node_id)
            .map(|d| &d.result)
    }
}

/// Runtime metrics an executor may report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_processed: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_metrics: Option<serde_json::Value>,
}

/// A follow-up task requested by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTask {
    pub executor: String,
    pub payload: serde_json::Value,
}

/// What an executor returns.
///
/// `success == false` implies `error` is set; the engine turns it into the
/// node's `error_message`/`error_details` and applies the retry policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_tasks: Vec<NextTask>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
}

impl ExecutionOutcome {
    /// A successful outcome with the given result data.
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    /// A failed outcome with the given error message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error_details = Some(details);
        self
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// A named, pluggable work handler.
///
/// Implementations must be cheap to share (`Arc<dyn Executor>`); any state
/// they hold must be internally synchronized.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Registry name. Workflow definitions reference executors by this name
    /// only.
    fn name(&self) -> &str;

    /// Perform the work. Infallible at the Rust level: failures are reported
    /// through `ExecutionOutcome::success == false` so the engine can apply
    /// its retry policy uniformly.
    async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome;

    /// Validate static configuration at registration/definition time.
    fn validate(&self, _config: &serde_json::Value) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Liveness probe used by the registry's health check.
    async fn health_check(&self) -> bool {
        true
    }

    /// Release held resources on engine shutdown.
    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome {
            ExecutionOutcome::ok(ctx.input_data)
        }
    }

    #[tokio::test]
    async fn test_echo_executor() {
        let executor = Echo;
        let outcome = executor
            .execute(ExecutionContext::new(serde_json::json!({"text": "hi"})))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(serde_json::json!({"text": "hi"})));
    }

    #[test]
    fn test_outcome_serialization_skips_empty_fields() {
        let outcome = ExecutionOutcome::ok(serde_json::json!(1));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
        assert!(json.get("nextTasks").is_none());
    }

    #[test]
    fn test_context_dependency_lookup() {
        let ctx = ExecutionContext::new(serde_json::json!({})).with_dependencies(vec![
            DependencyResult {
                node_id: "a".to_string(),
                result: serde_json::json!({"v": 1}),
            },
        ]);
        assert_eq!(ctx.dependency("a"), Some(&serde_json::json!({"v": 1})));
        assert_eq!(ctx.dependency("b"), None);
    }

    #[test]
    fn test_err_outcome_with_details() {
        let outcome = ExecutionOutcome::err("upstream 503")
            .with_details(serde_json::json!({"status": 503}));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("upstream 503"));
        assert!(outcome.error_details.is_some());
    }
}
