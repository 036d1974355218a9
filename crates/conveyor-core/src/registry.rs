//! Executor registry
//!
//! Maps executor names to implementations through explicit registration.
//! Workflow definitions and queue jobs reference executors by name only; a
//! lookup miss is fatal for the affected node (never retried).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::executor::Executor;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No executor registered under the requested name
    #[error("unknown executor: {0}")]
    UnknownExecutor(String),

    /// An executor with this name is already registered
    #[error("executor already registered: {0}")]
    DuplicateExecutor(String),
}

/// Registry of named executors.
///
/// # Example
///
/// ```ignore
/// let mut registry = ExecutorRegistry::new();
/// registry.register(Arc::new(EchoExecutor))?;
/// registry.register_domain("calendar", vec![
///     Arc::new(SyncExecutor),
///     Arc::new(PurgeExecutor),
/// ])?;
///
/// let executor = registry.get("calendar.sync")?;
/// ```
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register a single executor under its own name.
    pub fn register(&mut self, executor: Arc<dyn Executor>) -> Result<(), RegistryError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(RegistryError::DuplicateExecutor(name));
        }
        info!(executor = %name, "registered executor");
        self.executors.insert(name, executor);
        Ok(())
    }

    /// Register a namespaced group in one call; each executor lands under
    /// `"{domain}.{name}"`.
    pub fn register_domain(
        &mut self,
        domain: &str,
        executors: Vec<Arc<dyn Executor>>,
    ) -> Result<(), RegistryError> {
        for executor in executors {
            let name = format!("{}.{}", domain, executor.name());
            if self.executors.contains_key(&name) {
                return Err(RegistryError::DuplicateExecutor(name));
            }
            info!(executor = %name, "registered executor");
            self.executors.insert(name, executor);
        }
        Ok(())
    }

    /// Look up an executor by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Executor>, RegistryError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownExecutor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// All registered executor names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(|s| s.as_str())
    }

    /// The registered name set, for definition validation.
    pub fn name_set(&self) -> std::collections::HashSet<String> {
        self.executors.keys().cloned().collect()
    }

    /// Probe every executor; returns the names that reported unhealthy.
    pub async fn health_check(&self) -> Vec<String> {
        let mut unhealthy = vec![];
        for (name, executor) in &self.executors {
            if !executor.health_check().await {
                unhealthy.push(name.clone());
            }
        }
        unhealthy.sort();
        unhealthy
    }

    /// Run cleanup on every executor (engine shutdown).
    pub async fn cleanup_all(&self) {
        for executor in self.executors.values() {
            executor.cleanup().await;
        }
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionContext, ExecutionOutcome};
    use async_trait::async_trait;

    struct Named {
        name: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl Executor for Named {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _ctx: ExecutionContext) -> ExecutionOutcome {
            ExecutionOutcome::ok(serde_json::Value::Null)
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(Arc::new(Named {
                name: "echo",
                healthy: true,
            }))
            .unwrap();

        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(RegistryError::UnknownExecutor(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(Arc::new(Named {
                name: "echo",
                healthy: true,
            }))
            .unwrap();
        let result = registry.register(Arc::new(Named {
            name: "echo",
            healthy: true,
        }));
        assert!(matches!(result, Err(RegistryError::DuplicateExecutor(_))));
    }

    #[test]
    fn test_register_domain_namespaces_names() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register_domain(
                "calendar",
                vec![
                    Arc::new(Named {
                        name: "sync",
                        healthy: true,
                    }),
                    Arc::new(Named {
                        name: "purge",
                        healthy: true,
                    }),
                ],
            )
            .unwrap();

        assert!(registry.contains("calendar.sync"));
        assert!(registry.contains("calendar.purge"));
        assert!(!registry.contains("sync"));
    }

    #[tokio::test]
    async fn test_health_check_reports_unhealthy() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(Arc::new(Named {
                name: "good",
                healthy: true,
            }))
            .unwrap();
        registry
            .register(Arc::new(Named {
                name: "bad",
                healthy: false,
            }))
            .unwrap();

        assert_eq!(registry.health_check().await, vec!["bad".to_string()]);
    }
}
