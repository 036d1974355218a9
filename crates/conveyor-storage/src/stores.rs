//! Trait-object bundle of all stores
//!
//! The engine consumes this bundle so production (PostgreSQL) and tests
//! (in-memory) run the exact same code paths.

use std::sync::Arc;

use crate::store::{
    DefinitionStore, ExecutionLogStore, InstanceStore, LockStore, NodeStore, QueueStore,
    ScheduleStore,
};

/// One handle per persistence domain.
#[derive(Clone)]
pub struct Stores {
    pub locks: Arc<dyn LockStore>,
    pub queue: Arc<dyn QueueStore>,
    pub definitions: Arc<dyn DefinitionStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub nodes: Arc<dyn NodeStore>,
    pub execution_logs: Arc<dyn ExecutionLogStore>,
    pub schedules: Arc<dyn ScheduleStore>,
}
