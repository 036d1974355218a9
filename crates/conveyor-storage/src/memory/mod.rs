//! In-memory implementations of the store traits
//!
//! Primarily for tests and embedded use. All tables live in one shared
//! [`InMemoryState`] so cross-table queries (interrupted instances joining
//! the lock table) behave like the PostgreSQL implementation.

mod definition;
mod instance;
mod lock;
mod log;
mod node;
mod queue;
mod schedule;

pub use definition::InMemoryDefinitionStore;
pub use instance::InMemoryInstanceStore;
pub use lock::InMemoryLockStore;
pub use log::InMemoryExecutionLogStore;
pub use node::InMemoryNodeStore;
pub use queue::InMemoryQueueStore;
pub use schedule::InMemoryScheduleStore;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::*;
use crate::stores::Stores;

/// The shared "database": one RwLock per table.
#[derive(Default)]
pub struct InMemoryState {
    pub(crate) locks: RwLock<HashMap<String, LockRow>>,
    pub(crate) queue_jobs: RwLock<HashMap<Uuid, QueueJobRow>>,
    pub(crate) queue_successes: RwLock<HashMap<Uuid, QueueSuccessRow>>,
    pub(crate) queue_failures: RwLock<HashMap<Uuid, QueueFailureRow>>,
    pub(crate) definitions: RwLock<HashMap<Uuid, WorkflowDefinitionRow>>,
    pub(crate) instances: RwLock<HashMap<Uuid, WorkflowInstanceRow>>,
    pub(crate) nodes: RwLock<HashMap<Uuid, NodeInstanceRow>>,
    pub(crate) logs: RwLock<Vec<ExecutionLogRow>>,
    pub(crate) schedules: RwLock<HashMap<Uuid, ScheduleRow>>,
    pub(crate) schedule_executions: RwLock<HashMap<Uuid, ScheduleExecutionRow>>,
}

impl InMemoryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Bundle of in-memory stores over one shared state.
///
/// # Example
///
/// ```
/// use conveyor_storage::memory::InMemoryStores;
///
/// let stores = InMemoryStores::new().into_stores();
/// ```
#[derive(Clone)]
pub struct InMemoryStores {
    state: Arc<InMemoryState>,
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self {
            state: InMemoryState::new(),
        }
    }

    pub fn state(&self) -> Arc<InMemoryState> {
        Arc::clone(&self.state)
    }

    pub fn locks(&self) -> InMemoryLockStore {
        InMemoryLockStore::new(self.state())
    }

    pub fn queue(&self) -> InMemoryQueueStore {
        InMemoryQueueStore::new(self.state())
    }

    pub fn definitions(&self) -> InMemoryDefinitionStore {
        InMemoryDefinitionStore::new(self.state())
    }

    pub fn instances(&self) -> InMemoryInstanceStore {
        InMemoryInstanceStore::new(self.state())
    }

    pub fn nodes(&self) -> InMemoryNodeStore {
        InMemoryNodeStore::new(self.state())
    }

    pub fn execution_logs(&self) -> InMemoryExecutionLogStore {
        InMemoryExecutionLogStore::new(self.state())
    }

    pub fn schedules(&self) -> InMemoryScheduleStore {
        InMemoryScheduleStore::new(self.state())
    }

    /// Erase the concrete types into the trait-object bundle the engine
    /// consumes.
    pub fn into_stores(self) -> Stores {
        Stores {
            locks: Arc::new(self.locks()),
            queue: Arc::new(self.queue()),
            definitions: Arc::new(self.definitions()),
            instances: Arc::new(self.instances()),
            nodes: Arc::new(self.nodes()),
            execution_logs: Arc::new(self.execution_logs()),
            schedules: Arc::new(self.schedules()),
        }
    }
}
