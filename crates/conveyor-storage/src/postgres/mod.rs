//! PostgreSQL implementations of the store traits
//!
//! Production persistence with:
//! - the lock upsert as a single atomic statement
//! - queue claims guarded by `FOR UPDATE SKIP LOCKED`
//! - transactional success moves and loop fan-outs
//! - recursive CTE traversal of node trees

mod definition;
mod instance;
mod lock;
mod log;
mod node;
mod queue;
mod schedule;

pub use definition::PgDefinitionStore;
pub use instance::PgInstanceStore;
pub use lock::PgLockStore;
pub use log::PgExecutionLogStore;
pub use node::PgNodeStore;
pub use queue::PgQueueStore;
pub use schedule::PgScheduleStore;

use std::sync::Arc;

use sqlx::PgPool;

use crate::stores::Stores;

/// Bundle of PostgreSQL stores sharing one connection pool.
///
/// # Example
///
/// ```ignore
/// let stores = PostgresStores::from_url("postgres://localhost/conveyor").await?;
/// stores.migrate().await?;
/// let stores: Stores = stores.into_stores();
/// ```
#[derive(Clone)]
pub struct PostgresStores {
    pool: PgPool,
}

impl PostgresStores {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a connection pool from a database URL.
    pub async fn from_url(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn locks(&self) -> PgLockStore {
        PgLockStore::new(self.pool.clone())
    }

    pub fn queue(&self) -> PgQueueStore {
        PgQueueStore::new(self.pool.clone())
    }

    pub fn definitions(&self) -> PgDefinitionStore {
        PgDefinitionStore::new(self.pool.clone())
    }

    pub fn instances(&self) -> PgInstanceStore {
        PgInstanceStore::new(self.pool.clone())
    }

    pub fn nodes(&self) -> PgNodeStore {
        PgNodeStore::new(self.pool.clone())
    }

    pub fn execution_logs(&self) -> PgExecutionLogStore {
        PgExecutionLogStore::new(self.pool.clone())
    }

    pub fn schedules(&self) -> PgScheduleStore {
        PgScheduleStore::new(self.pool.clone())
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
