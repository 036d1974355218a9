//! # Conveyor storage
//!
//! Persistence layer for the Conveyor orchestration engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    store traits                           │
//! │  LockStore · QueueStore · DefinitionStore · InstanceStore │
//! │  NodeStore · ExecutionLogStore · ScheduleStore            │
//! └──────────────────────────────────────────────────────────┘
//!            │                                 │
//!            ▼                                 ▼
//! ┌──────────────────────┐        ┌──────────────────────────┐
//! │   PostgresStores      │        │     InMemoryStores        │
//! │ (sqlx, migrations,    │        │ (shared state, used by    │
//! │  SKIP LOCKED claims)  │        │  engine tests)            │
//! └──────────────────────┘        └──────────────────────────┘
//! ```
//!
//! Correctness-critical operations:
//!
//! - lock `acquire` is one atomic upsert statement
//! - queue `move_to_success` is a transaction (insert archive row, delete
//!   active row)
//! - loop fan-out `create_loop_children` creates all children and flips the
//!   parent's progress in one transaction
//! - definition `activate_version` swaps the active flag atomically

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
pub mod stores;

pub use error::StoreError;
pub use memory::InMemoryStores;
pub use postgres::PostgresStores;
pub use store::{schedule_tick_lock_key, workflow_lock_key};
pub use store::{
    DefinitionStore, ExecutionLogStore, InstanceStore, LockStore, NodeStore, QueueStore,
    ScheduleStore,
};
pub use stores::Stores;
