//! Task queue runtime: adaptive poller, hysteresis backpressure, the
//! worker pool and the SmartQueue submission frontend.

pub mod backpressure;
pub mod poller;
pub mod smart;
pub mod worker;

pub use backpressure::{BackpressureConfig, BackpressureState};
pub use poller::{PollerConfig, QueuePoller};
pub use smart::{SmartQueue, SmartQueueConfig};
pub use worker::{QueueWorkerPool, WorkerConfig, WorkerStats};
