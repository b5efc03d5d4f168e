//! Concurrency coordinators.
//!
//! Two interchangeable ways to drive pending items to result records:
//!
//! - **WorkerPool**: a fixed number of workers, one remote call per item,
//!   results stored in completion order
//! - **BatchCoordinator**: items grouped into provider batch jobs that are
//!   submitted and polled chunk by chunk
//!
//! ```text
//!                 ┌──────────────┐
//!                 │   Planner    │
//!                 └──────┬───────┘
//!                        │ pending items
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//!   ┌─────────────┐            ┌──────────────────┐
//!   │ WorkerPool  │            │ BatchCoordinator │
//!   └──────┬──────┘            └────────┬─────────┘
//!          │ upsert                     │ insert_many + flush
//!          └─────────────┬──────────────┘
//!                        ▼
//!                ┌─────────────────┐
//!                │ CheckpointStore │
//!                └─────────────────┘
//! ```

pub mod batch;
pub mod worker_pool;

pub use batch::{BatchConfig, BatchCoordinator, BatchJob, BatchJobState, BatchRunStats};
pub use worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};
