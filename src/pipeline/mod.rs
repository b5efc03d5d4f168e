//! The resumable execution engine shared by every stage.
//!
//! # Components
//!
//! - **Planner**: input items minus items the checkpoint already resolves
//! - **Executor**: one item to one record, with pacing and rate-limit backoff
//! - **Runner**: load, plan, dispatch through a coordinator from
//!   [`crate::scheduler`], final save, summary
//!
//! # Run flow
//!
//! 1. The checkpoint at the output path is loaded (missing or corrupt files
//!    start empty)
//! 2. The planner drops items without an id, duplicate ids, and resolved ids
//! 3. Pending items go to the worker pool or to provider batch jobs
//! 4. Every record is upserted into the checkpoint store, which saves at
//!    the configured interval
//! 5. The checkpoint is saved once more, sorted by id, even if nothing ran
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use puzzle_forge::llm::AnthropicClient;
//! use puzzle_forge::pipeline::{EngineConfig, PipelineRunner};
//! use puzzle_forge::stages::{PromptTemplate, StageKind};
//!
//! let config = EngineConfig::from_env()?;
//! let template = PromptTemplate::from_file("prompts/verify.md".as_ref())?;
//! let stage = StageKind::Verify.build(template, None, &config)?;
//! let client = Arc::new(AnthropicClient::from_env()?);
//!
//! let summary = PipelineRunner::new(Arc::new(stage), config)
//!     .with_provider(client.clone())
//!     .with_batch_provider(client)
//!     .run("data/questions.json".as_ref(), "data/verify.json".as_ref(), None)
//!     .await?;
//! summary.log();
//! ```

pub mod config;
pub mod executor;
pub mod pacing;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod summary;

pub use config::{ConfigError, EngineConfig, ExecutionMode};
pub use executor::{classify_error, record_from_text, UnitExecutor};
pub use pacing::Pacer;
pub use planner::{plan, Plan};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use retry::{retry_with_backoff, RetryFailure, RetryPolicy};
pub use runner::{PipelineError, PipelineRunner};
pub use summary::RunSummary;
