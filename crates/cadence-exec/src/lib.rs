//! # cadence-exec
//!
//! Task lifecycle and dependency engine for the Cadence CI orchestrator.
//!
//! This crate implements the execution core, providing:
//!
//! - **Task Model**: the task entity, its status machine, and the pure
//!   predicates scheduling decisions are made from
//! - **Dependency Engine**: recursive graph walks, activation cascades,
//!   blockage propagation, and cycle detection
//! - **Lifecycle Controller**: every state transition as a guarded
//!   conditional update
//! - **Dispatch Supervisor**: heartbeat supervision, cooperative abort, and
//!   the unresponsive-task monitor
//! - **Query Planner**: schedulable-task selection for the external
//!   allocator
//! - **Archive/Reset**: execution archiving and restart
//!
//! ## Core Concepts
//!
//! - **Task**: one unit of execution bound to a commit, build variant, and
//!   display name; the only entity this crate owns
//! - **Activation**: the flag that permits scheduling, distinct from
//!   dispatch
//! - **Execution**: the per-identity counter advanced by every
//!   archive-and-reset cycle
//!
//! ## Guarantees
//!
//! - **Per-task linearizability**: two concurrent attempts at the same
//!   transition compete on a conditional update and exactly one wins
//! - **Eventual graph consistency**: dependency cascades are one
//!   multi-update plus reconciliation paths; no in-memory shared graph
//! - **No panics on business errors**: everything is surfaced as
//!   [`error::Error`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cadence_core::TaskId;
//! use cadence_exec::error::Result;
//! use cadence_exec::lifecycle::LifecycleController;
//! use cadence_exec::services::CoreServices;
//! use cadence_exec::store::memory::InMemoryTaskStore;
//!
//! # async fn demo() -> Result<()> {
//! let store = Arc::new(InMemoryTaskStore::new());
//! let controller = LifecycleController::new(store, CoreServices::without_events());
//!
//! // An agent heartbeat arrived for this task.
//! let result = controller
//!     .update_heartbeat(&TaskId::new("proj_bv_compile_abc"), chrono::Utc::now())
//!     .await?;
//! if result.is_zero_match() {
//!     // Unknown task; the caller re-reads and decides.
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;

pub mod archive;
pub mod dependency;
pub mod error;
pub mod events;
pub mod ingest;
pub mod lifecycle;
pub mod metrics;
pub mod planner;
pub mod services;
pub mod store;
pub mod supervisor;
pub mod task;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::archive::Archiver;
    pub use crate::dependency::DependencyEngine;
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventSink, InMemoryOutbox, TaskEvent, TaskEventKind};
    pub use crate::ingest::IngestService;
    pub use crate::lifecycle::{DurationSource, LifecycleController};
    pub use crate::planner::{DistroResolver, IdentityDistroResolver, QueryPlanner};
    pub use crate::services::{Clock, CoreServices, FixedClock, SystemClock};
    pub use crate::store::{
        IndexHint, TaskFilter, TaskQuery, TaskStore, TaskUpdate, TaskWrite, UpdateResult,
    };
    pub use crate::store::memory::InMemoryTaskStore;
    pub use crate::supervisor::{
        DispatchSupervisor, HeartbeatConfig, HeartbeatLoop, HeartbeatOutcome, HeartbeatTransport,
    };
    pub use crate::task::{
        Dependency, DependencyRequirement, DisplayStatus, EndDetail, ExecutionPlatform, Task,
        TaskStatus,
    };
}
