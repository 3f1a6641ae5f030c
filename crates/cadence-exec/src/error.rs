//! Error types for the task execution domain.

use cadence_core::TaskId;

/// The result type used throughout cadence-exec.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in task execution operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was not found in the live collection.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A guarded update matched zero documents because the task's state no
    /// longer satisfies the precondition. Recoverable: re-read and decide.
    #[error("precondition failed for task {task_id}: {detail}")]
    PreconditionFailed {
        /// The task whose state changed underneath the caller.
        task_id: TaskId,
        /// The precondition that no longer holds.
        detail: String,
    },

    /// A transactional write batch aborted on a write-write conflict and
    /// exhausted its retries.
    #[error("write conflict persisted after {attempts} attempts")]
    Contention {
        /// How many times the batch was attempted.
        attempts: u32,
    },

    /// A cycle was detected in the dependency graph.
    #[error("cycle detected in dependency graph: {cycle:?}")]
    CycleDetected {
        /// The task IDs participating in the cycle.
        cycle: Vec<String>,
    },

    /// An operation would violate a task invariant. The state is left
    /// unchanged.
    #[error("invariant breach: {message}")]
    InvariantBreach {
        /// Description of the violated invariant.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from cadence-core.
    #[error("core error: {0}")]
    Core(#[from] cadence_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new invariant-breach error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantBreach {
            message: message.into(),
        }
    }
}
