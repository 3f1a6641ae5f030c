//! Task lifecycle events.
//!
//! Lifecycle operations emit events describing task state changes
//! (activation, dispatch, blockage, abort requests, restarts). Events are
//! best-effort: the core guarantees the transition happened, and sinks decide
//! when and how to persist or forward. A failed or slow sink never rolls back
//! a transition.
//!
//! Event IDs are [ULIDs](https://github.com/ulid/spec): lexicographically
//! sortable by creation time, so an append-only event log stays in
//! chronological order without a separate sequence field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use cadence_core::TaskId;

/// The kind of lifecycle change an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// The task was activated for scheduling.
    Activated,
    /// The task was deactivated.
    Deactivated,
    /// A dependency edge became unattainable and the task is newly blocked.
    Blocked,
    /// An abort was requested for a task in progress.
    AbortRequested,
    /// The task was dispatched to a host or pod.
    Dispatched,
    /// A host dispatch was rolled back.
    Undispatched,
    /// The agent reported the task started.
    Started,
    /// The task reached a terminal status.
    Finished,
    /// The task was archived and reset for a new execution.
    Restarted,
    /// A container was allocated for the task.
    ContainerAllocated,
    /// The task's dependencies were overridden by a user.
    DependenciesOverridden,
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Activated => write!(f, "activated"),
            Self::Deactivated => write!(f, "deactivated"),
            Self::Blocked => write!(f, "blocked"),
            Self::AbortRequested => write!(f, "abort_requested"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Undispatched => write!(f, "undispatched"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
            Self::Restarted => write!(f, "restarted"),
            Self::ContainerAllocated => write!(f, "container_allocated"),
            Self::DependenciesOverridden => write!(f, "dependencies_overridden"),
        }
    }
}

/// A single task lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Unique event identifier (ULID).
    pub id: String,
    /// The task this event describes.
    pub task_id: TaskId,
    /// The execution number the event applies to.
    pub execution: u32,
    /// What happened.
    pub kind: TaskEventKind,
    /// Who triggered the change (user ID or subsystem name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    /// Event timestamp.
    pub time: DateTime<Utc>,
}

impl TaskEvent {
    /// Creates a new event at the given time.
    #[must_use]
    pub fn new(task_id: TaskId, execution: u32, kind: TaskEventKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            task_id,
            execution,
            kind,
            caller: None,
            time: now,
        }
    }

    /// Attaches the caller that triggered the change.
    #[must_use]
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// A sink for task lifecycle events.
///
/// Sinks are shared across controllers, so recording takes `&self`;
/// implementations handle their own synchronization and their own failure
/// reporting. The core treats every push as fire-and-forget.
pub trait EventSink: Send + Sync {
    /// Records an event.
    fn log_task_event(&self, event: TaskEvent);
}

/// In-memory event sink for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    events: std::sync::Mutex<Vec<TaskEvent>>,
}

impl InMemoryOutbox {
    /// Creates a new empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drains the outbox, returning all events in insertion order.
    pub fn drain(&self) -> Vec<TaskEvent> {
        self.events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default()
    }
}

impl EventSink for InMemoryOutbox {
    fn log_task_event(&self, event: TaskEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// A sink that drops every event.
///
/// Useful for callers that do not care about event history.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn log_task_event(&self, _event: TaskEvent) {}
}
