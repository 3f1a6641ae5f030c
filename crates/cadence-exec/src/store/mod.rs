//! Pluggable storage for task state.
//!
//! The [`TaskStore`] trait defines the persistence layer for live tasks and
//! archived executions. Any transactional document or KV store with secondary
//! indices can implement it; the in-memory implementation in
//! [`memory`](crate::store::memory) backs tests and development.
//!
//! ## Design Principles
//!
//! - **Guarded updates**: every state transition is a conditional update
//!   whose [`TaskFilter`] restates the full precondition. A zero-match result
//!   is a contention signal, not an error; the caller re-reads and decides.
//! - **Array-filter updates**: flipping `finished`/`unattainable` on the
//!   matching element of every dependent's `depends_on` array is a
//!   first-class operation, because a read-modify-write loop would race with
//!   concurrent agents.
//! - **Bounded transactions**: the only multi-write scope is
//!   [`TaskStore::apply_batch`]; everything else tolerates partial progress
//!   plus reconciliation.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use cadence_core::{BuildId, DistroId, HostId, PodId, ProjectId, TaskId, VersionId};

use crate::error::Result;
use crate::task::{
    AbortInfo, Dependency, DisplayTaskLink, EndDetail, ExecutionPlatform, Task, TaskStatus,
};

/// Outcome of a conditional update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Documents the filter matched.
    pub matched: u64,
    /// Documents the update changed.
    pub modified: u64,
}

impl UpdateResult {
    /// Returns true if the filter matched nothing — the contention signal.
    #[must_use]
    pub const fn is_zero_match(&self) -> bool {
        self.matched == 0
    }
}

/// Secondary indexes the planner may force.
///
/// Implementations that plan queries themselves may ignore hints; they exist
/// because the schedulable-task sweeps degrade badly on the dependency-edge
/// index the default planner prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexHint {
    /// `(distro, status, activated, priority, override_dependencies,
    /// unattainable_dependency)`.
    ActivatedTasksByDistro,
    /// `(depends_on.task_id)`.
    DependsOnTaskId,
    /// `(display_task_id)`.
    DisplayTaskId,
}

/// Sort orders supported by [`TaskQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSort {
    /// Ascending by task ID.
    IdAsc,
    /// Ascending by task-group order.
    TaskGroupOrderAsc,
}

/// Conjunctive filter over task records.
///
/// Every populated condition must hold for a record to match. Transition
/// filters restate the *entire* precondition of the transition they guard;
/// this is the sole per-task concurrency-safety mechanism.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Exact ID match.
    pub id: Option<TaskId>,
    /// ID in set.
    pub ids: Option<Vec<TaskId>>,
    /// ID not equal (used to exclude the abort-triggering task).
    pub id_not: Option<TaskId>,
    /// Version match.
    pub version: Option<VersionId>,
    /// Build match.
    pub build_id: Option<BuildId>,
    /// Project match.
    pub project: Option<ProjectId>,
    /// Build-variant match.
    pub build_variant: Option<String>,
    /// Display-name match.
    pub display_name: Option<String>,
    /// Status in set.
    pub status_in: Option<Vec<TaskStatus>>,
    /// Activated flag match.
    pub activated: Option<bool>,
    /// Activated-by match.
    pub activated_by: Option<String>,
    /// Activated at or before this instant.
    pub activated_time_lte: Option<DateTime<Utc>>,
    /// Last heartbeat at or before this instant (unset never matches).
    pub last_heartbeat_lte: Option<DateTime<Utc>>,
    /// Priority strictly greater than.
    pub priority_gt: Option<i64>,
    /// Override flag match.
    pub override_dependencies: Option<bool>,
    /// Unattainable-dependency cache match.
    pub unattainable_dependency: Option<bool>,
    /// Execution-platform match (`Host` also matches legacy records with the
    /// field unset, which deserialize to the host default).
    pub execution_platform: Option<ExecutionPlatform>,
    /// Primary distro match.
    pub distro: Option<DistroId>,
    /// Primary *or* secondary distro match (the alias form).
    pub distro_or_secondary: Option<DistroId>,
    /// Container-allocated flag match.
    pub container_allocated: Option<bool>,
    /// Allocation attempts strictly less than.
    pub allocation_attempts_lt: Option<u32>,
    /// Pod assignment must be absent.
    pub pod_unset: Option<bool>,
    /// Has an edge pointing at this upstream task.
    pub depends_on_task: Option<TaskId>,
    /// Has an edge pointing at any of these upstream tasks.
    pub depends_on_task_in: Option<Vec<TaskId>>,
    /// Has at least one dependency edge.
    pub has_dependencies: Option<bool>,
    /// Every edge is finished and attainable, or dependencies are
    /// overridden (the container-scheduling readiness condition).
    pub dependencies_ready: Option<bool>,
    /// Can-reset flag match.
    pub can_reset: Option<bool>,
    /// Display-only flag match.
    pub display_only: Option<bool>,
    /// Task-group name match.
    pub task_group: Option<String>,
    /// Excludes members of single-host task groups.
    pub exclude_single_host_task_groups: bool,
    /// This task must not appear in `execution_tasks`.
    pub execution_task_not: Option<TaskId>,
    /// Generated-tasks idempotence flag match.
    pub generated_tasks: Option<bool>,
    /// Generated-JSON payload must be absent.
    pub generated_json_unset: Option<bool>,
    /// Scheduled time must be absent.
    pub scheduled_time_unset: Option<bool>,
}

impl TaskFilter {
    /// Filter matching one task by ID.
    #[must_use]
    pub fn by_id(id: TaskId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Filter matching a set of task IDs.
    #[must_use]
    pub fn by_ids(ids: Vec<TaskId>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    /// Returns true if `task` satisfies every populated condition.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(id) = &self.id {
            if &task.id != id {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&task.id) {
                return false;
            }
        }
        if let Some(id_not) = &self.id_not {
            if &task.id == id_not {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if &task.version != version {
                return false;
            }
        }
        if let Some(build_id) = &self.build_id {
            if &task.build_id != build_id {
                return false;
            }
        }
        if let Some(project) = &self.project {
            if &task.project != project {
                return false;
            }
        }
        if let Some(build_variant) = &self.build_variant {
            if &task.build_variant != build_variant {
                return false;
            }
        }
        if let Some(display_name) = &self.display_name {
            if &task.display_name != display_name {
                return false;
            }
        }
        if let Some(status_in) = &self.status_in {
            if !status_in.contains(&task.status) {
                return false;
            }
        }
        if let Some(activated) = self.activated {
            if task.activated != activated {
                return false;
            }
        }
        if let Some(activated_by) = &self.activated_by {
            if task.activated_by.as_deref() != Some(activated_by.as_str()) {
                return false;
            }
        }
        if let Some(lte) = self.activated_time_lte {
            if !task.activated_time.is_some_and(|t| t <= lte) {
                return false;
            }
        }
        if let Some(lte) = self.last_heartbeat_lte {
            if !task.last_heartbeat.is_some_and(|t| t <= lte) {
                return false;
            }
        }
        if let Some(gt) = self.priority_gt {
            if task.priority <= gt {
                return false;
            }
        }
        if let Some(flag) = self.override_dependencies {
            if task.override_dependencies != flag {
                return false;
            }
        }
        if let Some(flag) = self.unattainable_dependency {
            if task.unattainable_dependency != flag {
                return false;
            }
        }
        if let Some(platform) = self.execution_platform {
            if task.execution_platform != platform {
                return false;
            }
        }
        if let Some(distro) = &self.distro {
            if task.distro.as_ref() != Some(distro) {
                return false;
            }
        }
        if let Some(distro) = &self.distro_or_secondary {
            let primary = task.distro.as_ref() == Some(distro);
            let secondary = task.secondary_distros.contains(distro);
            if !primary && !secondary {
                return false;
            }
        }
        if let Some(flag) = self.container_allocated {
            if task.container_allocated != flag {
                return false;
            }
        }
        if let Some(lt) = self.allocation_attempts_lt {
            if task.container_allocation_attempts >= lt {
                return false;
            }
        }
        if self.pod_unset == Some(true) && task.pod_id.is_some() {
            return false;
        }
        if let Some(dep) = &self.depends_on_task {
            if !task.depends_on.iter().any(|d| &d.task_id == dep) {
                return false;
            }
        }
        if let Some(deps) = &self.depends_on_task_in {
            if !task.depends_on.iter().any(|d| deps.contains(&d.task_id)) {
                return false;
            }
        }
        if let Some(flag) = self.has_dependencies {
            if task.depends_on.is_empty() == flag {
                return false;
            }
        }
        if let Some(flag) = self.dependencies_ready {
            let ready = task.override_dependencies
                || task
                    .depends_on
                    .iter()
                    .all(|d| d.finished && !d.unattainable);
            if ready != flag {
                return false;
            }
        }
        if let Some(flag) = self.can_reset {
            if task.can_reset != flag {
                return false;
            }
        }
        if let Some(flag) = self.display_only {
            if task.display_only != flag {
                return false;
            }
        }
        if let Some(group) = &self.task_group {
            if task.task_group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if self.exclude_single_host_task_groups && task.is_part_of_single_host_task_group() {
            return false;
        }
        if let Some(excluded) = &self.execution_task_not {
            if task.execution_tasks.contains(excluded) {
                return false;
            }
        }
        if let Some(flag) = self.generated_tasks {
            if task.generated_tasks != flag {
                return false;
            }
        }
        if self.generated_json_unset == Some(true) && !task.generated_json.is_empty() {
            return false;
        }
        if self.scheduled_time_unset == Some(true) && task.scheduled_time.is_some() {
            return false;
        }
        true
    }
}

/// A filter plus execution options.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// The match conditions.
    pub filter: TaskFilter,
    /// Result ordering.
    pub sort: Option<TaskSort>,
    /// Maximum results.
    pub limit: Option<usize>,
    /// Forced index.
    pub hint: Option<IndexHint>,
}

impl TaskQuery {
    /// Query wrapping a bare filter.
    #[must_use]
    pub fn filtered(filter: TaskFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// Mutations a conditional update may apply.
///
/// The flat set/clear fields render `$set`/`$unset` document updates; the
/// named operations at the bottom render the two aggregation-pipeline updates
/// the archive and reset paths need, because they read other fields of the
/// same document.
#[derive(Debug, Clone, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct TaskUpdate {
    /// Set the persisted status.
    pub set_status: Option<TaskStatus>,
    /// Set the activation flag.
    pub set_activated: Option<bool>,
    /// Set who changed activation last.
    pub set_activated_by: Option<String>,
    /// Set the activation time.
    pub set_activated_time: Option<DateTime<Utc>>,
    /// Set the deactivated-for-dependency marker.
    pub set_deactivated_for_dependency: Option<bool>,
    /// Set the scheduled time.
    pub set_scheduled_time: Option<DateTime<Utc>>,
    /// Clear the scheduled time.
    pub clear_scheduled_time: bool,
    /// Set the per-execution secret.
    pub set_secret: Option<String>,
    /// Set the priority.
    pub set_priority: Option<i64>,
    /// Set the stepback depth.
    pub set_stepback_depth: Option<u32>,
    /// Set the dispatched host.
    pub set_host_id: Option<HostId>,
    /// Clear the dispatched host.
    pub clear_host_id: bool,
    /// Set the dispatched pod.
    pub set_pod_id: Option<PodId>,
    /// Clear the dispatched pod.
    pub clear_pod_id: bool,
    /// Set the primary distro.
    pub set_distro: Option<DistroId>,
    /// Set the agent version.
    pub set_agent_version: Option<String>,
    /// Clear the agent version.
    pub clear_agent_version: bool,
    /// Set the dispatch time.
    pub set_dispatch_time: Option<DateTime<Utc>>,
    /// Clear the dispatch time.
    pub clear_dispatch_time: bool,
    /// Set the last heartbeat.
    pub set_last_heartbeat: Option<DateTime<Utc>>,
    /// Clear the last heartbeat.
    pub clear_last_heartbeat: bool,
    /// Set the start time.
    pub set_start_time: Option<DateTime<Utc>>,
    /// Clear the start time.
    pub clear_start_time: bool,
    /// Set the finish time.
    pub set_finish_time: Option<DateTime<Utc>>,
    /// Clear the finish time.
    pub clear_finish_time: bool,
    /// Clear the dependencies-met time.
    pub clear_dependencies_met_time: bool,
    /// Set the recorded duration.
    pub set_time_taken: Option<Duration>,
    /// Set the expected duration.
    pub set_expected_duration: Option<Duration>,
    /// Set the expected-duration standard deviation.
    pub set_expected_duration_std_dev: Option<Duration>,
    /// Set the TTL-cached duration prediction.
    pub set_duration_prediction: Option<crate::task::DurationPrediction>,
    /// Set the end details.
    pub set_details: Option<EndDetail>,
    /// Clear the end details.
    pub clear_details: bool,
    /// Set the abort flag.
    pub set_aborted: Option<bool>,
    /// Set the abort context.
    pub set_abort_info: Option<AbortInfo>,
    /// Clear the abort context.
    pub clear_abort_info: bool,
    /// Set the container-allocated flag.
    pub set_container_allocated: Option<bool>,
    /// Set the container allocation time.
    pub set_container_allocated_time: Option<DateTime<Utc>>,
    /// Clear the container allocation time.
    pub clear_container_allocated_time: bool,
    /// Increment the allocation-attempt counter by one.
    pub inc_container_allocation_attempts: bool,
    /// Set the allocation-attempt counter.
    pub set_container_allocation_attempts: Option<u32>,
    /// Set the can-reset flag.
    pub set_can_reset: Option<bool>,
    /// Set the reset-when-finished flag.
    pub set_reset_when_finished: Option<bool>,
    /// Set the reset-failed-when-finished flag.
    pub set_reset_failed_when_finished: Option<bool>,
    /// Set the dependency-override flag.
    pub set_override_dependencies: Option<bool>,
    /// Set the results service.
    pub set_results_service: Option<String>,
    /// Clear the results service.
    pub clear_results_service: bool,
    /// Set the results-failed flag.
    pub set_results_failed: Option<bool>,
    /// Set the generated-tasks idempotence flag.
    pub set_generated_tasks: Option<bool>,
    /// Set the generated-JSON payload.
    pub set_generated_json: Option<Vec<serde_json::Value>>,
    /// Add a task name to activate under a variant (set semantics).
    pub add_generated_task_to_activate: Option<(String, String)>,
    /// Set the display-task link.
    pub set_display_task_link: Option<DisplayTaskLink>,
    /// Append execution tasks to a display task (set semantics).
    pub push_execution_tasks: Option<Vec<TaskId>>,
    /// Append a dependency edge.
    pub push_dependency: Option<Dependency>,
    /// Replace the whole `depends_on` array (edge removal rewrites it).
    pub set_depends_on: Option<Vec<Dependency>>,
    /// Increment `execution` by one (the archive advance).
    pub inc_execution: bool,
    /// Increment `latest_parent_execution` by one.
    pub inc_latest_parent_execution: bool,
    /// Set `execution` from the document's own `latest_parent_execution`.
    pub set_execution_to_latest_parent: bool,
    /// Recompute `unattainable_dependency` from the document's own edges.
    pub recompute_unattainable_dependency: bool,
}

impl TaskUpdate {
    /// Applies the mutations to a record in place.
    #[allow(clippy::too_many_lines)]
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.set_status {
            task.status = status;
        }
        if let Some(activated) = self.set_activated {
            task.activated = activated;
        }
        if let Some(by) = &self.set_activated_by {
            task.activated_by = Some(by.clone());
        }
        if let Some(at) = self.set_activated_time {
            task.activated_time = Some(at);
        }
        if let Some(flag) = self.set_deactivated_for_dependency {
            task.deactivated_for_dependency = flag;
        }
        if let Some(at) = self.set_scheduled_time {
            task.scheduled_time = Some(at);
        }
        if self.clear_scheduled_time {
            task.scheduled_time = None;
        }
        if let Some(secret) = &self.set_secret {
            task.secret = secret.clone();
        }
        if let Some(priority) = self.set_priority {
            task.priority = priority;
        }
        if let Some(depth) = self.set_stepback_depth {
            task.stepback_depth = depth;
        }
        if let Some(host) = &self.set_host_id {
            task.host_id = Some(host.clone());
        }
        if self.clear_host_id {
            task.host_id = None;
        }
        if let Some(pod) = &self.set_pod_id {
            task.pod_id = Some(pod.clone());
        }
        if self.clear_pod_id {
            task.pod_id = None;
        }
        if let Some(distro) = &self.set_distro {
            task.distro = Some(distro.clone());
        }
        if let Some(agent) = &self.set_agent_version {
            task.agent_version = Some(agent.clone());
        }
        if self.clear_agent_version {
            task.agent_version = None;
        }
        if let Some(at) = self.set_dispatch_time {
            task.dispatch_time = Some(at);
        }
        if self.clear_dispatch_time {
            task.dispatch_time = None;
        }
        if let Some(at) = self.set_last_heartbeat {
            task.last_heartbeat = Some(at);
        }
        if self.clear_last_heartbeat {
            task.last_heartbeat = None;
        }
        if let Some(at) = self.set_start_time {
            task.start_time = Some(at);
        }
        if self.clear_start_time {
            task.start_time = None;
        }
        if let Some(at) = self.set_finish_time {
            task.finish_time = Some(at);
        }
        if self.clear_finish_time {
            task.finish_time = None;
        }
        if self.clear_dependencies_met_time {
            task.dependencies_met_time = None;
        }
        if let Some(taken) = self.set_time_taken {
            task.time_taken = taken;
        }
        if let Some(expected) = self.set_expected_duration {
            task.expected_duration = expected;
        }
        if let Some(std_dev) = self.set_expected_duration_std_dev {
            task.expected_duration_std_dev = std_dev;
        }
        if let Some(prediction) = &self.set_duration_prediction {
            task.duration_prediction = Some(prediction.clone());
        }
        if let Some(details) = &self.set_details {
            task.details = Some(details.clone());
        }
        if self.clear_details {
            task.details = None;
        }
        if let Some(aborted) = self.set_aborted {
            task.aborted = aborted;
        }
        if let Some(info) = &self.set_abort_info {
            task.abort_info = Some(info.clone());
        }
        if self.clear_abort_info {
            task.abort_info = None;
        }
        if let Some(flag) = self.set_container_allocated {
            task.container_allocated = flag;
        }
        if let Some(at) = self.set_container_allocated_time {
            task.container_allocated_time = Some(at);
        }
        if self.clear_container_allocated_time {
            task.container_allocated_time = None;
        }
        if self.inc_container_allocation_attempts {
            task.container_allocation_attempts += 1;
        }
        if let Some(attempts) = self.set_container_allocation_attempts {
            task.container_allocation_attempts = attempts;
        }
        if let Some(flag) = self.set_can_reset {
            task.can_reset = flag;
        }
        if let Some(flag) = self.set_reset_when_finished {
            task.reset_when_finished = flag;
        }
        if let Some(flag) = self.set_reset_failed_when_finished {
            task.reset_failed_when_finished = flag;
        }
        if let Some(flag) = self.set_override_dependencies {
            task.override_dependencies = flag;
        }
        if let Some(service) = &self.set_results_service {
            task.results_service = Some(service.clone());
        }
        if self.clear_results_service {
            task.results_service = None;
        }
        if let Some(flag) = self.set_results_failed {
            task.results_failed = flag;
        }
        if let Some(flag) = self.set_generated_tasks {
            task.generated_tasks = flag;
        }
        if let Some(json) = &self.set_generated_json {
            task.generated_json = json.clone();
        }
        if let Some((variant, name)) = &self.add_generated_task_to_activate {
            let names = task
                .generated_tasks_to_activate
                .entry(variant.clone())
                .or_default();
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        if let Some(link) = &self.set_display_task_link {
            task.display_task_link = link.clone();
        }
        if let Some(exec_tasks) = &self.push_execution_tasks {
            for id in exec_tasks {
                if !task.execution_tasks.contains(id) {
                    task.execution_tasks.push(id.clone());
                }
            }
        }
        if let Some(dep) = &self.push_dependency {
            task.depends_on.push(dep.clone());
        }
        if let Some(depends_on) = &self.set_depends_on {
            task.depends_on = depends_on.clone();
        }
        if self.inc_execution {
            task.execution += 1;
        }
        if self.inc_latest_parent_execution {
            task.latest_parent_execution += 1;
        }
        if self.set_execution_to_latest_parent {
            task.execution = task.latest_parent_execution;
        }
        if self.recompute_unattainable_dependency {
            task.recompute_unattainable_dependency();
        }
    }
}

/// One write in an atomic batch.
#[derive(Debug, Clone)]
pub enum TaskWrite {
    /// Insert archived executions (idempotent on duplicate archive IDs).
    InsertOldTasks(Vec<Task>),
    /// Conditional multi-document update.
    UpdateMany {
        /// The precondition.
        filter: TaskFilter,
        /// The mutations.
        update: TaskUpdate,
    },
    /// Conditional single-document update.
    UpdateOne {
        /// The precondition.
        filter: TaskFilter,
        /// The mutations.
        update: TaskUpdate,
    },
}

/// Storage abstraction for task state.
///
/// Implementations must provide:
/// - Guarded conditional updates (the universal concurrency primitive)
/// - Array-filter updates on dependency edges
/// - An atomic multi-write batch for archive/reset
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// scheduler, agent RPC handlers, and monitor loops. Any process may perform
/// any transition; conditional updates arbitrate the races.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Gets a live task by ID. Returns `None` if absent.
    async fn get(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Gets the live tasks for a set of IDs. Missing IDs are skipped.
    async fn batch_get(&self, ids: &[TaskId]) -> Result<Vec<Task>>;

    /// Runs a query against the live collection.
    async fn find(&self, query: &TaskQuery) -> Result<Vec<Task>>;

    /// Inserts new live tasks.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate live ID.
    async fn insert_many(&self, tasks: Vec<Task>) -> Result<()>;

    /// Applies `update` to the first task matching `filter`.
    async fn update_one(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<UpdateResult>;

    /// Applies `update` to every task matching `filter`.
    async fn update_many(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<UpdateResult>;

    /// Array-filter update: sets `finished` on the matching element of every
    /// live task with an edge pointing at `dependency_id`.
    async fn set_dependency_finished(
        &self,
        dependency_id: &TaskId,
        finished: bool,
    ) -> Result<UpdateResult>;

    /// Array-filter update: sets `unattainable` on the element pointing at
    /// `dependency_id` in each of the named dependents' `depends_on` arrays,
    /// and recomputes each task's `unattainable_dependency` cache.
    ///
    /// Scoped to explicit dependents because edges with an `any` requirement
    /// stay attainable when the same upstream fails; callers decide which
    /// dependents qualify.
    async fn set_dependency_unattainable(
        &self,
        task_ids: &[TaskId],
        dependency_id: &TaskId,
        unattainable: bool,
    ) -> Result<UpdateResult>;

    /// Applies a batch of writes atomically: all writes commit or none do.
    async fn apply_batch(&self, writes: Vec<TaskWrite>) -> Result<()>;

    /// Inserts archived executions (idempotent on duplicate archive IDs).
    async fn insert_old_tasks(&self, tasks: Vec<Task>) -> Result<()>;

    /// Gets an archived execution by its archive ID.
    async fn get_old(&self, id: &TaskId) -> Result<Option<Task>>;
}
