//! The lifecycle controller: every single-task state transition.
//!
//! Each operation is one conditional update whose filter restates the full
//! precondition of the transition it performs. A zero-match result means the
//! record changed underneath the caller; it is returned as an
//! [`UpdateResult`] for the caller to re-read and decide, not raised as an
//! error, except where a caller-visible error is part of the contract
//! (container allocation limits, results-service conflicts).
//!
//! Any process may perform any transition. The conditional update is the only
//! per-task synchronization; no locks are held across store calls.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;

use cadence_core::{BuildId, DistroId, HostId, PodId, ProjectId, TaskId, VersionId};

use crate::dependency::DependencyEngine;
use crate::error::{Error, Result};
use crate::events::{TaskEvent, TaskEventKind};
use crate::metrics::{labels, names};
use crate::services::CoreServices;
use crate::store::{TaskFilter, TaskQuery, TaskStore, TaskUpdate, UpdateResult};
use crate::task::{
    AbortInfo, DurationPrediction, EndDetail, ExecutionPlatform, Task, TaskStatus,
    DISABLED_PRIORITY, MAX_ALLOC_ATTEMPTS,
};

/// `activated_by` marker for tasks activated by the stepback bisector.
pub const STEPBACK_ACTIVATOR: &str = "stepback";

/// Backfill window for end reports that never saw a start report.
const MISSING_START_BACKFILL: chrono::Duration = chrono::Duration::hours(2);

/// Historical-duration collaborator used to refresh prediction caches.
///
/// Supplied by an external analytics service; the core only stores the
/// numeric outcome.
pub trait DurationSource: Send + Sync {
    /// Returns `(average, std_dev)` over recent executions of the named
    /// task, or `None` when there is no history.
    fn historical_duration(
        &self,
        project: &ProjectId,
        build_variant: &str,
        display_name: &str,
    ) -> Option<(Duration, Duration)>;
}

/// Single-task state transitions over the store.
pub struct LifecycleController {
    store: Arc<dyn TaskStore>,
    services: CoreServices,
    engine: DependencyEngine,
}

impl LifecycleController {
    /// Creates a controller over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, services: CoreServices) -> Self {
        let engine = DependencyEngine::new(store.clone(), services.clone());
        Self {
            store,
            services,
            engine,
        }
    }

    /// The dependency engine sharing this controller's store and services.
    #[must_use]
    pub fn engine(&self) -> &DependencyEngine {
        &self.engine
    }

    fn record_transition(&self, op: &'static str, result: UpdateResult) -> UpdateResult {
        if result.is_zero_match() {
            counter!(names::TRANSITION_CONFLICTS_TOTAL, labels::OP => op).increment(1);
        } else {
            counter!(names::TRANSITIONS_TOTAL, labels::OP => op).increment(1);
        }
        result
    }

    // --- Activation ---

    /// Activates tasks for scheduling. Display tasks bring their execution
    /// tasks along. With `update_dependencies`, downstream tasks that were
    /// deactivated for a dependency are re-activated in topological order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable or the downstream graph
    /// has a cycle.
    #[tracing::instrument(skip(self, tasks), fields(task_count = tasks.len(), caller))]
    pub async fn activate_tasks(
        &self,
        tasks: &[Task],
        caller: &str,
        update_dependencies: bool,
    ) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<TaskId> = Vec::new();
        for task in tasks {
            if task.display_only {
                ids.extend(task.execution_tasks.iter().cloned());
            }
            ids.push(task.id.clone());
        }

        let now = self.services.now();
        self.store
            .update_many(
                &TaskFilter::by_ids(ids.clone()),
                &TaskUpdate {
                    set_activated: Some(true),
                    set_activated_by: Some(caller.to_owned()),
                    set_activated_time: Some(now),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        for task in tasks {
            self.services.log_task_event(
                TaskEvent::new(task.id.clone(), task.execution, TaskEventKind::Activated, now)
                    .with_caller(caller),
            );
        }

        if update_dependencies {
            self.engine
                .activate_deactivated_dependencies(&ids, caller)
                .await?;
        }
        Ok(())
    }

    /// Activates tasks by ID together with every upstream task they
    /// transitively depend on.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn activate_tasks_with_dependencies(
        &self,
        ids: &[TaskId],
        caller: &str,
    ) -> Result<()> {
        let tasks = self.store.batch_get(ids).await?;
        let mut cache = std::collections::HashMap::new();
        let ancestors = self
            .engine
            .get_recursive_dependencies_up(&tasks, &mut cache)
            .await?;

        let mut to_activate = tasks;
        to_activate.extend(ancestors.into_iter().filter(|t| !t.activated));
        self.activate_tasks(&to_activate, caller, true).await
    }

    /// Deactivates tasks. Display tasks bring their execution tasks along.
    /// With `update_dependencies`, activated downstream tasks are
    /// deactivated too and marked for later cascade re-activation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, tasks), fields(task_count = tasks.len(), caller))]
    pub async fn deactivate_tasks(
        &self,
        tasks: &[Task],
        caller: &str,
        update_dependencies: bool,
    ) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<TaskId> = Vec::new();
        for task in tasks {
            if task.display_only {
                ids.extend(task.execution_tasks.iter().cloned());
            }
            ids.push(task.id.clone());
        }

        self.store
            .update_many(
                &TaskFilter::by_ids(ids.clone()),
                &TaskUpdate {
                    set_activated: Some(false),
                    set_activated_by: Some(caller.to_owned()),
                    clear_scheduled_time: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;

        let now = self.services.now();
        for task in tasks {
            self.services.log_task_event(
                TaskEvent::new(task.id.clone(), task.execution, TaskEventKind::Deactivated, now)
                    .with_caller(caller),
            );
        }

        if update_dependencies {
            self.engine.deactivate_dependencies(&ids, caller).await?;
        }
        Ok(())
    }

    /// Deactivates and aborts the activated stepback task with the given
    /// name, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if no activated stepback task matches.
    pub async fn deactivate_stepback_task(
        &self,
        project: &ProjectId,
        build_variant: &str,
        display_name: &str,
        caller: &str,
    ) -> Result<()> {
        let found = self
            .store
            .find(&TaskQuery {
                filter: TaskFilter {
                    project: Some(project.clone()),
                    build_variant: Some(build_variant.to_owned()),
                    display_name: Some(display_name.to_owned()),
                    activated: Some(true),
                    activated_by: Some(STEPBACK_ACTIVATOR.to_owned()),
                    ..TaskFilter::default()
                },
                limit: Some(1),
                ..TaskQuery::default()
            })
            .await?;
        let Some(task) = found.into_iter().next() else {
            return Err(Error::TaskNotFound {
                task_id: TaskId::new(format!("{build_variant}/{display_name}")),
            });
        };

        self.deactivate_tasks(std::slice::from_ref(&task), caller, false)
            .await?;
        if task.is_abortable() {
            self.set_aborted(&task, AbortInfo::by_user(caller)).await?;
        }
        Ok(())
    }

    // --- Dispatch ---

    /// Transitions an undispatched, activated host task to dispatched,
    /// recording its placement. Zero matches means another process got there
    /// first (or the task is no longer dispatchable).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, host_id = %host_id))]
    pub async fn mark_as_host_dispatched(
        &self,
        task: &Task,
        host_id: &HostId,
        distro_id: &DistroId,
        agent_version: &str,
        dispatch_time: DateTime<Utc>,
    ) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    status_in: Some(vec![TaskStatus::Undispatched]),
                    activated: Some(true),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_status: Some(TaskStatus::Dispatched),
                    set_host_id: Some(host_id.clone()),
                    set_distro: Some(distro_id.clone()),
                    set_agent_version: Some(agent_version.to_owned()),
                    set_dispatch_time: Some(dispatch_time),
                    set_last_heartbeat: Some(dispatch_time),
                    set_aborted: Some(false),
                    clear_abort_info: true,
                    clear_details: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;

        if !result.is_zero_match() {
            self.services.log_task_event(TaskEvent::new(
                task.id.clone(),
                task.execution,
                TaskEventKind::Dispatched,
                dispatch_time,
            ));
        }
        Ok(self.record_transition("host_dispatch", result))
    }

    /// Rolls a dispatched host task back to undispatched, clearing its
    /// placement. The inverse of [`LifecycleController::mark_as_host_dispatched`]
    /// up to time fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn mark_as_host_undispatched(&self, task: &Task) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    status_in: Some(vec![TaskStatus::Dispatched]),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_status: Some(TaskStatus::Undispatched),
                    clear_host_id: true,
                    clear_agent_version: true,
                    clear_dispatch_time: true,
                    clear_last_heartbeat: true,
                    set_aborted: Some(false),
                    clear_abort_info: true,
                    clear_details: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;

        if !result.is_zero_match() {
            self.services.log_task_event(TaskEvent::new(
                task.id.clone(),
                task.execution,
                TaskEventKind::Undispatched,
                self.services.now(),
            ));
        }
        Ok(self.record_transition("host_undispatch", result))
    }

    /// Allocates a container to a task, incrementing the bounded attempt
    /// counter. The filter restates the whole needs-allocation condition, so
    /// concurrent allocators cannot double-allocate or overrun the bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantBreach`] if the task is already allocated or
    /// out of attempts, and [`Error::PreconditionFailed`] if the guarded
    /// update matched nothing.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, attempts = task.container_allocation_attempts))]
    pub async fn mark_as_container_allocated(&self, task: &Task) -> Result<()> {
        if task.container_allocated {
            return Err(Error::invariant(
                "cannot allocate a container task that is currently allocated",
            ));
        }
        if task.remaining_container_allocation_attempts() == 0 {
            return Err(Error::invariant(format!(
                "task execution has hit the max allowed allocation attempts ({MAX_ALLOC_ATTEMPTS})"
            )));
        }

        let now = self.services.now();
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    execution_platform: Some(ExecutionPlatform::Container),
                    status_in: Some(vec![TaskStatus::Undispatched]),
                    activated: Some(true),
                    priority_gt: Some(DISABLED_PRIORITY),
                    container_allocated: Some(false),
                    allocation_attempts_lt: Some(MAX_ALLOC_ATTEMPTS),
                    dependencies_ready: Some(true),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_container_allocated: Some(true),
                    set_container_allocated_time: Some(now),
                    inc_container_allocation_attempts: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;
        if result.is_zero_match() {
            return Err(Error::PreconditionFailed {
                task_id: task.id.clone(),
                detail: "task is not ready for container allocation".into(),
            });
        }

        self.services.log_task_event(TaskEvent::new(
            task.id.clone(),
            task.execution,
            TaskEventKind::ContainerAllocated,
            now,
        ));
        self.record_transition("container_allocate", result);
        Ok(())
    }

    /// Marks an allocated container task as no longer allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantBreach`] if the task has no allocation, and
    /// [`Error::PreconditionFailed`] on a zero-match update.
    pub async fn mark_as_container_deallocated(&self, task: &Task) -> Result<()> {
        if !task.container_allocated {
            return Err(Error::invariant(
                "cannot deallocate a container task that is not currently allocated",
            ));
        }
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    execution_platform: Some(ExecutionPlatform::Container),
                    container_allocated: Some(true),
                    ..TaskFilter::default()
                },
                &container_deallocated_update(),
            )
            .await?;
        if result.is_zero_match() {
            return Err(Error::PreconditionFailed {
                task_id: task.id.clone(),
                detail: "task was not allocated".into(),
            });
        }
        self.record_transition("container_deallocate", result);
        Ok(())
    }

    /// Bulk form of container deallocation, used when pods are reaped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_tasks_as_container_deallocated(
        &self,
        task_ids: &[TaskId],
    ) -> Result<UpdateResult> {
        if task_ids.is_empty() {
            return Ok(UpdateResult::default());
        }
        let result = self
            .store
            .update_many(
                &TaskFilter {
                    ids: Some(task_ids.to_vec()),
                    execution_platform: Some(ExecutionPlatform::Container),
                    ..TaskFilter::default()
                },
                &container_deallocated_update(),
            )
            .await?;
        Ok(result)
    }

    /// Transitions an allocated container task to dispatched on a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, pod_id = %pod_id))]
    pub async fn mark_as_container_dispatched(
        &self,
        task: &Task,
        pod_id: &PodId,
        agent_version: &str,
    ) -> Result<UpdateResult> {
        let now = self.services.now();
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    status_in: Some(vec![TaskStatus::Undispatched]),
                    container_allocated: Some(true),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_status: Some(TaskStatus::Dispatched),
                    set_pod_id: Some(pod_id.clone()),
                    set_agent_version: Some(agent_version.to_owned()),
                    set_dispatch_time: Some(now),
                    set_last_heartbeat: Some(now),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        if !result.is_zero_match() {
            self.services.log_task_event(TaskEvent::new(
                task.id.clone(),
                task.execution,
                TaskEventKind::Dispatched,
                now,
            ));
        }
        Ok(self.record_transition("container_dispatch", result))
    }

    // --- Agent reports ---

    /// Records the agent's start report: dispatched to started.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn mark_start(
        &self,
        task: &Task,
        start_time: DateTime<Utc>,
    ) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    status_in: Some(vec![TaskStatus::Dispatched]),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_status: Some(TaskStatus::Started),
                    set_start_time: Some(start_time),
                    set_last_heartbeat: Some(start_time),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        if !result.is_zero_match() {
            self.services.log_task_event(TaskEvent::new(
                task.id.clone(),
                task.execution,
                TaskEventKind::Started,
                start_time,
            ));
        }
        Ok(self.record_transition("mark_start", result))
    }

    /// Refreshes the agent heartbeat timestamp. Deliberately unguarded: a
    /// heartbeat that lands after the end report refreshes a now-irrelevant
    /// field and transitions nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn update_heartbeat(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    set_last_heartbeat: Some(now),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Records the agent's end report and cascades dependency state.
    ///
    /// The protocol:
    /// 1. A missing start time is backfilled as `finish - 2h`, clamped to
    ///    the ingest time.
    /// 2. A missing or non-terminal detail defaults to a plain failure.
    /// 3. One guarded update persists status, times, details, and releases
    ///    any container allocation.
    /// 4. The `finished` flag is set on the matching edge of every dependent
    ///    via one array-filter update.
    /// 5. Dependents whose requirement can no longer be met are marked
    ///    unattainable, recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, task, detail), fields(task_id = %task.id, execution = task.execution))]
    pub async fn mark_end(
        &self,
        task: &Task,
        finish_time: DateTime<Utc>,
        detail: Option<EndDetail>,
    ) -> Result<UpdateResult> {
        let detail = match detail {
            Some(d) if d.status.is_terminal() => d,
            Some(_) | None => {
                tracing::debug!(task_id = %task.id, "end detail missing or non-terminal, defaulting to failed");
                EndDetail::failure()
            }
        };

        let start_time = task.start_time.unwrap_or_else(|| {
            let backfilled = finish_time - MISSING_START_BACKFILL;
            match task.ingest_time {
                Some(ingest) if backfilled < ingest => ingest,
                _ => backfilled,
            }
        });
        let time_taken = (finish_time - start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    status_in: Some(vec![TaskStatus::Dispatched, TaskStatus::Started]),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_status: Some(detail.status),
                    set_finish_time: Some(finish_time),
                    set_start_time: Some(start_time),
                    set_time_taken: Some(time_taken),
                    set_details: Some(detail.clone()),
                    set_container_allocated: Some(false),
                    clear_container_allocated_time: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;
        if result.is_zero_match() {
            return Ok(self.record_transition("mark_end", result));
        }

        self.services.log_task_event(TaskEvent::new(
            task.id.clone(),
            task.execution,
            TaskEventKind::Finished,
            finish_time,
        ));

        // Display tasks cannot be depended on, so their end cascades nothing.
        if !task.display_only {
            self.store.set_dependency_finished(&task.id, true).await?;
            if let Some(finished) = self.store.get(&task.id).await? {
                self.engine.update_blocked_dependencies(&finished).await?;
            }
        }

        Ok(self.record_transition("mark_end", result))
    }

    /// Marks a task failed without an agent report.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_failed(&self, task: &Task) -> Result<UpdateResult> {
        self.mark_end(task, self.services.now(), Some(EndDetail::failure()))
            .await
    }

    /// Marks a task system-failed with the given description.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_system_failed(
        &self,
        task: &Task,
        description: impl Into<String>,
    ) -> Result<UpdateResult> {
        self.mark_end(
            task,
            self.services.now(),
            Some(EndDetail::system_failure(description)),
        )
        .await
    }

    /// Marks a task undispatched without touching placement. Used when a
    /// dispatch decision is withdrawn before any agent involvement.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_unscheduled(&self, task_id: &TaskId) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    set_status: Some(TaskStatus::Undispatched),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    // --- Abort ---

    /// Requests a cooperative abort of an in-progress task. Not a state
    /// change: the agent observes the flag through its next heartbeat
    /// response and reports end-of-task itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_aborted(&self, task: &Task, reason: AbortInfo) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task.id.clone()),
                    status_in: Some(vec![TaskStatus::Dispatched, TaskStatus::Started]),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_aborted: Some(true),
                    set_abort_info: Some(reason.clone()),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        if !result.is_zero_match() {
            let mut event = TaskEvent::new(
                task.id.clone(),
                task.execution,
                TaskEventKind::AbortRequested,
                self.services.now(),
            );
            if let Some(user) = &reason.user {
                event = event.with_caller(user.clone());
            }
            self.services.log_task_event(event);
        }
        Ok(result)
    }

    /// Bulk abort by ID, restricted to tasks still in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_many_aborted(
        &self,
        task_ids: &[TaskId],
        reason: AbortInfo,
    ) -> Result<UpdateResult> {
        if task_ids.is_empty() {
            return Ok(UpdateResult::default());
        }
        let result = self
            .store
            .update_many(
                &TaskFilter {
                    ids: Some(task_ids.to_vec()),
                    status_in: Some(vec![TaskStatus::Dispatched, TaskStatus::Started]),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_aborted: Some(true),
                    set_abort_info: Some(reason),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Aborts every in-progress task in a build. The task that triggered the
    /// abort (named in `reason`) is excluded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn abort_build_tasks(&self, build_id: &BuildId, reason: AbortInfo) -> Result<()> {
        let filter = TaskFilter {
            build_id: Some(build_id.clone()),
            status_in: Some(vec![TaskStatus::Dispatched, TaskStatus::Started]),
            id_not: reason.task_id.clone(),
            ..TaskFilter::default()
        };
        self.abort_tasks_by_filter(filter, reason).await
    }

    /// Aborts every in-progress task in a version. The triggering task and
    /// its display-task parent are excluded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn abort_version_tasks(&self, version: &VersionId, reason: AbortInfo) -> Result<()> {
        let filter = TaskFilter {
            version: Some(version.clone()),
            status_in: Some(vec![TaskStatus::Dispatched, TaskStatus::Started]),
            id_not: reason.task_id.clone(),
            execution_task_not: reason.task_id.clone(),
            ..TaskFilter::default()
        };
        self.abort_tasks_by_filter(filter, reason).await
    }

    async fn abort_tasks_by_filter(&self, filter: TaskFilter, reason: AbortInfo) -> Result<()> {
        let tasks = self.store.find(&TaskQuery::filtered(filter)).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        self.store
            .update_many(
                &TaskFilter {
                    ids: Some(ids),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_aborted: Some(true),
                    set_abort_info: Some(reason.clone()),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        let now = self.services.now();
        for task in &tasks {
            let mut event =
                TaskEvent::new(task.id.clone(), task.execution, TaskEventKind::AbortRequested, now);
            if let Some(user) = &reason.user {
                event = event.with_caller(user.clone());
            }
            self.services.log_task_event(event);
        }
        Ok(())
    }

    // --- Metadata ---

    /// Records which results service the agent attached test results to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantBreach`] for display tasks and for a
    /// conflicting service on the same execution.
    pub async fn set_results_info(
        &self,
        task: &Task,
        service: &str,
        failed: bool,
    ) -> Result<()> {
        if task.display_only {
            return Err(Error::invariant(
                "cannot attach results to a display task",
            ));
        }
        if let Some(existing) = &task.results_service {
            if existing != service {
                return Err(Error::invariant(format!(
                    "task '{}' already has results in service '{existing}'",
                    task.id
                )));
            }
        }

        let update = TaskUpdate {
            set_results_service: Some(service.to_owned()),
            // Failures only latch on; a later success report must not hide
            // previously attached failures.
            set_results_failed: failed.then_some(true),
            ..TaskUpdate::default()
        };
        self.store
            .update_one(&TaskFilter::by_id(task.id.clone()), &update)
            .await?;
        Ok(())
    }

    /// Lets a user bypass all dependency edges on a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_override_dependencies(&self, task: &Task, user_id: &str) -> Result<()> {
        self.store
            .update_one(
                &TaskFilter::by_id(task.id.clone()),
                &TaskUpdate {
                    set_override_dependencies: Some(true),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        self.services.log_task_event(
            TaskEvent::new(
                task.id.clone(),
                task.execution,
                TaskEventKind::DependenciesOverridden,
                self.services.now(),
            )
            .with_caller(user_id),
        );
        Ok(())
    }

    /// Records the stepback depth that activated this task.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_stepback_depth(&self, task_id: &TaskId, depth: u32) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    set_stepback_depth: Some(depth),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Stamps the scheduled time on tasks the planner just surfaced, without
    /// overwriting an earlier stamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_tasks_scheduled_time(
        &self,
        task_ids: &[TaskId],
        scheduled_time: DateTime<Utc>,
    ) -> Result<UpdateResult> {
        if task_ids.is_empty() {
            return Ok(UpdateResult::default());
        }
        let result = self
            .store
            .update_many(
                &TaskFilter {
                    ids: Some(task_ids.to_vec()),
                    scheduled_time_unset: Some(true),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_scheduled_time: Some(scheduled_time),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Refreshes the task's expected-duration cache if it is stale, using
    /// the analytics collaborator. The prediction TTL is one day.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn cache_expected_duration(
        &self,
        task: &Task,
        source: &dyn DurationSource,
    ) -> Result<()> {
        const PREDICTION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

        let now = self.services.now();
        if task
            .duration_prediction
            .as_ref()
            .is_some_and(|p| !p.is_stale(now))
        {
            return Ok(());
        }

        let Some((value, std_dev)) =
            source.historical_duration(&task.project, &task.build_variant, &task.display_name)
        else {
            return Ok(());
        };

        let prediction = DurationPrediction {
            value,
            std_dev,
            collected_at: now,
            ttl: PREDICTION_TTL,
        };
        self.store
            .update_one(
                &TaskFilter::by_id(task.id.clone()),
                &TaskUpdate {
                    set_expected_duration: Some(value),
                    set_expected_duration_std_dev: Some(std_dev),
                    set_duration_prediction: Some(prediction),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// The shared mutation for releasing a container allocation.
fn container_deallocated_update() -> TaskUpdate {
    TaskUpdate {
        set_container_allocated: Some(false),
        clear_container_allocated_time: true,
        ..TaskUpdate::default()
    }
}
