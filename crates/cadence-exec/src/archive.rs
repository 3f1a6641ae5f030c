//! The archive and reset subsystem.
//!
//! Archiving copies the current execution of a task into the `old_tasks`
//! collection under a `"{id}_{execution}"` key, advances the live record's
//! execution number, and flags it resettable. Resetting then applies the
//! canonical reset mutation so the live record runs again from scratch.
//!
//! The whole archive batch (archive inserts plus the live-record updates) is
//! one atomic [`TaskStore::apply_batch`]: a crash can never leave a task
//! flagged resettable without its archived copy, or vice versa.
//!
//! Display tasks archive together with their execution tasks. In
//! reset-failed-only mode, only failed execution tasks progress to the new
//! execution; the others stay pinned at their last execution but share the
//! bumped `latest_parent_execution` counter.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::TaskId;

use crate::error::{Error, Result};
use crate::events::{TaskEvent, TaskEventKind};
use crate::services::CoreServices;
use crate::store::{TaskFilter, TaskQuery, TaskStore, TaskUpdate, TaskWrite, UpdateResult};
use crate::task::{Task, TaskStatus};

/// Archive and reset operations over the store.
pub struct Archiver {
    store: Arc<dyn TaskStore>,
    services: CoreServices,
}

impl Archiver {
    /// Creates an archiver over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, services: CoreServices) -> Self {
        Self { store, services }
    }

    /// Archives one task's current execution. A no-op for non-terminal
    /// tasks; display tasks are routed through the many-task path so their
    /// execution tasks are handled in the same batch.
    ///
    /// Idempotent: archiving twice inserts one archived record and advances
    /// the execution once, because the live update is gated on
    /// `can_reset = false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, execution = task.execution))]
    pub async fn archive(&self, task: &Task) -> Result<()> {
        if !task.status.is_terminal() {
            return Ok(());
        }
        if task.display_only && !task.execution_tasks.is_empty() {
            return self.archive_many(std::slice::from_ref(task)).await;
        }

        self.store
            .apply_batch(vec![
                TaskWrite::InsertOldTasks(vec![task.make_archived_task()]),
                TaskWrite::UpdateOne {
                    filter: archive_gate(TaskFilter::by_id(task.id.clone())),
                    update: archive_live_update(),
                },
            ])
            .await
    }

    /// Archives many tasks and display tasks (never execution tasks
    /// directly) in one atomic batch.
    ///
    /// For each display task, execution tasks are selected per its restart
    /// mode: all terminal ones, or only failed ones in reset-failed-only
    /// mode. Execution tasks still running are skipped with a log; every
    /// execution task of an archiving display shares the bumped
    /// `latest_parent_execution` regardless.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, tasks), fields(task_count = tasks.len()))]
    pub async fn archive_many(&self, tasks: &[Task]) -> Result<()> {
        let mut all_task_ids: Vec<TaskId> = Vec::new();
        let mut exec_task_ids: Vec<TaskId> = Vec::new();
        let mut to_restart_exec_ids: Vec<TaskId> = Vec::new();
        let mut archived: Vec<Task> = Vec::new();

        for task in tasks {
            if !task.status.is_terminal() {
                continue;
            }
            all_task_ids.push(task.id.clone());
            archived.push(task.make_archived_task());

            if task.display_only && !task.execution_tasks.is_empty() {
                let status_filter = if task.is_restart_failed_only() {
                    TaskStatus::failure_statuses()
                } else {
                    TaskStatus::terminal_statuses()
                };
                let exec_tasks = self
                    .store
                    .find(&TaskQuery::filtered(TaskFilter {
                        ids: Some(task.execution_tasks.clone()),
                        status_in: Some(status_filter),
                        ..TaskFilter::default()
                    }))
                    .await?;

                exec_task_ids.extend(task.execution_tasks.iter().cloned());
                for exec_task in exec_tasks {
                    if !exec_task.status.is_terminal() {
                        tracing::debug!(
                            task_id = %exec_task.id,
                            execution = exec_task.execution,
                            "execution task is in an incomplete state, skipping archive"
                        );
                        continue;
                    }
                    archived.push(exec_task.make_archived_task());
                    to_restart_exec_ids.push(exec_task.id);
                }
            }
        }

        if archived.is_empty() {
            return Ok(());
        }

        let mut writes = vec![
            TaskWrite::InsertOldTasks(archived),
            TaskWrite::UpdateMany {
                filter: archive_gate(TaskFilter::by_ids(all_task_ids)),
                update: archive_live_update(),
            },
        ];
        if !exec_task_ids.is_empty() {
            // Every execution task of an archiving display shares the bumped
            // counter; only the restarting subset advances its execution.
            writes.push(TaskWrite::UpdateMany {
                filter: TaskFilter::by_ids(exec_task_ids),
                update: TaskUpdate {
                    inc_latest_parent_execution: true,
                    ..TaskUpdate::default()
                },
            });
            writes.push(TaskWrite::UpdateMany {
                filter: TaskFilter::by_ids(to_restart_exec_ids),
                update: TaskUpdate {
                    set_execution_to_latest_parent: true,
                    set_can_reset: Some(true),
                    set_aborted: Some(false),
                    clear_abort_info: true,
                    set_override_dependencies: Some(false),
                    ..TaskUpdate::default()
                },
            });
        }

        self.store.apply_batch(writes).await
    }

    /// Resets an archived task to run a new execution.
    ///
    /// Guarded on `status ∈ terminal ∧ can_reset`; a competing reset's
    /// zero-match is absorbed as idempotent success, while resetting a task
    /// that is not terminal is a caller error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown ID and
    /// [`Error::PreconditionFailed`] when the task is not in a terminal
    /// status.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn reset(&self, task_id: &TaskId) -> Result<()> {
        let result = self.apply_reset(TaskFilter::by_id(task_id.clone())).await?;
        if !result.is_zero_match() {
            let task = self.store.get(task_id).await?;
            let execution = task.map_or(0, |t| t.execution);
            self.services.log_task_event(TaskEvent::new(
                task_id.clone(),
                execution,
                TaskEventKind::Restarted,
                self.services.now(),
            ));
            return Ok(());
        }

        // Zero match: distinguish the idempotent retry from a caller error.
        let Some(task) = self.store.get(task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: task_id.clone(),
            });
        };
        if !task.status.is_terminal() {
            return Err(Error::PreconditionFailed {
                task_id: task_id.clone(),
                detail: format!("cannot reset task in status '{}'", task.status),
            });
        }
        Ok(())
    }

    /// Bulk reset. Tasks that are not resettable are silently left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn reset_many(&self, task_ids: &[TaskId]) -> Result<UpdateResult> {
        if task_ids.is_empty() {
            return Ok(UpdateResult::default());
        }
        self.apply_reset(TaskFilter::by_ids(task_ids.to_vec())).await
    }

    /// Flags a task to restart automatically once it finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_reset_when_finished(&self, task_id: &TaskId) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    set_reset_when_finished: Some(true),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Flags a display task to restart only its failed execution tasks once
    /// it finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_reset_failed_when_finished(&self, task_id: &TaskId) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    set_reset_failed_when_finished: Some(true),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    async fn apply_reset(&self, mut filter: TaskFilter) -> Result<UpdateResult> {
        filter.status_in = Some(TaskStatus::terminal_statuses());
        filter.can_reset = Some(true);

        let now = self.services.now();
        let update = TaskUpdate {
            set_status: Some(TaskStatus::Undispatched),
            set_activated: Some(true),
            set_activated_time: Some(now),
            set_secret: Some(self.services.new_secret()),
            clear_scheduled_time: true,
            clear_dispatch_time: true,
            clear_start_time: true,
            clear_finish_time: true,
            clear_dependencies_met_time: true,
            clear_last_heartbeat: true,
            set_time_taken: Some(Duration::ZERO),
            clear_details: true,
            clear_host_id: true,
            clear_pod_id: true,
            clear_agent_version: true,
            clear_results_service: true,
            set_results_failed: Some(false),
            set_aborted: Some(false),
            clear_abort_info: true,
            set_container_allocation_attempts: Some(0),
            set_container_allocated: Some(false),
            clear_container_allocated_time: true,
            set_override_dependencies: Some(false),
            set_reset_when_finished: Some(false),
            set_reset_failed_when_finished: Some(false),
            set_can_reset: Some(false),
            recompute_unattainable_dependency: true,
            ..TaskUpdate::default()
        };
        self.store.update_many(&filter, &update).await
    }
}

/// Gate shared by every archive live-update: terminal and not yet archived.
fn archive_gate(mut filter: TaskFilter) -> TaskFilter {
    filter.status_in = Some(TaskStatus::terminal_statuses());
    filter.can_reset = Some(false);
    filter
}

/// The live-record mutation applied when an execution is archived.
fn archive_live_update() -> TaskUpdate {
    TaskUpdate {
        inc_execution: true,
        set_can_reset: Some(true),
        set_aborted: Some(false),
        clear_abort_info: true,
        ..TaskUpdate::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryOutbox;
    use crate::store::memory::InMemoryTaskStore;
    use cadence_core::{BuildId, ProjectId, VersionId};

    fn task(id: &str) -> Task {
        Task::new(
            TaskId::new(id),
            VersionId::new("v1"),
            BuildId::new("b1"),
            ProjectId::new("p1"),
            "bv",
            "name",
        )
    }

    fn finished_task(id: &str, status: TaskStatus) -> Task {
        let mut t = task(id);
        t.status = status;
        t.finish_time = Some(chrono::Utc::now());
        t
    }

    fn harness() -> (Arc<InMemoryTaskStore>, Arc<InMemoryOutbox>, Archiver) {
        let store = Arc::new(InMemoryTaskStore::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let services = CoreServices::new(outbox.clone());
        let archiver = Archiver::new(store.clone(), services);
        (store, outbox, archiver)
    }

    #[tokio::test]
    async fn archive_copies_execution_and_flags_reset() -> Result<()> {
        let (store, _, archiver) = harness();
        let t = finished_task("t1", TaskStatus::Succeeded);
        store.insert_many(vec![t.clone()]).await?;

        archiver.archive(&t).await?;

        let old = store.get_old(&TaskId::new("t1_0")).await?.unwrap();
        assert!(old.archived);
        assert_eq!(old.old_task_id, Some(TaskId::new("t1")));
        assert_eq!(old.execution, 0);

        let live = store.get(&TaskId::new("t1")).await?.unwrap();
        assert!(live.can_reset);
        assert!(!live.aborted);
        assert_eq!(live.execution, 1);
        Ok(())
    }

    #[tokio::test]
    async fn archive_is_idempotent() -> Result<()> {
        let (store, _, archiver) = harness();
        let t = finished_task("t1", TaskStatus::Failed);
        store.insert_many(vec![t.clone()]).await?;

        archiver.archive(&t).await?;
        archiver.archive(&t).await?;

        assert_eq!(store.old_task_count()?, 1);
        let live = store.get(&TaskId::new("t1")).await?.unwrap();
        assert_eq!(live.execution, 1);
        Ok(())
    }

    #[tokio::test]
    async fn archive_skips_non_terminal_tasks() -> Result<()> {
        let (store, _, archiver) = harness();
        let t = task("t1");
        store.insert_many(vec![t.clone()]).await?;

        archiver.archive(&t).await?;
        assert_eq!(store.old_task_count()?, 0);
        let live = store.get(&TaskId::new("t1")).await?.unwrap();
        assert!(!live.can_reset);
        Ok(())
    }

    #[tokio::test]
    async fn reset_after_archive_starts_a_new_execution() -> Result<()> {
        let (store, outbox, archiver) = harness();
        let mut t = finished_task("t1", TaskStatus::Failed);
        t.secret = "old-secret".into();
        t.host_id = Some(cadence_core::HostId::new("h1"));
        t.time_taken = Duration::from_secs(100);
        store.insert_many(vec![t.clone()]).await?;

        archiver.archive(&t).await?;
        archiver.reset(&TaskId::new("t1")).await?;

        let live = store.get(&TaskId::new("t1")).await?.unwrap();
        assert_eq!(live.execution, 1);
        assert_eq!(live.status, TaskStatus::Undispatched);
        assert!(live.activated);
        assert!(!live.can_reset);
        assert_ne!(live.secret, "old-secret");
        assert!(live.host_id.is_none());
        assert!(live.finish_time.is_none());
        assert_eq!(live.time_taken, Duration::ZERO);
        assert!(outbox
            .events()
            .iter()
            .any(|e| e.kind == TaskEventKind::Restarted));
        Ok(())
    }

    #[tokio::test]
    async fn reset_of_non_terminal_task_is_a_precondition_failure() -> Result<()> {
        let (store, _, archiver) = harness();
        store.insert_many(vec![task("t1")]).await?;

        let err = archiver.reset(&TaskId::new("t1")).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        // State unchanged.
        let live = store.get(&TaskId::new("t1")).await?.unwrap();
        assert_eq!(live.status, TaskStatus::Undispatched);
        assert_eq!(live.execution, 0);
        Ok(())
    }

    #[tokio::test]
    async fn reset_of_unknown_task_is_not_found() {
        let (_, _, archiver) = harness();
        let err = archiver.reset(&TaskId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, Error::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn bulk_reset_skips_unresettable_tasks() -> Result<()> {
        let (store, _, archiver) = harness();
        let finished = finished_task("done", TaskStatus::Failed);
        store
            .insert_many(vec![finished.clone(), task("running")])
            .await?;
        archiver.archive(&finished).await?;

        let result = archiver
            .reset_many(&[TaskId::new("done"), TaskId::new("running")])
            .await?;
        assert_eq!(result.matched, 1);

        let done = store.get(&TaskId::new("done")).await?.unwrap();
        let untouched = store.get(&TaskId::new("running")).await?.unwrap();
        assert_eq!(done.status, TaskStatus::Undispatched);
        assert!(done.activated);
        assert!(!untouched.activated);
        Ok(())
    }

    #[tokio::test]
    async fn display_archive_reset_failed_only_pins_succeeded_children() -> Result<()> {
        let (store, _, archiver) = harness();
        let mut display = finished_task("d", TaskStatus::Failed);
        display.display_only = true;
        display.execution_tasks = vec![TaskId::new("e1"), TaskId::new("e2")];
        display.reset_failed_when_finished = true;
        let e1 = finished_task("e1", TaskStatus::Succeeded);
        let e2 = finished_task("e2", TaskStatus::Failed);
        store
            .insert_many(vec![display.clone(), e1, e2])
            .await?;

        archiver.archive(&display).await?;

        let display = store.get(&TaskId::new("d")).await?.unwrap();
        let e1 = store.get(&TaskId::new("e1")).await?.unwrap();
        let e2 = store.get(&TaskId::new("e2")).await?.unwrap();

        assert_eq!(display.execution, 1);
        // The failed child progresses to the new execution...
        assert_eq!(e2.execution, 1);
        assert!(e2.can_reset);
        // ...while the succeeded child stays pinned but shares the counter.
        assert_eq!(e1.execution, 0);
        assert_eq!(e1.latest_parent_execution, 1);
        assert_eq!(e2.latest_parent_execution, 1);

        // Only the display and the failed child were archived.
        assert!(store.get_old(&TaskId::new("d_0")).await?.is_some());
        assert!(store.get_old(&TaskId::new("e2_0")).await?.is_some());
        assert!(store.get_old(&TaskId::new("e1_0")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn display_archive_includes_all_terminal_children_by_default() -> Result<()> {
        let (store, _, archiver) = harness();
        let mut display = finished_task("d", TaskStatus::Succeeded);
        display.display_only = true;
        display.execution_tasks = vec![TaskId::new("e1"), TaskId::new("e2")];
        let e1 = finished_task("e1", TaskStatus::Succeeded);
        let e2 = finished_task("e2", TaskStatus::Failed);
        store.insert_many(vec![display.clone(), e1, e2]).await?;

        archiver.archive(&display).await?;

        let e1 = store.get(&TaskId::new("e1")).await?.unwrap();
        let e2 = store.get(&TaskId::new("e2")).await?.unwrap();
        assert_eq!(e1.execution, 1);
        assert_eq!(e2.execution, 1);
        assert!(store.get_old(&TaskId::new("e1_0")).await?.is_some());
        assert!(store.get_old(&TaskId::new("e2_0")).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn reset_when_finished_flags_latch() -> Result<()> {
        let (store, _, archiver) = harness();
        store.insert_many(vec![task("t1")]).await?;

        archiver.set_reset_when_finished(&TaskId::new("t1")).await?;
        let t = store.get(&TaskId::new("t1")).await?.unwrap();
        assert!(t.reset_when_finished);
        assert!(!t.is_restart_failed_only());

        archiver
            .set_reset_failed_when_finished(&TaskId::new("t1"))
            .await?;
        let t = store.get(&TaskId::new("t1")).await?.unwrap();
        assert!(t.reset_failed_when_finished);
        Ok(())
    }
}
