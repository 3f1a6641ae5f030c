//! Producer-facing operations: how the ingestion layer populates the core.
//!
//! The version/patch ingestion layer creates task records, wires dependency
//! edges, assembles display tasks, and records generated-task payloads. Each
//! operation is idempotent where its filter enforces uniqueness: adding the
//! same edge twice, re-marking generation, or re-submitting generated JSON
//! all return without error.

use std::sync::Arc;

use cadence_core::TaskId;

use crate::error::{Error, Result};
use crate::services::CoreServices;
use crate::store::{TaskFilter, TaskStore, TaskUpdate, UpdateResult};
use crate::task::{Dependency, DisplayTaskLink, Task};

/// Ingestion-side writes to the task collection.
pub struct IngestService {
    store: Arc<dyn TaskStore>,
    services: CoreServices,
}

impl IngestService {
    /// Creates the service over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, services: CoreServices) -> Self {
        Self { store, services }
    }

    /// Inserts a batch of newly created tasks, stamping `ingest_time` and a
    /// fresh per-execution secret on records that lack them.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate live task ID.
    #[tracing::instrument(skip(self, tasks), fields(task_count = tasks.len()))]
    pub async fn insert_tasks(&self, mut tasks: Vec<Task>) -> Result<()> {
        let now = self.services.now();
        for task in &mut tasks {
            if task.ingest_time.is_none() {
                task.ingest_time = Some(now);
            }
            if task.secret.is_empty() {
                task.secret = self.services.new_secret();
            }
        }
        self.store.insert_many(tasks).await
    }

    /// Adds a dependency edge to a task.
    ///
    /// Re-adding an identical edge returns without error; an edge to the
    /// same upstream with a different requirement is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task and
    /// [`Error::InvariantBreach`] for a conflicting requirement.
    pub async fn add_dependency(&self, task_id: &TaskId, dep: Dependency) -> Result<()> {
        let Some(task) = self.store.get(task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: task_id.clone(),
            });
        };

        for existing in &task.depends_on {
            if existing.task_id == dep.task_id {
                if existing.status == dep.status {
                    return Ok(());
                }
                return Err(Error::invariant(format!(
                    "task '{task_id}' already depends on '{}' with requirement {:?}",
                    dep.task_id, existing.status
                )));
            }
        }

        self.store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    push_dependency: Some(dep),
                    recompute_unattainable_dependency: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Removes the edge pointing at `dependency_id` by rewriting the task's
    /// `depends_on` array.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task.
    pub async fn remove_dependency(
        &self,
        task_id: &TaskId,
        dependency_id: &TaskId,
    ) -> Result<()> {
        let Some(task) = self.store.get(task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: task_id.clone(),
            });
        };

        let rewritten: Vec<Dependency> = task
            .depends_on
            .into_iter()
            .filter(|d| &d.task_id != dependency_id)
            .collect();
        self.store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    set_depends_on: Some(rewritten),
                    recompute_unattainable_dependency: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Caches the display-task resolution on an execution task.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_display_task_link(
        &self,
        task_id: &TaskId,
        link: DisplayTaskLink,
    ) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    set_display_task_link: Some(link),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Attaches execution tasks to a display task (set semantics) and links
    /// each execution task back to its parent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the display task is unknown, and
    /// [`Error::InvariantBreach`] if it is not display-only.
    pub async fn add_exec_tasks_to_display_task(
        &self,
        display_task_id: &TaskId,
        exec_task_ids: Vec<TaskId>,
    ) -> Result<()> {
        let Some(display) = self.store.get(display_task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: display_task_id.clone(),
            });
        };
        if !display.display_only {
            return Err(Error::invariant(format!(
                "cannot add execution tasks to non-display task '{display_task_id}'"
            )));
        }

        self.store
            .update_one(
                &TaskFilter::by_id(display_task_id.clone()),
                &TaskUpdate {
                    push_execution_tasks: Some(exec_task_ids.clone()),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        self.store
            .update_many(
                &TaskFilter::by_ids(exec_task_ids),
                &TaskUpdate {
                    set_display_task_link: Some(DisplayTaskLink::Id(display_task_id.clone())),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Records the generated-task configuration produced by a generator. A
    /// payload that is already present is left untouched, making retried
    /// submissions no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_generated_json(
        &self,
        task_id: &TaskId,
        json: Vec<serde_json::Value>,
    ) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task_id.clone()),
                    generated_json_unset: Some(true),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_generated_json: Some(json),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Flips the generation idempotence flag. Zero matches means generation
    /// already ran for this execution, which is the point of the flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_generated_tasks(&self, task_id: &TaskId) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter {
                    id: Some(task_id.clone()),
                    generated_tasks: Some(false),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_generated_tasks: Some(true),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }

    /// Queues a generated task name for activation under a build variant
    /// once the generator finishes (add-to-set semantics).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_generated_tasks_to_activate(
        &self,
        task_id: &TaskId,
        build_variant: &str,
        task_name: &str,
    ) -> Result<UpdateResult> {
        let result = self
            .store
            .update_one(
                &TaskFilter::by_id(task_id.clone()),
                &TaskUpdate {
                    add_generated_task_to_activate: Some((
                        build_variant.to_owned(),
                        task_name.to_owned(),
                    )),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryTaskStore;
    use crate::task::DependencyRequirement;
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

    fn harness() -> (Arc<InMemoryTaskStore>, IngestService) {
        let store = Arc::new(InMemoryTaskStore::new());
        let service = IngestService::new(store.clone(), CoreServices::without_events());
        (store, service)
    }

    #[tokio::test]
    async fn insert_stamps_ingest_time_and_secret() -> Result<()> {
        let (store, service) = harness();
        service.insert_tasks(vec![task("t1")]).await?;

        let t = store.get(&TaskId::new("t1")).await?.unwrap();
        assert!(t.ingest_time.is_some());
        assert!(!t.secret.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn add_dependency_is_idempotent_and_checks_conflicts() -> Result<()> {
        let (store, service) = harness();
        service.insert_tasks(vec![task("t1"), task("up")]).await?;

        let dep = Dependency::on_success(TaskId::new("up"));
        service.add_dependency(&TaskId::new("t1"), dep.clone()).await?;
        service.add_dependency(&TaskId::new("t1"), dep).await?;

        let t = store.get(&TaskId::new("t1")).await?.unwrap();
        assert_eq!(t.depends_on.len(), 1);

        let conflict = Dependency::with_requirement(
            TaskId::new("up"),
            DependencyRequirement::Failed,
        );
        let err = service
            .add_dependency(&TaskId::new("t1"), conflict)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantBreach { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn remove_dependency_rewrites_edges_and_cache() -> Result<()> {
        let (store, service) = harness();
        service.insert_tasks(vec![task("t1")]).await?;
        service
            .add_dependency(
                &TaskId::new("t1"),
                Dependency {
                    unattainable: true,
                    ..Dependency::on_success(TaskId::new("up"))
                },
            )
            .await?;

        let t = store.get(&TaskId::new("t1")).await?.unwrap();
        assert!(t.unattainable_dependency);

        service
            .remove_dependency(&TaskId::new("t1"), &TaskId::new("up"))
            .await?;
        let t = store.get(&TaskId::new("t1")).await?.unwrap();
        assert!(t.depends_on.is_empty());
        assert!(!t.unattainable_dependency);
        Ok(())
    }

    #[tokio::test]
    async fn exec_tasks_attach_to_display_task_bidirectionally() -> Result<()> {
        let (store, service) = harness();
        let mut display = task("dt");
        display.display_only = true;
        service
            .insert_tasks(vec![display, task("e1"), task("e2")])
            .await?;

        service
            .add_exec_tasks_to_display_task(
                &TaskId::new("dt"),
                vec![TaskId::new("e1"), TaskId::new("e2")],
            )
            .await?;
        // Re-attaching is a no-op thanks to set semantics.
        service
            .add_exec_tasks_to_display_task(&TaskId::new("dt"), vec![TaskId::new("e1")])
            .await?;

        let display = store.get(&TaskId::new("dt")).await?.unwrap();
        assert_eq!(
            display.execution_tasks,
            vec![TaskId::new("e1"), TaskId::new("e2")]
        );
        let e1 = store.get(&TaskId::new("e1")).await?.unwrap();
        assert_eq!(
            e1.display_task_link,
            DisplayTaskLink::Id(TaskId::new("dt"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn attach_to_non_display_task_is_rejected() -> Result<()> {
        let (_, service) = harness();
        service.insert_tasks(vec![task("plain")]).await?;

        let err = service
            .add_exec_tasks_to_display_task(&TaskId::new("plain"), vec![TaskId::new("e1")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantBreach { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn generated_json_is_write_once() -> Result<()> {
        let (store, service) = harness();
        service.insert_tasks(vec![task("gen")]).await?;

        let first = service
            .set_generated_json(&TaskId::new("gen"), vec![serde_json::json!({"v": 1})])
            .await?;
        assert_eq!(first.matched, 1);

        let second = service
            .set_generated_json(&TaskId::new("gen"), vec![serde_json::json!({"v": 2})])
            .await?;
        assert!(second.is_zero_match());

        let t = store.get(&TaskId::new("gen")).await?.unwrap();
        assert_eq!(t.generated_json, vec![serde_json::json!({"v": 1})]);
        Ok(())
    }

    #[tokio::test]
    async fn mark_generated_tasks_flips_once() -> Result<()> {
        let (_, service) = harness();
        service.insert_tasks(vec![task("gen")]).await?;

        let first = service.mark_generated_tasks(&TaskId::new("gen")).await?;
        assert_eq!(first.matched, 1);
        let second = service.mark_generated_tasks(&TaskId::new("gen")).await?;
        assert!(second.is_zero_match());
        Ok(())
    }
}
