//! The dependency engine: recursive graph walks and cascade maintenance.
//!
//! The engine owns every operation that reads or writes more than one task's
//! dependency state:
//!
//! - Recursive walks up (ancestors) and down (dependents) the edge graph
//! - Activation and deactivation cascades
//! - Maintenance of the `unattainable` edge flags and the per-task
//!   `unattainable_dependency` cache
//! - The per-version cycle check
//!
//! Cascades are *not* transactional: each applies one multi-update for the
//! whole affected set and emits events best-effort afterwards. Reconciliation
//! paths ([`DependencyEngine::refresh_blocked_dependencies`]) repair the
//! windows this leaves open.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cadence_core::{TaskId, VersionId};

use crate::error::{Error, Result};
use crate::events::{TaskEvent, TaskEventKind};
use crate::dag::TaskGraph;
use crate::services::CoreServices;
use crate::store::{TaskFilter, TaskQuery, TaskSort, TaskStore, TaskUpdate};
use crate::task::{DependencyRequirement, Task};

/// Recursive dependency walks and cascades over the store.
pub struct DependencyEngine {
    store: Arc<dyn TaskStore>,
    services: CoreServices,
}

impl DependencyEngine {
    /// Creates an engine over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, services: CoreServices) -> Self {
        Self { store, services }
    }

    /// Returns all tasks the seeds recursively depend on that are not
    /// already in `cache`. Visited tasks accumulate in `cache` keyed by ID,
    /// which doubles as the recursion guard and saves re-reads.
    ///
    /// For members of single-host task groups, earlier members of the same
    /// group count as ancestors: they must dispatch first even without an
    /// explicit edge.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn get_recursive_dependencies_up(
        &self,
        tasks: &[Task],
        cache: &mut HashMap<TaskId, Task>,
    ) -> Result<Vec<Task>> {
        let mut ancestors = Vec::new();
        let mut frontier: Vec<Task> = tasks.to_vec();

        while !frontier.is_empty() {
            for task in &frontier {
                cache.insert(task.id.clone(), task.clone());
            }

            let mut to_find: Vec<TaskId> = Vec::new();
            for task in &frontier {
                for dep in &task.depends_on {
                    if !cache.contains_key(&dep.task_id) && !to_find.contains(&dep.task_id) {
                        to_find.push(dep.task_id.clone());
                    }
                }
                if task.is_part_of_single_host_task_group() {
                    let group = self
                        .store
                        .find(&TaskQuery {
                            filter: TaskFilter {
                                build_id: Some(task.build_id.clone()),
                                task_group: task.task_group.clone(),
                                ..TaskFilter::default()
                            },
                            sort: Some(TaskSort::TaskGroupOrderAsc),
                            ..TaskQuery::default()
                        })
                        .await?;
                    for member in group {
                        if member.task_group_order < task.task_group_order
                            && !cache.contains_key(&member.id)
                            && !to_find.contains(&member.id)
                        {
                            to_find.push(member.id);
                        }
                    }
                }
            }

            if to_find.is_empty() {
                break;
            }

            let found = self.store.batch_get(&to_find).await?;
            ancestors.extend(found.iter().cloned());
            frontier = found;
        }

        Ok(ancestors)
    }

    /// Returns all tasks that recursively depend on the seeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn get_recursive_dependencies_down(&self, seeds: &[TaskId]) -> Result<Vec<Task>> {
        let mut visited: HashSet<TaskId> = seeds.iter().cloned().collect();
        let mut dependents = Vec::new();
        let mut frontier: Vec<TaskId> = seeds.to_vec();

        while !frontier.is_empty() {
            let found = self
                .store
                .find(&TaskQuery::filtered(TaskFilter {
                    depends_on_task_in: Some(frontier.clone()),
                    ..TaskFilter::default()
                }))
                .await?;

            frontier = Vec::new();
            for task in found {
                if visited.insert(task.id.clone()) {
                    frontier.push(task.id.clone());
                    dependents.push(task);
                }
            }
        }

        Ok(dependents)
    }

    /// Re-activates downstream tasks that were deactivated because their
    /// dependencies were, once every dependency is active again.
    ///
    /// Walks the downstream set in topological order so a dependent is
    /// examined only after its upstream's activation decision is known, then
    /// applies one multi-update and emits one activation event per task.
    /// Returns the IDs that were activated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] if the downstream graph has a cycle,
    /// or a storage error.
    #[tracing::instrument(skip(self, seeds), fields(seed_count = seeds.len(), caller))]
    pub async fn activate_deactivated_dependencies(
        &self,
        seeds: &[TaskId],
        caller: &str,
    ) -> Result<Vec<TaskId>> {
        let seed_set: HashSet<&TaskId> = seeds.iter().collect();
        let downstream = self.get_recursive_dependencies_down(seeds).await?;
        let sorted = topological_sort(&downstream)?;

        // Fetch the activation state of upstreams outside the downstream set.
        let in_walk: HashSet<&TaskId> = downstream.iter().map(|t| &t.id).collect();
        let mut to_fetch: Vec<TaskId> = Vec::new();
        for task in &sorted {
            if task.activated || !task.deactivated_for_dependency {
                continue;
            }
            for dep in &task.depends_on {
                if !seed_set.contains(&dep.task_id)
                    && !in_walk.contains(&dep.task_id)
                    && !to_fetch.contains(&dep.task_id)
                {
                    to_fetch.push(dep.task_id.clone());
                }
            }
        }
        let outside: HashMap<TaskId, Task> = self
            .store
            .batch_get(&to_fetch)
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let mut to_activate: Vec<Task> = Vec::new();
        let mut activating: HashSet<TaskId> = HashSet::new();
        for task in sorted {
            if task.activated || !task.deactivated_for_dependency {
                continue;
            }
            let deps_satisfied = task.depends_on.iter().all(|dep| {
                seed_set.contains(&dep.task_id)
                    || activating.contains(&dep.task_id)
                    || outside.get(&dep.task_id).is_some_and(|t| t.activated)
            });
            if deps_satisfied {
                activating.insert(task.id.clone());
                to_activate.push(task);
            }
        }

        if to_activate.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<TaskId> = to_activate.iter().map(|t| t.id.clone()).collect();
        let now = self.services.now();
        self.store
            .update_many(
                &TaskFilter::by_ids(ids.clone()),
                &TaskUpdate {
                    set_activated: Some(true),
                    set_deactivated_for_dependency: Some(false),
                    set_activated_by: Some(caller.to_owned()),
                    set_activated_time: Some(now),
                    recompute_unattainable_dependency: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;

        for task in &to_activate {
            self.services.log_task_event(
                TaskEvent::new(task.id.clone(), task.execution, TaskEventKind::Activated, now)
                    .with_caller(caller),
            );
        }

        Ok(ids)
    }

    /// Deactivates every currently-activated task downstream of the seeds,
    /// marking each as deactivated-for-dependency so a later activation
    /// cascade can restore it. Returns the IDs that were deactivated.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, seeds), fields(seed_count = seeds.len(), caller))]
    pub async fn deactivate_dependencies(
        &self,
        seeds: &[TaskId],
        caller: &str,
    ) -> Result<Vec<TaskId>> {
        let downstream = self.get_recursive_dependencies_down(seeds).await?;
        let to_update: Vec<Task> = downstream.into_iter().filter(|t| t.activated).collect();
        if to_update.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<TaskId> = to_update.iter().map(|t| t.id.clone()).collect();
        self.store
            .update_many(
                &TaskFilter::by_ids(ids.clone()),
                &TaskUpdate {
                    set_activated: Some(false),
                    set_deactivated_for_dependency: Some(true),
                    clear_scheduled_time: true,
                    ..TaskUpdate::default()
                },
            )
            .await?;

        let now = self.services.now();
        for task in &to_update {
            self.services.log_task_event(
                TaskEvent::new(task.id.clone(), task.execution, TaskEventKind::Deactivated, now)
                    .with_caller(caller),
            );
        }

        Ok(ids)
    }

    /// Flips the `unattainable` flag on `task`'s edges pointing at
    /// `dependency_id` and recomputes the task-level cache. Emits a blocked
    /// event only when the task transitions from unblocked to blocked and is
    /// not overriding its dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_unattainable_dependency(
        &self,
        task: &Task,
        dependency_id: &TaskId,
        unattainable: bool,
    ) -> Result<()> {
        let was_blocked = task.is_blocked();
        self.store
            .set_dependency_unattainable(
                std::slice::from_ref(&task.id),
                dependency_id,
                unattainable,
            )
            .await?;

        if !was_blocked && unattainable && !task.override_dependencies {
            self.services.log_task_event(TaskEvent::new(
                task.id.clone(),
                task.execution,
                TaskEventKind::Blocked,
                self.services.now(),
            ));
        }
        Ok(())
    }

    /// Propagates blockage downstream from a task that finished or became
    /// blocked: every dependent whose edge requirement can no longer be met
    /// gets that edge marked unattainable, and newly blocked dependents
    /// propagate further.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self, seed), fields(task_id = %seed.id))]
    pub async fn update_blocked_dependencies(&self, seed: &Task) -> Result<()> {
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut frontier: Vec<Task> = vec![seed.clone()];

        while let Some(current) = frontier.pop() {
            if !visited.insert(current.id.clone()) {
                continue;
            }

            let dependents = self
                .store
                .find(&TaskQuery::filtered(TaskFilter {
                    depends_on_task: Some(current.id.clone()),
                    ..TaskFilter::default()
                }))
                .await?;

            for mut dependent in dependents {
                let Some(edge_idx) = dependent
                    .depends_on
                    .iter()
                    .position(|d| d.task_id == current.id)
                else {
                    continue;
                };
                if dependent.depends_on[edge_idx].unattainable {
                    continue;
                }
                if !edge_unsatisfiable(&dependent, edge_idx, &current) {
                    continue;
                }

                self.mark_unattainable_dependency(&dependent, &current.id, true)
                    .await?;

                dependent.depends_on[edge_idx].unattainable = true;
                dependent.recompute_unattainable_dependency();
                if dependent.is_blocked() {
                    frontier.push(dependent);
                }
            }
        }
        Ok(())
    }

    /// Reconciliation path for a task that is not marked blocked but might
    /// need to be: fetches its upstream tasks and returns those whose
    /// satisfaction is no longer possible (finished with a non-matching
    /// status, or themselves blocked). Callers apply
    /// [`DependencyEngine::mark_unattainable_dependency`] for each.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn refresh_blocked_dependencies(&self, task: &Task) -> Result<Vec<Task>> {
        let dep_ids: Vec<TaskId> = task.depends_on.iter().map(|d| d.task_id.clone()).collect();
        let upstreams = self.store.batch_get(&dep_ids).await?;

        let blocking = upstreams
            .into_iter()
            .filter(|up| {
                let Some(edge_idx) = task.depends_on.iter().position(|d| d.task_id == up.id)
                else {
                    return false;
                };
                edge_unsatisfiable(task, edge_idx, up)
            })
            .collect();
        Ok(blocking)
    }

    /// Returns true once every dependency edge of `task` is satisfied by a
    /// finished upstream. Upstream records accumulate in `cache` across
    /// calls so batch scheduling passes avoid re-reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn dependencies_met(
        &self,
        task: &Task,
        cache: &mut HashMap<TaskId, Task>,
    ) -> Result<bool> {
        if task.depends_on.is_empty() || task.override_dependencies {
            return Ok(true);
        }

        let to_fetch: Vec<TaskId> = task
            .depends_on
            .iter()
            .filter(|d| !cache.contains_key(&d.task_id))
            .map(|d| d.task_id.clone())
            .collect();
        for upstream in self.store.batch_get(&to_fetch).await? {
            cache.insert(upstream.id.clone(), upstream);
        }

        for dep in &task.depends_on {
            let Some(upstream) = cache.get(&dep.task_id) else {
                return Ok(false);
            };
            if !task.satisfies_dependency(upstream) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Verification hook: detects dependency cycles among the tasks of a
    /// version. Inter-version edges are ignored; only the ingestion layer
    /// can create those and it is trusted not to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] naming every task in a cycle, or a
    /// storage error.
    pub async fn circular_dependencies(&self, version: &VersionId) -> Result<()> {
        let tasks = self
            .store
            .find(&TaskQuery::filtered(TaskFilter {
                version: Some(version.clone()),
                has_dependencies: Some(true),
                ..TaskFilter::default()
            }))
            .await?;
        if tasks.is_empty() {
            return Ok(());
        }

        let mut graph = TaskGraph::new();
        for task in &tasks {
            graph.add_node(task.id.clone());
        }
        for task in &tasks {
            let dependent = graph.add_node(task.id.clone());
            for dep in &task.depends_on {
                let dependency = graph.add_node(dep.task_id.clone());
                graph.add_edge(dependency, dependent);
            }
        }

        let cycles = graph.cycles();
        if cycles.is_empty() {
            return Ok(());
        }
        let mut members: Vec<String> = cycles
            .into_iter()
            .flatten()
            .map(|id| id.to_string())
            .collect();
        members.sort();
        Err(Error::CycleDetected { cycle: members })
    }
}

/// Returns true if the edge at `edge_idx` of `task` can no longer be
/// satisfied by `upstream`: the upstream finished with a non-matching
/// outcome, or is blocked and the edge requires a specific outcome.
fn edge_unsatisfiable(task: &Task, edge_idx: usize, upstream: &Task) -> bool {
    if upstream.is_finished() {
        return !task.satisfies_dependency(upstream);
    }
    if upstream.is_blocked() {
        return task.depends_on[edge_idx].status != DependencyRequirement::Any;
    }
    false
}

/// Topologically sorts tasks by their edges within the slice. Edges pointing
/// outside the slice are ignored.
fn topological_sort(tasks: &[Task]) -> Result<Vec<Task>> {
    let mut graph = TaskGraph::new();
    for task in tasks {
        graph.add_node(task.id.clone());
    }
    for task in tasks {
        for dep in &task.depends_on {
            if let (Some(from), Some(to)) = (graph.get_index(&dep.task_id), graph.get_index(&task.id))
            {
                graph.add_edge(from, to);
            }
        }
    }

    let order = graph.toposort()?;
    let mut by_id: HashMap<TaskId, Task> =
        tasks.iter().map(|t| (t.id.clone(), t.clone())).collect();
    Ok(order.into_iter().filter_map(|id| by_id.remove(&id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Dependency, TaskStatus};
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

    fn depends(id: &str, on: &[&str]) -> Task {
        let mut t = task(id);
        for up in on {
            t.depends_on.push(Dependency::on_success(TaskId::new(*up)));
        }
        t
    }

    #[test]
    fn topological_sort_orders_upstream_first() {
        let tasks = vec![depends("c", &["b"]), depends("b", &["a"]), task("a")];
        let sorted = topological_sort(&tasks).unwrap();
        let ids: Vec<&str> = sorted.iter().map(|t| t.id.as_str()).collect();
        let pos = |x: &str| ids.iter().position(|i| *i == x).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn topological_sort_rejects_cycle() {
        let tasks = vec![depends("a", &["b"]), depends("b", &["a"])];
        assert!(matches!(
            topological_sort(&tasks),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn edge_unsatisfiable_on_wrong_outcome() {
        let mut down = depends("down", &["up"]);
        let mut up = task("up");

        up.status = TaskStatus::Failed;
        assert!(edge_unsatisfiable(&down, 0, &up));

        up.status = TaskStatus::Succeeded;
        assert!(!edge_unsatisfiable(&down, 0, &up));

        // A blocked upstream is unattainable for a "succeeded" edge...
        up.status = TaskStatus::Undispatched;
        up.depends_on.push(Dependency {
            unattainable: true,
            ..Dependency::on_success(TaskId::new("far"))
        });
        assert!(edge_unsatisfiable(&down, 0, &up));

        // ...but satisfies an "any" edge.
        down.depends_on[0].status = DependencyRequirement::Any;
        assert!(!edge_unsatisfiable(&down, 0, &up));
    }

    mod engine {
        use super::*;
        use crate::events::InMemoryOutbox;
        use crate::store::memory::InMemoryTaskStore;

        fn harness() -> (Arc<InMemoryTaskStore>, Arc<InMemoryOutbox>, DependencyEngine) {
            let store = Arc::new(InMemoryTaskStore::new());
            let outbox = Arc::new(InMemoryOutbox::new());
            let services = CoreServices::new(outbox.clone());
            let engine = DependencyEngine::new(store.clone(), services);
            (store, outbox, engine)
        }

        #[tokio::test]
        async fn recursive_down_walk_collects_transitive_dependents() -> Result<()> {
            let (store, _, engine) = harness();
            store
                .insert_many(vec![
                    task("a"),
                    depends("b", &["a"]),
                    depends("c", &["b"]),
                    depends("unrelated", &["x"]),
                ])
                .await?;

            let down = engine
                .get_recursive_dependencies_down(&[TaskId::new("a")])
                .await?;
            let mut ids: Vec<&str> = down.iter().map(|t| t.id.as_str()).collect();
            ids.sort_unstable();
            assert_eq!(ids, vec!["b", "c"]);
            Ok(())
        }

        #[tokio::test]
        async fn recursive_up_walk_collects_ancestors_and_caches() -> Result<()> {
            let (store, _, engine) = harness();
            store
                .insert_many(vec![task("a"), depends("b", &["a"]), depends("c", &["b"])])
                .await?;

            let seed = store.get(&TaskId::new("c")).await?.unwrap();
            let mut cache = HashMap::new();
            let up = engine
                .get_recursive_dependencies_up(&[seed], &mut cache)
                .await?;
            let mut ids: Vec<&str> = up.iter().map(|t| t.id.as_str()).collect();
            ids.sort_unstable();
            assert_eq!(ids, vec!["a", "b"]);
            // Cache holds seed and all ancestors.
            assert_eq!(cache.len(), 3);
            Ok(())
        }

        #[tokio::test]
        async fn up_walk_includes_earlier_single_host_group_members() -> Result<()> {
            let (store, _, engine) = harness();
            let mut first = task("g1");
            first.task_group = Some("group".into());
            first.task_group_max_hosts = 1;
            first.task_group_order = 1;
            let mut second = task("g2");
            second.task_group = Some("group".into());
            second.task_group_max_hosts = 1;
            second.task_group_order = 2;
            store.insert_many(vec![first, second.clone()]).await?;

            let mut cache = HashMap::new();
            let up = engine
                .get_recursive_dependencies_up(&[second], &mut cache)
                .await?;
            let ids: Vec<&str> = up.iter().map(|t| t.id.as_str()).collect();
            assert_eq!(ids, vec!["g1"]);
            Ok(())
        }

        #[tokio::test]
        async fn deactivate_dependencies_marks_downstream() -> Result<()> {
            let (store, outbox, engine) = harness();
            let mut b = depends("b", &["a"]);
            b.activated = true;
            store.insert_many(vec![task("a"), b]).await?;

            let deactivated = engine
                .deactivate_dependencies(&[TaskId::new("a")], "user")
                .await?;
            assert_eq!(deactivated, vec![TaskId::new("b")]);

            let b = store.get(&TaskId::new("b")).await?.unwrap();
            assert!(!b.activated);
            assert!(b.deactivated_for_dependency);
            assert!(b.scheduled_time.is_none());
            assert_eq!(outbox.events().len(), 1);
            Ok(())
        }

        #[tokio::test]
        async fn circular_dependencies_reports_cycle_members() -> Result<()> {
            let (store, _, engine) = harness();
            store
                .insert_many(vec![depends("a", &["b"]), depends("b", &["a"]), task("c")])
                .await?;

            let err = engine
                .circular_dependencies(&VersionId::new("v1"))
                .await
                .unwrap_err();
            match err {
                Error::CycleDetected { cycle } => assert_eq!(cycle, vec!["a", "b"]),
                other => panic!("unexpected error: {other}"),
            }
            Ok(())
        }

        #[tokio::test]
        async fn circular_dependencies_accepts_acyclic_version() -> Result<()> {
            let (store, _, engine) = harness();
            store
                .insert_many(vec![task("a"), depends("b", &["a"])])
                .await?;
            engine.circular_dependencies(&VersionId::new("v1")).await?;
            Ok(())
        }

        #[tokio::test]
        async fn self_loop_is_detected() -> Result<()> {
            let (store, _, engine) = harness();
            store.insert_many(vec![depends("a", &["a"])]).await?;
            let err = engine
                .circular_dependencies(&VersionId::new("v1"))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::CycleDetected { .. }));
            Ok(())
        }

        #[tokio::test]
        async fn mark_unattainable_emits_blocked_event_once() -> Result<()> {
            let (store, outbox, engine) = harness();
            let down = depends("down", &["up"]);
            store.insert_many(vec![task("up"), down.clone()]).await?;

            engine
                .mark_unattainable_dependency(&down, &TaskId::new("up"), true)
                .await?;
            let events = outbox.events();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, TaskEventKind::Blocked);

            // Already blocked: no second event.
            let down = store.get(&TaskId::new("down")).await?.unwrap();
            engine
                .mark_unattainable_dependency(&down, &TaskId::new("up"), true)
                .await?;
            assert_eq!(outbox.events().len(), 1);
            Ok(())
        }

        #[tokio::test]
        async fn refresh_blocked_dependencies_finds_unsatisfiable_upstreams() -> Result<()> {
            let (store, _, engine) = harness();
            let mut up = task("up");
            up.status = TaskStatus::Failed;
            let down = depends("down", &["up", "fine"]);
            let mut fine = task("fine");
            fine.status = TaskStatus::Succeeded;
            store.insert_many(vec![up, fine, down.clone()]).await?;

            let blocking = engine.refresh_blocked_dependencies(&down).await?;
            let ids: Vec<&str> = blocking.iter().map(|t| t.id.as_str()).collect();
            assert_eq!(ids, vec!["up"]);
            Ok(())
        }
    }
}
