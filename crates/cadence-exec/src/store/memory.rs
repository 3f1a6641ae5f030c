//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryTaskStore`], a simple in-memory
//! implementation of the [`TaskStore`] trait suitable for testing and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! Records are held in `BTreeMap`s keyed by ID, so query results come back in
//! stable ID order and tests are deterministic. Index hints are recorded but
//! never used for planning.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;

use cadence_core::TaskId;

use super::{IndexHint, TaskFilter, TaskQuery, TaskSort, TaskStore, TaskUpdate, TaskWrite, UpdateResult};
use crate::error::{Error, Result};
use crate::task::Task;

/// In-memory store for testing.
///
/// Thread-safe via `RwLock`; the atomic batch takes the write lock for its
/// whole body, which gives it transaction semantics within one process.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
    old_tasks: RwLock<BTreeMap<TaskId, Task>>,
    hints_seen: Mutex<Vec<IndexHint>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryTaskStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let count = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks.len()
        };
        Ok(count)
    }

    /// Returns the number of archived executions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn old_task_count(&self) -> Result<usize> {
        let count = {
            let old = self.old_tasks.read().map_err(poison_err)?;
            old.len()
        };
        Ok(count)
    }

    /// Returns the index hints queries have forced, in order.
    #[must_use]
    pub fn hints_seen(&self) -> Vec<IndexHint> {
        self.hints_seen.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn apply_update_locked(
        tasks: &mut BTreeMap<TaskId, Task>,
        filter: &TaskFilter,
        update: &TaskUpdate,
        at_most_one: bool,
    ) -> UpdateResult {
        let mut result = UpdateResult::default();
        for task in tasks.values_mut() {
            if !filter.matches(task) {
                continue;
            }
            result.matched += 1;
            let before = task.clone();
            update.apply(task);
            if *task != before {
                result.modified += 1;
            }
            if at_most_one {
                break;
            }
        }
        result
    }

    fn insert_old_locked(old: &mut BTreeMap<TaskId, Task>, tasks: Vec<Task>) {
        for task in tasks {
            // Duplicate archive IDs are dropped: re-archiving is idempotent.
            old.entry(task.id.clone()).or_insert(task);
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let result = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks.get(id).cloned()
        };
        Ok(result)
    }

    async fn batch_get(&self, ids: &[TaskId]) -> Result<Vec<Task>> {
        let result = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            ids.iter().filter_map(|id| tasks.get(id).cloned()).collect()
        };
        Ok(result)
    }

    async fn find(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        if let Some(hint) = query.hint {
            if let Ok(mut hints) = self.hints_seen.lock() {
                hints.push(hint);
            }
        }

        let mut result: Vec<Task> = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks
                .values()
                .filter(|t| query.filter.matches(t))
                .cloned()
                .collect()
        };

        match query.sort {
            Some(TaskSort::TaskGroupOrderAsc) => {
                result.sort_by_key(|t| (t.task_group_order, t.id.clone()));
            }
            // BTreeMap iteration already yields ID order.
            Some(TaskSort::IdAsc) | None => {}
        }

        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn insert_many(&self, new_tasks: Vec<Task>) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        for task in &new_tasks {
            if tasks.contains_key(&task.id) {
                return Err(Error::storage(format!(
                    "duplicate live task ID '{}'",
                    task.id
                )));
            }
        }
        for task in new_tasks {
            tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    async fn update_one(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<UpdateResult> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        Ok(Self::apply_update_locked(&mut tasks, filter, update, true))
    }

    async fn update_many(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<UpdateResult> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        Ok(Self::apply_update_locked(&mut tasks, filter, update, false))
    }

    async fn set_dependency_finished(
        &self,
        dependency_id: &TaskId,
        finished: bool,
    ) -> Result<UpdateResult> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let mut result = UpdateResult::default();
        for task in tasks.values_mut() {
            let mut touched = false;
            for dep in &mut task.depends_on {
                if &dep.task_id == dependency_id {
                    touched = true;
                    if dep.finished != finished {
                        dep.finished = finished;
                        result.modified += 1;
                    }
                }
            }
            if touched {
                result.matched += 1;
            }
        }
        Ok(result)
    }

    async fn set_dependency_unattainable(
        &self,
        task_ids: &[TaskId],
        dependency_id: &TaskId,
        unattainable: bool,
    ) -> Result<UpdateResult> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let mut result = UpdateResult::default();
        for id in task_ids {
            let Some(task) = tasks.get_mut(id) else {
                continue;
            };
            let mut touched = false;
            for dep in &mut task.depends_on {
                if &dep.task_id == dependency_id {
                    touched = true;
                    if dep.unattainable != unattainable {
                        dep.unattainable = unattainable;
                        result.modified += 1;
                    }
                }
            }
            if touched {
                result.matched += 1;
                task.recompute_unattainable_dependency();
            }
        }
        Ok(result)
    }

    async fn apply_batch(&self, writes: Vec<TaskWrite>) -> Result<()> {
        // Both locks are held for the whole batch, so the batch is atomic
        // with respect to every other store operation in this process.
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let mut old = self.old_tasks.write().map_err(poison_err)?;
        for write in writes {
            match write {
                TaskWrite::InsertOldTasks(archived) => {
                    Self::insert_old_locked(&mut old, archived);
                }
                TaskWrite::UpdateMany { filter, update } => {
                    Self::apply_update_locked(&mut tasks, &filter, &update, false);
                }
                TaskWrite::UpdateOne { filter, update } => {
                    Self::apply_update_locked(&mut tasks, &filter, &update, true);
                }
            }
        }
        Ok(())
    }

    async fn insert_old_tasks(&self, archived: Vec<Task>) -> Result<()> {
        let mut old = self.old_tasks.write().map_err(poison_err)?;
        Self::insert_old_locked(&mut old, archived);
        Ok(())
    }

    async fn get_old(&self, id: &TaskId) -> Result<Option<Task>> {
        let result = {
            let old = self.old_tasks.read().map_err(poison_err)?;
            old.get(id).cloned()
        };
        Ok(result)
    }
}
