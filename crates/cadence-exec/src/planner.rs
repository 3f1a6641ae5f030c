//! The query planner: schedulable-task selection for the external allocator.
//!
//! The planner composes the dispatchable predicate as indexed store queries,
//! expands logical distro IDs through the distro collaborator, and runs the
//! staleness sweep that disables tasks stuck underwater for too long.
//!
//! The planner only *selects*; assignment of tasks to hosts and pods is the
//! allocator's job, and the resulting transitions go through the lifecycle
//! controller's guarded updates.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use metrics::counter;

use cadence_core::{DistroId, TaskId};

use crate::dependency::DependencyEngine;
use crate::error::Result;
use crate::metrics::names;
use crate::services::CoreServices;
use crate::store::{IndexHint, TaskFilter, TaskQuery, TaskStore, TaskUpdate};
use crate::task::{ExecutionPlatform, Task, TaskStatus, DISABLED_PRIORITY, MAX_ALLOC_ATTEMPTS};

/// Threshold after which a task still waiting to dispatch is considered
/// stale and unscheduled by the sweep.
pub const UNSCHEDULABLE_THRESHOLD: Duration = Duration::days(7);

/// Expands a logical distro ID into the concrete distro IDs it covers.
///
/// Supplied by the external distro service; single-distro deployments can
/// use [`IdentityDistroResolver`].
pub trait DistroResolver: Send + Sync {
    /// Returns the concrete distro IDs for a logical ID.
    fn expand(&self, distro: &DistroId) -> Vec<DistroId>;
}

/// Resolver that treats every distro ID as already concrete.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDistroResolver;

impl DistroResolver for IdentityDistroResolver {
    fn expand(&self, distro: &DistroId) -> Vec<DistroId> {
        vec![distro.clone()]
    }
}

/// Schedulable-task selection over the store.
pub struct QueryPlanner {
    store: Arc<dyn TaskStore>,
    services: CoreServices,
    engine: DependencyEngine,
    resolver: Arc<dyn DistroResolver>,
}

impl QueryPlanner {
    /// Creates a planner over the given store and distro resolver.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        services: CoreServices,
        resolver: Arc<dyn DistroResolver>,
    ) -> Self {
        let engine = DependencyEngine::new(store.clone(), services.clone());
        Self {
            store,
            services,
            engine,
            resolver,
        }
    }

    /// The schedulable-host predicate as a reusable filter, before any
    /// distro scoping: undispatched, activated, enabled priority, no
    /// override, no unattainable dependency, host platform.
    #[must_use]
    pub fn schedulable_host_tasks_filter() -> TaskFilter {
        TaskFilter {
            status_in: Some(vec![TaskStatus::Undispatched]),
            activated: Some(true),
            priority_gt: Some(DISABLED_PRIORITY),
            override_dependencies: Some(false),
            unattainable_dependency: Some(false),
            execution_platform: Some(ExecutionPlatform::Host),
            ..TaskFilter::default()
        }
    }

    /// Finds host tasks dispatchable on the given logical distro (primary
    /// assignment form). Tasks whose dependencies are not yet satisfied are
    /// filtered out.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self), fields(distro = %distro))]
    pub async fn find_host_schedulable(&self, distro: &DistroId) -> Result<Vec<Task>> {
        let mut candidates = Vec::new();
        for concrete in self.resolver.expand(distro) {
            let mut filter = Self::schedulable_host_tasks_filter();
            filter.distro = Some(concrete);
            let found = self
                .store
                .find(&TaskQuery {
                    filter,
                    hint: Some(IndexHint::ActivatedTasksByDistro),
                    ..TaskQuery::default()
                })
                .await?;
            candidates.extend(found);
        }
        self.retain_dependencies_met(candidates).await
    }

    /// Finds host tasks dispatchable on the given distro as an alias
    /// (secondary) assignment. Single-host task groups are excluded: they
    /// would race their group order across hosts.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self), fields(distro = %distro))]
    pub async fn find_host_schedulable_for_alias(&self, distro: &DistroId) -> Result<Vec<Task>> {
        let mut candidates = Vec::new();
        for concrete in self.resolver.expand(distro) {
            let mut filter = Self::schedulable_host_tasks_filter();
            filter.distro_or_secondary = Some(concrete);
            filter.exclude_single_host_task_groups = true;
            let found = self
                .store
                .find(&TaskQuery {
                    filter,
                    hint: Some(IndexHint::ActivatedTasksByDistro),
                    ..TaskQuery::default()
                })
                .await?;
            candidates.extend(found);
        }
        self.retain_dependencies_met(candidates).await
    }

    /// Finds container tasks that need progress from the allocator: either
    /// a container allocation (bounded by the attempt counter) or a pod
    /// dispatch for an already-allocated container.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self))]
    pub async fn find_container_schedulable(&self) -> Result<Vec<Task>> {
        let base = TaskFilter {
            status_in: Some(vec![TaskStatus::Undispatched]),
            activated: Some(true),
            priority_gt: Some(DISABLED_PRIORITY),
            execution_platform: Some(ExecutionPlatform::Container),
            dependencies_ready: Some(true),
            ..TaskFilter::default()
        };

        let needs_allocation = TaskFilter {
            container_allocated: Some(false),
            allocation_attempts_lt: Some(MAX_ALLOC_ATTEMPTS),
            ..base.clone()
        };
        let needs_dispatch = TaskFilter {
            container_allocated: Some(true),
            pod_unset: Some(true),
            ..base
        };

        let mut result = self
            .store
            .find(&TaskQuery::filtered(needs_allocation))
            .await?;
        let mut seen: std::collections::HashSet<TaskId> =
            result.iter().map(|t| t.id.clone()).collect();
        for task in self
            .store
            .find(&TaskQuery::filtered(needs_dispatch))
            .await?
        {
            if seen.insert(task.id.clone()) {
                result.push(task);
            }
        }
        Ok(result)
    }

    /// Staleness sweep: disables host tasks that have sat schedulable for
    /// longer than [`UNSCHEDULABLE_THRESHOLD`], forcing the distro index so
    /// the sweep stays cheap on large task collections. Returns how many
    /// tasks were unscheduled.
    ///
    /// The sweep is idempotent: unscheduled tasks fail the `activated`
    /// condition on the next pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self), fields(distro = ?distro))]
    pub async fn unschedule_stale_underwater_host_tasks(
        &self,
        distro: Option<&DistroId>,
    ) -> Result<u64> {
        let cutoff = self.services.now() - UNSCHEDULABLE_THRESHOLD;

        let mut stale_ids: Vec<TaskId> = Vec::new();
        let concrete: Vec<Option<DistroId>> = match distro {
            Some(d) => self.resolver.expand(d).into_iter().map(Some).collect(),
            None => vec![None],
        };
        for concrete_distro in concrete {
            let mut filter = Self::schedulable_host_tasks_filter();
            filter.activated_time_lte = Some(cutoff);
            filter.distro_or_secondary = concrete_distro;
            let found = self
                .store
                .find(&TaskQuery {
                    filter,
                    hint: Some(IndexHint::ActivatedTasksByDistro),
                    ..TaskQuery::default()
                })
                .await?;
            stale_ids.extend(found.into_iter().map(|t| t.id));
        }
        if stale_ids.is_empty() {
            return Ok(0);
        }

        // The update restates the staleness condition so a task activated
        // again between the read and the write is left alone.
        let result = self
            .store
            .update_many(
                &TaskFilter {
                    ids: Some(stale_ids),
                    activated: Some(true),
                    activated_time_lte: Some(cutoff),
                    ..TaskFilter::default()
                },
                &TaskUpdate {
                    set_priority: Some(DISABLED_PRIORITY),
                    set_activated: Some(false),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        counter!(names::STALE_UNSCHEDULED_TOTAL).increment(result.modified);
        Ok(result.modified)
    }

    async fn retain_dependencies_met(&self, candidates: Vec<Task>) -> Result<Vec<Task>> {
        let mut cache: HashMap<TaskId, Task> = HashMap::new();
        let mut result = Vec::with_capacity(candidates.len());
        for task in candidates {
            if self.engine.dependencies_met(&task, &mut cache).await? {
                result.push(task);
            }
        }
        Ok(result)
    }
}
