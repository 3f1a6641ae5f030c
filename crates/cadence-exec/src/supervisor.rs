//! The dispatch supervisor: heartbeat supervision and cooperative abort.
//!
//! Two halves cooperate here:
//!
//! - [`DispatchSupervisor`] is the control-plane side. It answers heartbeat
//!   RPCs (refreshing `last_heartbeat` and telling the agent whether to keep
//!   going), and runs the monitor path that declares silent tasks
//!   system-unresponsive.
//! - [`HeartbeatLoop`] is the supervision loop run next to an executing
//!   task. It ticks on a fixed interval, reports each heartbeat through a
//!   transport, and signals abort through a watch channel when the control
//!   plane asks for it or the transport fails too many times in a row.
//!
//! Abort is cooperative throughout: the loop signals the executor and
//! **keeps heartbeating** until the end-of-task report lands. An executor
//! that never reports is eventually caught by the monitor path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::watch;

use cadence_core::TaskId;

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleController;
use crate::metrics::{labels, names};
use crate::services::CoreServices;
use crate::store::{TaskFilter, TaskQuery, TaskStore};
use crate::task::{EndDetail, Task, TaskStatus};

/// What a single heartbeat report came back with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Keep running.
    Ok,
    /// An abort was requested; stop the current command and report end.
    Abort,
    /// The task was restarted under a new execution; this run is orphaned.
    Conflict,
    /// The control plane could not be reached or rejected the report.
    Error,
}

impl HeartbeatOutcome {
    const fn as_label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Abort => "abort",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

/// Delivery of heartbeat reports from the supervision loop to the control
/// plane (an RPC client in production, a scripted fake in tests).
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    /// Reports one heartbeat for the task.
    async fn heartbeat(&self, task_id: &TaskId) -> HeartbeatOutcome;
}

/// Timing knobs for heartbeat supervision.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// How often the loop reports a heartbeat.
    pub interval: Duration,
    /// Consecutive transport errors tolerated before behaving as an abort.
    pub max_failed_heartbeats: u32,
    /// Silence window after which the monitor declares a task unresponsive.
    pub unresponsive_threshold: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_failed_heartbeats: 10,
            unresponsive_threshold: Duration::from_secs(7 * 60),
        }
    }
}

/// Control-plane side of dispatch supervision.
pub struct DispatchSupervisor {
    store: Arc<dyn TaskStore>,
    lifecycle: LifecycleController,
    services: CoreServices,
    config: HeartbeatConfig,
}

impl DispatchSupervisor {
    /// Creates a supervisor over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, services: CoreServices, config: HeartbeatConfig) -> Self {
        let lifecycle = LifecycleController::new(store.clone(), services.clone());
        Self {
            store,
            lifecycle,
            services,
            config,
        }
    }

    /// Answers an agent heartbeat: refreshes `last_heartbeat` and tells the
    /// agent whether to keep going.
    ///
    /// A stale secret means the task was archived and reset under the agent;
    /// the report is answered with [`HeartbeatOutcome::Conflict`] and the
    /// record is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task.
    #[tracing::instrument(skip(self, secret), fields(task_id = %task_id))]
    pub async fn respond_to_heartbeat(
        &self,
        task_id: &TaskId,
        secret: &str,
    ) -> Result<HeartbeatOutcome> {
        let Some(task) = self.store.get(task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: task_id.clone(),
            });
        };

        let outcome = if task.secret != secret {
            HeartbeatOutcome::Conflict
        } else {
            self.lifecycle
                .update_heartbeat(task_id, self.services.now())
                .await?;
            if task.aborted {
                HeartbeatOutcome::Abort
            } else {
                HeartbeatOutcome::Ok
            }
        };
        counter!(names::HEARTBEATS_TOTAL, labels::OUTCOME => outcome.as_label()).increment(1);
        Ok(outcome)
    }

    /// Answers an agent start report: the dispatched-to-started transition,
    /// gated on the per-execution secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task and
    /// [`Error::PreconditionFailed`] on a secret mismatch or a task that is
    /// not dispatched.
    pub async fn respond_to_start(&self, task_id: &TaskId, secret: &str) -> Result<()> {
        let Some(task) = self.store.get(task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: task_id.clone(),
            });
        };
        if task.secret != secret {
            return Err(Error::PreconditionFailed {
                task_id: task_id.clone(),
                detail: "task secret does not match this execution".into(),
            });
        }
        let result = self
            .lifecycle
            .mark_start(&task, self.services.now())
            .await?;
        if result.is_zero_match() {
            return Err(Error::PreconditionFailed {
                task_id: task_id.clone(),
                detail: format!("cannot start task in status '{}'", task.status),
            });
        }
        Ok(())
    }

    /// Answers an agent end report: the terminal transition plus dependency
    /// cascades.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown task and
    /// [`Error::PreconditionFailed`] for a task that is not in progress.
    pub async fn respond_to_end(
        &self,
        task_id: &TaskId,
        detail: Option<EndDetail>,
    ) -> Result<Task> {
        let Some(task) = self.store.get(task_id).await? else {
            return Err(Error::TaskNotFound {
                task_id: task_id.clone(),
            });
        };
        let result = self
            .lifecycle
            .mark_end(&task, self.services.now(), detail)
            .await?;
        if result.is_zero_match() {
            return Err(Error::PreconditionFailed {
                task_id: task_id.clone(),
                detail: format!("cannot end task in status '{}'", task.status),
            });
        }
        self.store.get(task_id).await?.ok_or(Error::TaskNotFound {
            task_id: task_id.clone(),
        })
    }

    /// Finds in-progress tasks whose heartbeat has been silent past the
    /// unresponsive threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn find_unresponsive_tasks(&self) -> Result<Vec<Task>> {
        let cutoff = self.services.now()
            - chrono::Duration::from_std(self.config.unresponsive_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(7));
        self.store
            .find(&TaskQuery::filtered(TaskFilter {
                status_in: Some(vec![TaskStatus::Dispatched, TaskStatus::Started]),
                last_heartbeat_lte: Some(cutoff),
                ..TaskFilter::default()
            }))
            .await
    }

    /// Monitor path: ends every unresponsive task with the heartbeat-timeout
    /// system detail. Returns how many were ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    #[tracing::instrument(skip(self))]
    pub async fn mark_unresponsive_tasks(&self) -> Result<u64> {
        let silent = self.find_unresponsive_tasks().await?;
        let mut ended = 0;
        for task in silent {
            let result = self
                .lifecycle
                .mark_end(
                    &task,
                    self.services.now(),
                    Some(EndDetail::heartbeat_timeout()),
                )
                .await?;
            if !result.is_zero_match() {
                ended += 1;
                counter!(names::UNRESPONSIVE_TOTAL).increment(1);
                tracing::warn!(task_id = %task.id, "task declared system-unresponsive");
            }
        }
        Ok(ended)
    }
}

/// The per-task supervision loop run alongside an executing task.
pub struct HeartbeatLoop {
    transport: Arc<dyn HeartbeatTransport>,
    config: HeartbeatConfig,
}

impl HeartbeatLoop {
    /// Creates a loop reporting through the given transport.
    #[must_use]
    pub fn new(transport: Arc<dyn HeartbeatTransport>, config: HeartbeatConfig) -> Self {
        Self { transport, config }
    }

    /// Supervises one task until `shutdown` flips (the end-of-task report
    /// landed).
    ///
    /// Abort and conflict responses cancel `abort_handle` so the executor
    /// stops its current command, but the loop keeps heartbeating: the
    /// control plane needs liveness until the end report arrives.
    /// Consecutive transport errors reaching the configured maximum behave
    /// as an abort.
    #[tracing::instrument(skip(self, abort_handle, shutdown), fields(task_id = %task_id))]
    pub async fn run(
        &self,
        task_id: TaskId,
        abort_handle: watch::Sender<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut consecutive_failures: u32 = 0;
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match self.transport.heartbeat(&task_id).await {
                        HeartbeatOutcome::Ok => {
                            consecutive_failures = 0;
                        }
                        HeartbeatOutcome::Abort | HeartbeatOutcome::Conflict => {
                            signal_abort(&abort_handle, &task_id);
                        }
                        HeartbeatOutcome::Error => {
                            consecutive_failures += 1;
                            if consecutive_failures >= self.config.max_failed_heartbeats {
                                tracing::warn!(
                                    task_id = %task_id,
                                    failures = consecutive_failures,
                                    "max consecutive failed heartbeats reached, signalling abort"
                                );
                                signal_abort(&abort_handle, &task_id);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn signal_abort(abort_handle: &watch::Sender<bool>, task_id: &TaskId) {
    if !*abort_handle.borrow() {
        tracing::info!(task_id = %task_id, "signalling cooperative abort to executor");
    }
    // Send only fails when the executor is gone, which is fine: the monitor
    // path covers an executor that never reports.
    let _ = abort_handle.send(true);
}
