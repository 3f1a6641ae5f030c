//! The task entity, its status machine, and pure scheduling predicates.
//!
//! This module provides:
//! - `Task`: the central record of the execution core
//! - `TaskStatus`: persisted statuses, with terminal/in-progress classification
//! - `DisplayStatus`: the user-facing status derived from a record
//! - `Dependency`: a dependency edge owned by the dependent task
//! - `EndDetail`: the agent's end-of-task report
//!
//! Every predicate here is pure: no I/O, no clock reads. Operations that
//! need "now" take it as a parameter so tests control time.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::{BuildId, DistroId, HostId, PodId, ProjectId, TaskId, VersionId};

/// Maximum number of container allocation attempts per execution.
pub const MAX_ALLOC_ATTEMPTS: u32 = 5;

/// Priority at or below which a task is disabled and never scheduled.
pub const DISABLED_PRIORITY: i64 = -1;

/// Maximum execution number a task identity may reach through resets.
pub const MAX_EXECUTION: u32 = 9;

/// End-detail description used when the heartbeat monitor ends a task.
pub const HEARTBEAT_DESCRIPTION: &str = "heartbeat";

/// Persisted task statuses.
///
/// The record moves `Undispatched -> Dispatched -> Started -> terminal`.
/// Everything a user sees beyond these (blocked, will-run, aborted, ...) is
/// derived presentation state; see [`Task::display_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet handed to an agent.
    Undispatched,
    /// Handed to an agent, awaiting the start report.
    Dispatched,
    /// The agent reported the task running.
    Started,
    /// Completed successfully.
    Succeeded,
    /// Completed with a task failure.
    Failed,
    /// Failed due to the system rather than the task's own commands.
    SystemFailed,
    /// The agent stopped heartbeating and the monitor ended the task.
    SystemUnresponsive,
    /// A system-side timeout ended the task.
    SystemTimedOut,
    /// The task exceeded its own exec timeout.
    TimedOut,
}

impl TaskStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::SystemFailed
                | Self::SystemUnresponsive
                | Self::SystemTimedOut
                | Self::TimedOut
        )
    }

    /// Returns true if the task has been handed to an agent and has not
    /// finished.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Started)
    }

    /// The set of terminal statuses, for store filters.
    #[must_use]
    pub fn terminal_statuses() -> Vec<Self> {
        vec![
            Self::Succeeded,
            Self::Failed,
            Self::SystemFailed,
            Self::SystemUnresponsive,
            Self::SystemTimedOut,
            Self::TimedOut,
        ]
    }

    /// The set of failure statuses, for store filters.
    #[must_use]
    pub fn failure_statuses() -> Vec<Self> {
        vec![
            Self::Failed,
            Self::SystemFailed,
            Self::SystemUnresponsive,
            Self::SystemTimedOut,
            Self::TimedOut,
        ]
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Undispatched => "undispatched",
            Self::Dispatched => "dispatched",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::SystemFailed => "system_failed",
            Self::SystemUnresponsive => "system_unresponsive",
            Self::SystemTimedOut => "system_timed_out",
            Self::TimedOut => "timed_out",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Undispatched
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// User-facing status derived from the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    /// Undispatched and not activated.
    Unscheduled,
    /// Undispatched, activated, and unblocked.
    WillRun,
    /// Undispatched with an unattainable dependency.
    Blocked,
    /// An abort was requested or applied.
    Aborted,
    /// A setup command failed before the task's own commands ran.
    SetupFailed,
    /// Raw status passthrough.
    Undispatched,
    /// Raw status passthrough.
    Dispatched,
    /// Raw status passthrough.
    Started,
    /// Raw status passthrough.
    Succeeded,
    /// Raw status passthrough.
    Failed,
    /// Raw status passthrough.
    SystemFailed,
    /// Raw status passthrough.
    SystemUnresponsive,
    /// Raw status passthrough.
    SystemTimedOut,
    /// Raw status passthrough.
    TimedOut,
}

/// Which component's command produced an end detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// The task's own test commands.
    Test,
    /// Setup commands that run before the task body.
    Setup,
    /// System-side work (agent internals, provisioning).
    System,
}

impl Default for CommandType {
    fn default() -> Self {
        Self::Test
    }
}

/// The agent's end-of-task report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndDetail {
    /// Terminal status the agent reports.
    pub status: TaskStatus,
    /// Which command category produced the result.
    #[serde(default)]
    pub kind: CommandType,
    /// Free-form description (e.g. the failing command name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the task hit a timeout.
    #[serde(default)]
    pub timed_out: bool,
}

impl EndDetail {
    /// A successful end report.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: TaskStatus::Succeeded,
            kind: CommandType::Test,
            description: None,
            timed_out: false,
        }
    }

    /// A task-failure end report.
    #[must_use]
    pub fn failure() -> Self {
        Self {
            status: TaskStatus::Failed,
            kind: CommandType::Test,
            description: None,
            timed_out: false,
        }
    }

    /// A system-failure end report with the given description.
    #[must_use]
    pub fn system_failure(description: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            kind: CommandType::System,
            description: Some(description.into()),
            timed_out: false,
        }
    }

    /// The end report the monitor files when a task stops heartbeating.
    #[must_use]
    pub fn heartbeat_timeout() -> Self {
        Self {
            status: TaskStatus::Failed,
            kind: CommandType::System,
            description: Some(HEARTBEAT_DESCRIPTION.to_owned()),
            timed_out: true,
        }
    }
}

/// Required upstream outcome for a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRequirement {
    /// The upstream must succeed. This is the default when unspecified.
    Succeeded,
    /// The upstream must fail.
    Failed,
    /// Any terminal outcome, including the upstream itself being blocked.
    Any,
}

impl Default for DependencyRequirement {
    fn default() -> Self {
        Self::Succeeded
    }
}

/// A dependency edge, owned by the dependent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// The upstream task this edge points at.
    pub task_id: TaskId,
    /// Required upstream outcome.
    #[serde(default)]
    pub status: DependencyRequirement,
    /// Whether the required outcome can no longer be met.
    #[serde(default)]
    pub unattainable: bool,
    /// Cached flag: the upstream has reached a terminal status.
    #[serde(default)]
    pub finished: bool,
    /// Whether tasks generated by the upstream are excluded from this edge.
    #[serde(default)]
    pub omit_generated_tasks: bool,
}

impl Dependency {
    /// Creates an edge requiring the upstream to succeed.
    #[must_use]
    pub fn on_success(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: DependencyRequirement::Succeeded,
            unattainable: false,
            finished: false,
            omit_generated_tasks: false,
        }
    }

    /// Creates an edge with an explicit requirement.
    #[must_use]
    pub fn with_requirement(task_id: TaskId, status: DependencyRequirement) -> Self {
        Self {
            task_id,
            status,
            unattainable: false,
            finished: false,
            omit_generated_tasks: false,
        }
    }
}

/// Where a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPlatform {
    /// A provisioned host from a distro.
    Host,
    /// A container pod.
    Container,
}

impl Default for ExecutionPlatform {
    fn default() -> Self {
        Self::Host
    }
}

/// What produced the version a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requester {
    /// A mainline commit.
    Mainline,
    /// A user-submitted patch.
    Patch,
    /// A pull request.
    Pr,
    /// The merge queue.
    MergeQueue,
    /// A downstream trigger from another project.
    Trigger,
}

impl Requester {
    /// Returns true for patch-shaped requesters (patch, PR, merge queue).
    #[must_use]
    pub const fn is_patch_request(&self) -> bool {
        matches!(self, Self::Patch | Self::Pr | Self::MergeQueue)
    }
}

impl Default for Requester {
    fn default() -> Self {
        Self::Mainline
    }
}

/// Resource requests for a container task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOptions {
    /// CPU units (1024 = one vCPU).
    #[serde(default)]
    pub cpu: u32,
    /// Memory in MB.
    #[serde(default)]
    pub memory_mb: u32,
    /// Container image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Working directory inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Why and by whom an abort was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortInfo {
    /// User that requested the abort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// The task whose failure triggered the abort, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl AbortInfo {
    /// An abort requested by a user.
    #[must_use]
    pub fn by_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            task_id: None,
        }
    }
}

/// TTL-cached expected-duration prediction.
///
/// Only the numeric fields persist; refreshing is pure compute at the
/// boundary against a historical-duration query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationPrediction {
    /// Predicted duration.
    #[serde(with = "humantime_serde")]
    pub value: Duration,
    /// Standard deviation of the prediction.
    #[serde(with = "humantime_serde")]
    pub std_dev: Duration,
    /// When the prediction was computed.
    pub collected_at: DateTime<Utc>,
    /// How long the prediction stays fresh.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl DurationPrediction {
    /// Returns true if the prediction has outlived its TTL at `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.collected_at);
        age > chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX)
    }
}

/// Link from an execution task to its display task.
///
/// The link is three-valued: a record written before display tasks were
/// resolved does not know whether it has a parent (`Unknown`), while a
/// resolved record caches either the parent ID or a definite `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "id")]
pub enum DisplayTaskLink {
    /// Not yet resolved; callers must look the parent up.
    #[default]
    Unknown,
    /// Resolved: this task is not part of a display task.
    None,
    /// Resolved: this task belongs to the given display task.
    Id(TaskId),
}

impl DisplayTaskLink {
    /// Returns the cached parent ID, if resolved to one.
    #[must_use]
    pub const fn id(&self) -> Option<&TaskId> {
        match self {
            Self::Id(id) => Some(id),
            Self::Unknown | Self::None => None,
        }
    }
}

/// How far a task is blocked, relative to its upstream set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedState {
    /// An edge is unattainable; the task will never run.
    Blocked,
    /// All edges are attainable but at least one upstream has not satisfied
    /// its requirement yet.
    Pending,
}

/// The central record of the execution core.
///
/// One live record exists per task identity; prior executions live in the
/// archive collection under [`TaskId::archive_id`] keys. All scheduling
/// predicates are pure methods on this struct; all persisted transitions go
/// through the lifecycle controller's guarded updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    // --- Identity ---
    /// Unique task ID (archive records carry the `"{id}_{execution}"` form).
    pub id: TaskId,
    /// Per-execution secret the agent must present.
    #[serde(default)]
    pub secret: String,
    /// Execution number, advanced on every reset.
    #[serde(default)]
    pub execution: u32,
    /// For archived records, the live ID this execution belonged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_task_id: Option<TaskId>,
    /// Whether this record lives in the archive collection.
    #[serde(default)]
    pub archived: bool,

    // --- Grouping ---
    /// The version (commit or patch) this task belongs to.
    pub version: VersionId,
    /// The build (variant within the version) this task belongs to.
    pub build_id: BuildId,
    /// Owning project.
    pub project: ProjectId,
    /// Build variant name.
    pub build_variant: String,
    /// Task display name within the variant.
    pub display_name: String,
    /// What produced the version.
    #[serde(default)]
    pub requester: Requester,

    // --- Placement ---
    /// Where the task executes.
    #[serde(default)]
    pub execution_platform: ExecutionPlatform,
    /// Primary distro for host tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<DistroId>,
    /// Alias distros that may also run this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_distros: Vec<DistroId>,
    /// Host the task is dispatched to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<HostId>,
    /// Container name for container tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Container resource options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_options: Option<ContainerOptions>,
    /// Pod the task is dispatched to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<PodId>,
    /// Agent version that picked the task up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,

    // --- Graph ---
    /// Dependency edges owned by this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,
    /// User override: ignore all dependency edges.
    #[serde(default)]
    pub override_dependencies: bool,
    /// Cached OR over `depends_on[].unattainable`.
    #[serde(default)]
    pub unattainable_dependency: bool,
    /// Number of tasks that depend on this one.
    #[serde(default)]
    pub num_dependents: u32,

    // --- Display task ---
    /// Whether this is a synthetic display task.
    #[serde(default)]
    pub display_only: bool,
    /// Execution tasks aggregated by this display task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_tasks: Vec<TaskId>,
    /// Link to the owning display task, if this is an execution task.
    #[serde(default)]
    pub display_task_link: DisplayTaskLink,
    /// Highest execution number across the display task's children.
    #[serde(default)]
    pub latest_parent_execution: u32,

    // --- Generation ---
    /// Whether this task generates more tasks at runtime.
    #[serde(default)]
    pub generate_task: bool,
    /// Idempotence flag: generation already ran for this execution.
    #[serde(default)]
    pub generated_tasks: bool,
    /// The generator task that created this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<TaskId>,
    /// Raw generated-task configuration produced by the agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_json: Vec<serde_json::Value>,
    /// Variant name -> task names to activate once generated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub generated_tasks_to_activate: BTreeMap<String, Vec<String>>,

    // --- Activation ---
    /// Whether the task may be scheduled.
    #[serde(default)]
    pub activated: bool,
    /// Who activated the task last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_by: Option<String>,
    /// When the task was last activated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_time: Option<DateTime<Utc>>,
    /// Whether the task was deactivated because an upstream was.
    #[serde(default)]
    pub deactivated_for_dependency: bool,
    /// Scheduling priority; at or below [`DISABLED_PRIORITY`] never runs.
    #[serde(default)]
    pub priority: i64,
    /// Depth of the stepback bisection that activated this task.
    #[serde(default)]
    pub stepback_depth: u32,

    // --- Container allocation ---
    /// Whether a container is currently allocated.
    #[serde(default)]
    pub container_allocated: bool,
    /// Allocation attempts this execution; bounded by [`MAX_ALLOC_ATTEMPTS`].
    #[serde(default)]
    pub container_allocation_attempts: u32,
    /// When the container was allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_allocated_time: Option<DateTime<Utc>>,

    // --- Timing ---
    /// When the commit or patch was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    /// When the ingestion layer wrote the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_time: Option<DateTime<Utc>>,
    /// When the planner first surfaced the task as schedulable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// When the task was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_time: Option<DateTime<Utc>>,
    /// When the agent reported the start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Last heartbeat received from the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    /// When the last dependency edge finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies_met_time: Option<DateTime<Utc>>,
    /// Wall-clock duration of the finished execution.
    #[serde(default, with = "humantime_serde")]
    pub time_taken: Duration,
    /// Expected duration from the prediction cache.
    #[serde(default, with = "humantime_serde")]
    pub expected_duration: Duration,
    /// Standard deviation of the expected duration.
    #[serde(default, with = "humantime_serde")]
    pub expected_duration_std_dev: Duration,
    /// TTL-cached duration prediction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_prediction: Option<DurationPrediction>,

    // --- Status ---
    /// Persisted status.
    #[serde(default)]
    pub status: TaskStatus,
    /// End-of-task report from the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<EndDetail>,
    /// Cooperative abort flag.
    #[serde(default)]
    pub aborted: bool,
    /// Abort context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_info: Option<AbortInfo>,
    /// Test-results service the agent attached results to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_service: Option<String>,
    /// Whether attached results contain failures.
    #[serde(default)]
    pub results_failed: bool,

    // --- Task group ---
    /// Task group name, if the task is part of one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_group: Option<String>,
    /// Maximum hosts a task group may spread across (1 = single-host).
    #[serde(default)]
    pub task_group_max_hosts: u32,
    /// Position within the task group.
    #[serde(default)]
    pub task_group_order: u32,

    // --- Reset ---
    /// Whether the record has been archived and may be reset.
    #[serde(default)]
    pub can_reset: bool,
    /// Restart the task automatically once it finishes.
    #[serde(default)]
    pub reset_when_finished: bool,
    /// Restart only failed execution tasks once the display task finishes.
    #[serde(default)]
    pub reset_failed_when_finished: bool,
}

impl Task {
    /// Creates an undispatched, unactivated task with the given identity.
    #[must_use]
    pub fn new(
        id: TaskId,
        version: VersionId,
        build_id: BuildId,
        project: ProjectId,
        build_variant: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            secret: String::new(),
            execution: 0,
            old_task_id: None,
            archived: false,
            version,
            build_id,
            project,
            build_variant: build_variant.into(),
            display_name: display_name.into(),
            requester: Requester::Mainline,
            execution_platform: ExecutionPlatform::Host,
            distro: None,
            secondary_distros: Vec::new(),
            host_id: None,
            container: None,
            container_options: None,
            pod_id: None,
            agent_version: None,
            depends_on: Vec::new(),
            override_dependencies: false,
            unattainable_dependency: false,
            num_dependents: 0,
            display_only: false,
            execution_tasks: Vec::new(),
            display_task_link: DisplayTaskLink::Unknown,
            latest_parent_execution: 0,
            generate_task: false,
            generated_tasks: false,
            generated_by: None,
            generated_json: Vec::new(),
            generated_tasks_to_activate: BTreeMap::new(),
            activated: false,
            activated_by: None,
            activated_time: None,
            deactivated_for_dependency: false,
            priority: 0,
            stepback_depth: 0,
            container_allocated: false,
            container_allocation_attempts: 0,
            container_allocated_time: None,
            create_time: None,
            ingest_time: None,
            scheduled_time: None,
            dispatch_time: None,
            start_time: None,
            last_heartbeat: None,
            finish_time: None,
            dependencies_met_time: None,
            time_taken: Duration::ZERO,
            expected_duration: Duration::ZERO,
            expected_duration_std_dev: Duration::ZERO,
            duration_prediction: None,
            status: TaskStatus::Undispatched,
            details: None,
            aborted: false,
            abort_info: None,
            results_service: None,
            results_failed: false,
            task_group: None,
            task_group_max_hosts: 0,
            task_group_order: 0,
            can_reset: false,
            reset_when_finished: false,
            reset_failed_when_finished: false,
        }
    }

    /// Sets the dependency edges.
    #[must_use]
    pub fn with_dependencies(mut self, depends_on: Vec<Dependency>) -> Self {
        self.depends_on = depends_on;
        self.unattainable_dependency = self.depends_on.iter().any(|d| d.unattainable);
        self
    }

    /// Sets the execution platform.
    #[must_use]
    pub fn with_platform(mut self, platform: ExecutionPlatform) -> Self {
        self.execution_platform = platform;
        self
    }

    /// Activates the task in-memory (for construction and tests).
    #[must_use]
    pub fn with_activated(mut self, activated_time: DateTime<Utc>) -> Self {
        self.activated = true;
        self.activated_time = Some(activated_time);
        self
    }

    /// Sets the primary distro.
    #[must_use]
    pub fn with_distro(mut self, distro: DistroId) -> Self {
        self.distro = Some(distro);
        self
    }

    // --- Pure predicates ---

    /// Returns true if an unattainable edge blocks the task, unless
    /// dependencies are overridden.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        if self.override_dependencies {
            return false;
        }
        self.depends_on.iter().any(|d| d.unattainable)
    }

    /// Returns true if the task will run eventually but has not started yet.
    #[must_use]
    pub fn will_run(&self) -> bool {
        self.status == TaskStatus::Undispatched && self.activated && !self.is_blocked()
    }

    /// Returns true if the task is undispatched and not activated.
    #[must_use]
    pub fn is_unscheduled(&self) -> bool {
        self.status == TaskStatus::Undispatched && !self.activated
    }

    /// Returns true if the task reached a terminal status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if an abort request can reach this task.
    #[must_use]
    pub fn is_abortable(&self) -> bool {
        self.status.is_in_progress()
    }

    /// Returns true if the task is dispatched or running.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.status.is_in_progress()
    }

    /// Returns true for tasks that run on hosts. Display tasks never run
    /// anywhere.
    #[must_use]
    pub fn is_host_task(&self) -> bool {
        self.execution_platform == ExecutionPlatform::Host && !self.display_only
    }

    /// Returns true for tasks that run in containers.
    #[must_use]
    pub fn is_container_task(&self) -> bool {
        self.execution_platform == ExecutionPlatform::Container
    }

    /// Returns true if the task should make progress towards dispatch.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.is_host_dispatchable()
            || self.should_allocate_container()
            || self.is_container_dispatchable()
    }

    /// Returns true if the task runs on a host and can be dispatched.
    #[must_use]
    pub fn is_host_dispatchable(&self) -> bool {
        self.is_host_task() && self.will_run()
    }

    /// Number of container allocation attempts left this execution.
    #[must_use]
    pub fn remaining_container_allocation_attempts(&self) -> u32 {
        MAX_ALLOC_ATTEMPTS.saturating_sub(self.container_allocation_attempts)
    }

    /// Returns true if the task should be allocated a container.
    #[must_use]
    pub fn should_allocate_container(&self) -> bool {
        if self.container_allocated {
            return false;
        }
        if self.remaining_container_allocation_attempts() == 0 {
            return false;
        }
        self.is_container_scheduled()
    }

    /// Returns true if the task has a container allocated and can be
    /// dispatched to a pod.
    #[must_use]
    pub fn is_container_dispatchable(&self) -> bool {
        if !self.container_allocated {
            return false;
        }
        self.is_container_scheduled()
    }

    /// Returns whether a container task is in a state where it should
    /// eventually dispatch. Unlike host tasks, a container task is not
    /// scheduled until every dependency edge has finished.
    #[must_use]
    pub fn is_container_scheduled(&self) -> bool {
        if !self.is_container_task() {
            return false;
        }
        if self.status != TaskStatus::Undispatched {
            return false;
        }
        if !self.activated {
            return false;
        }
        if self.priority <= DISABLED_PRIORITY {
            return false;
        }
        if !self.override_dependencies {
            for dep in &self.depends_on {
                if dep.unattainable || !dep.finished {
                    return false;
                }
            }
        }
        true
    }

    /// Checks whether an upstream task's status satisfies this task's edge
    /// pointing at it. Returns false if no edge points at the upstream.
    #[must_use]
    pub fn satisfies_dependency(&self, upstream: &Task) -> bool {
        for dep in &self.depends_on {
            if dep.task_id == upstream.id {
                return match dep.status {
                    DependencyRequirement::Succeeded => upstream.status == TaskStatus::Succeeded,
                    DependencyRequirement::Failed => upstream.status == TaskStatus::Failed,
                    DependencyRequirement::Any => {
                        upstream.status == TaskStatus::Succeeded
                            || upstream.status == TaskStatus::Failed
                            || upstream.is_blocked()
                    }
                };
            }
        }
        false
    }

    /// Returns true if every dependency edge is satisfied by the tasks in
    /// `upstream`. Edges whose upstream is missing from the map count as
    /// unsatisfied.
    #[must_use]
    pub fn all_dependencies_satisfied(&self, upstream: &HashMap<TaskId, Task>) -> bool {
        if self.override_dependencies {
            return true;
        }
        self.depends_on.iter().all(|dep| {
            upstream
                .get(&dep.task_id)
                .is_some_and(|up| self.satisfies_dependency(up))
        })
    }

    /// Classifies the task against its upstream set: blocked, pending, or
    /// neither (`None` = all requirements satisfied). Upstream tasks missing
    /// from the map are ignored.
    #[must_use]
    pub fn blocked_state(&self, upstream: &HashMap<TaskId, Task>) -> Option<BlockedState> {
        if self.is_blocked() {
            return Some(BlockedState::Blocked);
        }
        for dep in &self.depends_on {
            let Some(up) = upstream.get(&dep.task_id) else {
                continue;
            };
            if !self.satisfies_dependency(up) {
                return Some(BlockedState::Pending);
            }
        }
        None
    }

    /// Returns true if the monitor ended this task for a missed heartbeat,
    /// whether recorded as a status or only in the end details.
    #[must_use]
    pub fn is_system_unresponsive(&self) -> bool {
        if self.status == TaskStatus::SystemUnresponsive {
            return true;
        }
        self.details.as_ref().is_some_and(|d| {
            d.kind == CommandType::System
                && d.timed_out
                && d.description.as_deref() == Some(HEARTBEAT_DESCRIPTION)
        })
    }

    /// Returns true if the task belongs to a task group pinned to one host.
    #[must_use]
    pub fn is_part_of_single_host_task_group(&self) -> bool {
        self.task_group.is_some() && self.task_group_max_hosts == 1
    }

    /// Returns true if the agent has attached test results.
    #[must_use]
    pub fn has_results(&self) -> bool {
        self.results_service.is_some()
    }

    /// Returns true if a finished display task should restart only its
    /// failed execution tasks.
    #[must_use]
    pub fn is_restart_failed_only(&self) -> bool {
        self.reset_failed_when_finished && !self.reset_when_finished
    }

    /// Derives the user-facing status.
    ///
    /// Priority: aborted, succeeded, setup failure, system failures (with
    /// heartbeat and timeout refinements), plain timeout, then the
    /// undispatched refinements (unscheduled / blocked / will-run), and
    /// finally the raw status.
    #[must_use]
    pub fn display_status(&self) -> DisplayStatus {
        if self.aborted {
            return DisplayStatus::Aborted;
        }
        if self.status == TaskStatus::Succeeded {
            return DisplayStatus::Succeeded;
        }
        if let Some(details) = &self.details {
            match details.kind {
                CommandType::Setup => return DisplayStatus::SetupFailed,
                CommandType::System => {
                    if details.timed_out {
                        if details.description.as_deref() == Some(HEARTBEAT_DESCRIPTION) {
                            return DisplayStatus::SystemUnresponsive;
                        }
                        return DisplayStatus::SystemTimedOut;
                    }
                    return DisplayStatus::SystemFailed;
                }
                CommandType::Test => {
                    if details.timed_out {
                        return DisplayStatus::TimedOut;
                    }
                }
            }
        }
        if self.status == TaskStatus::Undispatched {
            if !self.activated {
                return DisplayStatus::Unscheduled;
            }
            if self.is_blocked() {
                return DisplayStatus::Blocked;
            }
            return DisplayStatus::WillRun;
        }
        match self.status {
            TaskStatus::Dispatched => DisplayStatus::Dispatched,
            TaskStatus::Started => DisplayStatus::Started,
            TaskStatus::Failed => DisplayStatus::Failed,
            TaskStatus::SystemFailed => DisplayStatus::SystemFailed,
            TaskStatus::SystemUnresponsive => DisplayStatus::SystemUnresponsive,
            TaskStatus::SystemTimedOut => DisplayStatus::SystemTimedOut,
            TaskStatus::TimedOut => DisplayStatus::TimedOut,
            TaskStatus::Undispatched | TaskStatus::Succeeded => DisplayStatus::Undispatched,
        }
    }

    // --- Edge management ---

    /// Adds a dependency edge.
    ///
    /// Adding an edge identical to an existing one is a no-op. Adding an edge
    /// to the same upstream with a different requirement is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::InvariantBreach`] on a conflicting
    /// requirement for an existing upstream.
    pub fn add_dependency(&mut self, dep: Dependency) -> crate::error::Result<()> {
        for existing in &self.depends_on {
            if existing.task_id == dep.task_id {
                if existing.status == dep.status {
                    return Ok(());
                }
                return Err(crate::error::Error::invariant(format!(
                    "task '{}' already depends on '{}' with requirement {:?}",
                    self.id, dep.task_id, existing.status
                )));
            }
        }
        if dep.unattainable {
            self.unattainable_dependency = true;
        }
        self.depends_on.push(dep);
        Ok(())
    }

    /// Removes the edge pointing at `dependency_id`, if present, and
    /// recomputes the unattainable cache.
    pub fn remove_dependency(&mut self, dependency_id: &TaskId) {
        self.depends_on.retain(|d| &d.task_id != dependency_id);
        self.recompute_unattainable_dependency();
    }

    /// Recomputes `unattainable_dependency` from the edges.
    pub fn recompute_unattainable_dependency(&mut self) {
        self.unattainable_dependency = self.depends_on.iter().any(|d| d.unattainable);
    }

    // --- Archive support ---

    /// Builds the archived copy of this execution: the ID is rewritten to
    /// the archive form and the live ID is preserved in `old_task_id`.
    #[must_use]
    pub fn make_archived_task(&self) -> Task {
        let mut archived = self.clone();
        archived.id = self.id.archive_id(self.execution);
        archived.old_task_id = Some(self.id.clone());
        archived.archived = true;
        archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task(id: &str) -> Task {
        Task::new(
            TaskId::new(id),
            VersionId::new("v1"),
            BuildId::new("b1"),
            ProjectId::new("proj"),
            "ubuntu2204",
            "compile",
        )
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::SystemUnresponsive.is_terminal());
        assert!(!TaskStatus::Undispatched.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
    }

    #[test]
    fn blocked_requires_unattainable_edge() {
        let mut task = test_task("t1");
        assert!(!task.is_blocked());

        task.depends_on.push(Dependency::on_success(TaskId::new("up")));
        assert!(!task.is_blocked());

        task.depends_on[0].unattainable = true;
        assert!(task.is_blocked());
    }

    #[test]
    fn override_dependencies_unblocks() {
        let mut task = test_task("t1");
        task.depends_on.push(Dependency {
            unattainable: true,
            ..Dependency::on_success(TaskId::new("up"))
        });
        assert!(task.is_blocked());

        task.override_dependencies = true;
        assert!(!task.is_blocked());
    }

    #[test]
    fn will_run_needs_activation_and_no_block() {
        let mut task = test_task("t1");
        assert!(!task.will_run());

        task.activated = true;
        assert!(task.will_run());

        task.depends_on.push(Dependency {
            unattainable: true,
            ..Dependency::on_success(TaskId::new("up"))
        });
        assert!(!task.will_run());

        task.depends_on[0].unattainable = false;
        task.status = TaskStatus::Dispatched;
        assert!(!task.will_run());
    }

    #[test]
    fn display_tasks_are_not_host_dispatchable() {
        let mut task = test_task("dt");
        task.activated = true;
        task.display_only = true;
        assert!(!task.is_host_task());
        assert!(!task.is_host_dispatchable());
    }

    #[test]
    fn container_scheduled_requires_finished_dependencies() {
        let mut task = test_task("ct");
        task.execution_platform = ExecutionPlatform::Container;
        task.activated = true;
        assert!(task.is_container_scheduled());

        task.depends_on.push(Dependency::on_success(TaskId::new("up")));
        assert!(!task.is_container_scheduled());

        task.depends_on[0].finished = true;
        assert!(task.is_container_scheduled());

        task.depends_on[0].unattainable = true;
        assert!(!task.is_container_scheduled());

        task.override_dependencies = true;
        assert!(task.is_container_scheduled());
    }

    #[test]
    fn container_scheduled_respects_disabled_priority() {
        let mut task = test_task("ct");
        task.execution_platform = ExecutionPlatform::Container;
        task.activated = true;
        task.priority = DISABLED_PRIORITY;
        assert!(!task.is_container_scheduled());
    }

    #[test]
    fn should_allocate_container_bounds_attempts() {
        let mut task = test_task("ct");
        task.execution_platform = ExecutionPlatform::Container;
        task.activated = true;
        assert!(task.should_allocate_container());

        task.container_allocation_attempts = MAX_ALLOC_ATTEMPTS;
        assert_eq!(task.remaining_container_allocation_attempts(), 0);
        assert!(!task.should_allocate_container());

        task.container_allocation_attempts = MAX_ALLOC_ATTEMPTS - 1;
        assert!(task.should_allocate_container());

        task.container_allocated = true;
        assert!(!task.should_allocate_container());
        assert!(task.is_container_dispatchable());
    }

    #[test]
    fn satisfies_dependency_by_requirement() {
        let mut downstream = test_task("down");
        let mut up = test_task("up");

        downstream
            .depends_on
            .push(Dependency::on_success(up.id.clone()));

        up.status = TaskStatus::Succeeded;
        assert!(downstream.satisfies_dependency(&up));
        up.status = TaskStatus::Failed;
        assert!(!downstream.satisfies_dependency(&up));

        downstream.depends_on[0].status = DependencyRequirement::Failed;
        assert!(downstream.satisfies_dependency(&up));
        up.status = TaskStatus::Succeeded;
        assert!(!downstream.satisfies_dependency(&up));

        downstream.depends_on[0].status = DependencyRequirement::Any;
        assert!(downstream.satisfies_dependency(&up));
        up.status = TaskStatus::Failed;
        assert!(downstream.satisfies_dependency(&up));

        // "any" is also satisfied by a blocked upstream.
        up.status = TaskStatus::Undispatched;
        up.depends_on.push(Dependency {
            unattainable: true,
            ..Dependency::on_success(TaskId::new("upstream-of-up"))
        });
        assert!(downstream.satisfies_dependency(&up));
    }

    #[test]
    fn satisfies_dependency_without_edge_is_false() {
        let downstream = test_task("down");
        let up = test_task("up");
        assert!(!downstream.satisfies_dependency(&up));
    }

    #[test]
    fn display_status_derivation_order() {
        let mut task = test_task("t");

        // Unscheduled before anything else happens.
        assert_eq!(task.display_status(), DisplayStatus::Unscheduled);

        task.activated = true;
        assert_eq!(task.display_status(), DisplayStatus::WillRun);

        task.depends_on.push(Dependency {
            unattainable: true,
            ..Dependency::on_success(TaskId::new("up"))
        });
        assert_eq!(task.display_status(), DisplayStatus::Blocked);

        task.aborted = true;
        assert_eq!(task.display_status(), DisplayStatus::Aborted);
        task.aborted = false;

        task.depends_on.clear();
        task.status = TaskStatus::Failed;
        task.details = Some(EndDetail {
            status: TaskStatus::Failed,
            kind: CommandType::Setup,
            description: None,
            timed_out: false,
        });
        assert_eq!(task.display_status(), DisplayStatus::SetupFailed);

        task.details = Some(EndDetail::heartbeat_timeout());
        assert_eq!(task.display_status(), DisplayStatus::SystemUnresponsive);

        task.details = Some(EndDetail {
            status: TaskStatus::Failed,
            kind: CommandType::System,
            description: None,
            timed_out: true,
        });
        assert_eq!(task.display_status(), DisplayStatus::SystemTimedOut);

        task.details = Some(EndDetail::system_failure("host teardown"));
        assert_eq!(task.display_status(), DisplayStatus::SystemFailed);

        task.details = Some(EndDetail {
            status: TaskStatus::Failed,
            kind: CommandType::Test,
            description: None,
            timed_out: true,
        });
        assert_eq!(task.display_status(), DisplayStatus::TimedOut);

        task.details = Some(EndDetail::failure());
        assert_eq!(task.display_status(), DisplayStatus::Failed);

        task.status = TaskStatus::Succeeded;
        assert_eq!(task.display_status(), DisplayStatus::Succeeded);
    }

    #[test]
    fn system_unresponsive_detected_from_details() {
        let mut task = test_task("t");
        task.status = TaskStatus::Failed;
        task.details = Some(EndDetail::heartbeat_timeout());
        assert!(task.is_system_unresponsive());

        task.details = Some(EndDetail::system_failure("other"));
        assert!(!task.is_system_unresponsive());

        task.details = None;
        task.status = TaskStatus::SystemUnresponsive;
        assert!(task.is_system_unresponsive());
    }

    #[test]
    fn add_dependency_dedupes_and_rejects_conflicts() {
        let mut task = test_task("t");
        let dep = Dependency::on_success(TaskId::new("up"));
        task.add_dependency(dep.clone()).unwrap();
        task.add_dependency(dep).unwrap();
        assert_eq!(task.depends_on.len(), 1);

        let conflicting =
            Dependency::with_requirement(TaskId::new("up"), DependencyRequirement::Failed);
        assert!(task.add_dependency(conflicting).is_err());
        assert_eq!(task.depends_on.len(), 1);
    }

    #[test]
    fn remove_dependency_recomputes_cache() {
        let mut task = test_task("t");
        task.add_dependency(Dependency {
            unattainable: true,
            ..Dependency::on_success(TaskId::new("up"))
        })
        .unwrap();
        assert!(task.unattainable_dependency);

        task.remove_dependency(&TaskId::new("up"));
        assert!(task.depends_on.is_empty());
        assert!(!task.unattainable_dependency);
    }

    #[test]
    fn archived_task_rewrites_id() {
        let mut task = test_task("t1");
        task.execution = 3;
        task.status = TaskStatus::Succeeded;

        let archived = task.make_archived_task();
        assert_eq!(archived.id.as_str(), "t1_3");
        assert_eq!(archived.old_task_id, Some(task.id.clone()));
        assert!(archived.archived);
        // The live record is untouched.
        assert!(!task.archived);
    }

    #[test]
    fn single_host_task_group_detection() {
        let mut task = test_task("t");
        assert!(!task.is_part_of_single_host_task_group());

        task.task_group = Some("lint_group".into());
        task.task_group_max_hosts = 2;
        assert!(!task.is_part_of_single_host_task_group());

        task.task_group_max_hosts = 1;
        assert!(task.is_part_of_single_host_task_group());
    }

    #[test]
    fn duration_prediction_staleness() {
        let now = Utc::now();
        let prediction = DurationPrediction {
            value: Duration::from_secs(600),
            std_dev: Duration::from_secs(60),
            collected_at: now,
            ttl: Duration::from_secs(3600),
        };
        assert!(!prediction.is_stale(now));
        assert!(!prediction.is_stale(now + chrono::Duration::minutes(59)));
        assert!(prediction.is_stale(now + chrono::Duration::minutes(61)));
    }

    #[test]
    fn blocked_state_classification() {
        let mut down = test_task("down");
        let mut up = test_task("up");
        down.depends_on.push(Dependency::on_success(up.id.clone()));

        let mut cache = HashMap::new();
        cache.insert(up.id.clone(), up.clone());
        assert_eq!(down.blocked_state(&cache), Some(BlockedState::Pending));

        up.status = TaskStatus::Succeeded;
        cache.insert(up.id.clone(), up);
        assert_eq!(down.blocked_state(&cache), None);

        down.depends_on[0].unattainable = true;
        assert_eq!(down.blocked_state(&cache), Some(BlockedState::Blocked));
    }

    #[test]
    fn task_serde_roundtrip() {
        let mut task = test_task("t");
        task.depends_on.push(Dependency::on_success(TaskId::new("up")));
        task.time_taken = Duration::from_secs(90);
        task.display_task_link = DisplayTaskLink::Id(TaskId::new("dt"));

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn display_task_link_defaults_to_unknown() {
        assert_eq!(DisplayTaskLink::default(), DisplayTaskLink::Unknown);
        assert_eq!(DisplayTaskLink::Id(TaskId::new("dt")).id().map(TaskId::as_str), Some("dt"));
        assert_eq!(DisplayTaskLink::None.id(), None);
    }
}
