//! Observability metrics for the execution core.
//!
//! Metrics are exposed via the `metrics` crate facade; deployments install
//! their own recorder (e.g. a Prometheus exporter). Supported concerns:
//!
//! - **Alerting**: dispatch/heartbeat failure rates
//! - **Dashboards**: schedulable queue depth, stale-task sweeps
//! - **Debugging**: correlating transition counters with traces
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `cadence_exec_transitions_total` | Counter | `op` | Guarded state transitions applied |
//! | `cadence_exec_transition_conflicts_total` | Counter | `op` | Guarded updates that matched zero documents |
//! | `cadence_exec_heartbeats_total` | Counter | `outcome` | Heartbeat RPC outcomes |
//! | `cadence_exec_unresponsive_total` | Counter | - | Tasks declared system-unresponsive |
//! | `cadence_exec_stale_unscheduled_total` | Counter | - | Tasks disabled by the staleness sweep |

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: guarded state transitions applied.
    pub const TRANSITIONS_TOTAL: &str = "cadence_exec_transitions_total";
    /// Counter: guarded updates that matched zero documents.
    pub const TRANSITION_CONFLICTS_TOTAL: &str = "cadence_exec_transition_conflicts_total";
    /// Counter: heartbeat RPC outcomes.
    pub const HEARTBEATS_TOTAL: &str = "cadence_exec_heartbeats_total";
    /// Counter: tasks declared system-unresponsive.
    pub const UNRESPONSIVE_TOTAL: &str = "cadence_exec_unresponsive_total";
    /// Counter: tasks disabled by the staleness sweep.
    pub const STALE_UNSCHEDULED_TOTAL: &str = "cadence_exec_stale_unscheduled_total";
}

/// Metric label keys.
pub mod labels {
    /// The lifecycle operation a transition counter describes.
    pub const OP: &str = "op";
    /// The heartbeat outcome (`ok`, `abort`, `conflict`, `error`).
    pub const OUTCOME: &str = "outcome";
}
