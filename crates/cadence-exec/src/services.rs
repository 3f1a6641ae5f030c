//! Shared services injected into every controller.
//!
//! The execution core has no process-global environment: callers construct a
//! [`CoreServices`] value (clock, secret source, event sink) and hand it to
//! each controller alongside the store. Tests substitute a fixed clock and a
//! recording outbox to make time-dependent behavior deterministic.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::events::{EventSink, NullSink, TaskEvent};

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a settable instant, for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Creates a clock pinned to `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock to a new instant.
    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Advances the clock by a duration.
    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }
}

/// A source of per-execution task secrets.
pub trait SecretSource: Send + Sync {
    /// Returns a fresh secret string.
    fn new_secret(&self) -> String;
}

/// Generates ULID-backed secrets.
///
/// ULIDs give 80 bits of randomness per value, which is sufficient for the
/// agent-authentication secret rotated on every execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidSecrets;

impl SecretSource for UlidSecrets {
    fn new_secret(&self) -> String {
        Ulid::new().to_string()
    }
}

/// The bundle of ambient services every controller needs.
#[derive(Clone)]
pub struct CoreServices {
    clock: Arc<dyn Clock>,
    secrets: Arc<dyn SecretSource>,
    events: Arc<dyn EventSink>,
}

impl CoreServices {
    /// Creates services with the wall clock, ULID secrets, and the given sink.
    #[must_use]
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            secrets: Arc::new(UlidSecrets),
            events,
        }
    }

    /// Creates services that drop all events. Intended for tools and tests
    /// that do not observe event history.
    #[must_use]
    pub fn without_events() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the secret source.
    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretSource>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Returns the current instant.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns a fresh per-execution secret.
    #[must_use]
    pub fn new_secret(&self) -> String {
        self.secrets.new_secret()
    }

    /// Records a lifecycle event (best-effort).
    pub fn log_task_event(&self, event: TaskEvent) {
        self.events.log_task_event(event);
    }
}

impl std::fmt::Debug for CoreServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreServices").finish_non_exhaustive()
    }
}
