//! Strongly-typed identifiers for Cadence entities.
//!
//! All identifiers in Cadence are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **String-backed**: Task IDs are human-readable composites assembled by
//!   the ingestion layer (project, variant, display name, revision), so they
//!   carry meaning and sort stably in the store
//! - **Cheap to clone**: IDs are plain strings and are passed by reference in
//!   hot paths
//!
//! # Example
//!
//! ```rust
//! use cadence_core::id::{DistroId, TaskId};
//!
//! let task = TaskId::new("mci_ubuntu2204_compile_patch_abc");
//! let distro = DistroId::new("ubuntu2204-large");
//!
//! // IDs are different types - this won't compile:
//! // let wrong: DistroId = task;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A unique identifier for a task.
///
/// The live record for a task keeps the bare ID; archived executions are
/// stored under [`TaskId::archive_id`], which suffixes the execution number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task ID from a raw string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the task ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the archive-collection ID for a given execution of this task.
    ///
    /// Archived records are keyed by `"{id}_{execution}"` so that every
    /// execution of a task identity has a distinct, deterministic key.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cadence_core::TaskId;
    ///
    /// let id = TaskId::new("proj_variant_lint_abc");
    /// assert_eq!(id.archive_id(3).as_str(), "proj_variant_lint_abc_3");
    /// ```
    #[must_use]
    pub fn archive_id(&self, execution: u32) -> Self {
        Self(format!("{}_{execution}", self.0))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidId {
                message: "task ID must be non-empty".into(),
            });
        }
        Ok(Self(s.to_owned()))
    }
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates the ID from a raw string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                if s.is_empty() {
                    return Err(Error::InvalidId {
                        message: concat!($label, " ID must be non-empty").into(),
                    });
                }
                Ok(Self(s.to_owned()))
            }
        }
    };
}

string_id!(
    /// A unique identifier for a version (one commit or patch's task graph).
    VersionId,
    "version"
);

string_id!(
    /// A unique identifier for a build (one variant's tasks within a version).
    BuildId,
    "build"
);

string_id!(
    /// A unique identifier for an execution host.
    HostId,
    "host"
);

string_id!(
    /// A unique identifier for a container pod.
    PodId,
    "pod"
);

string_id!(
    /// A unique identifier for a distro (a host class tasks can target).
    DistroId,
    "distro"
);

string_id!(
    /// A unique identifier for a project.
    ProjectId,
    "project"
);
