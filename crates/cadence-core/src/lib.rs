//! # cadence-core
//!
//! Core abstractions for the Cadence CI task execution engine.
//!
//! This crate provides the foundational types used across all Cadence
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for tasks, versions, builds, hosts,
//!   pods, distros, and projects
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `cadence-core` is the **only** crate allowed to define shared primitives.
//! All cross-component interaction happens via the types defined here.
//!
//! ## Example
//!
//! ```rust
//! use cadence_core::prelude::*;
//!
//! let task = TaskId::new("my_project_linux_compile_abc123");
//! let archived = task.archive_id(2);
//! assert_eq!(archived.as_str(), "my_project_linux_compile_abc123_2");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::{BuildId, DistroId, HostId, PodId, ProjectId, TaskId, VersionId};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{BuildId, DistroId, HostId, PodId, ProjectId, TaskId, VersionId};
}
