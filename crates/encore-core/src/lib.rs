//! # encore-core
//!
//! Foundation types shared by every encore crate:
//!
//! - **Branded IDs**: [`TaskId`], [`TurnId`], [`BudgetId`] as newtypes for type safety
//! - **Errors**: [`ClassifiedError`] carrying an [`ErrorClass`] from the shared taxonomy,
//!   a stable code, a message, and an optional hint
//! - **Classification**: [`classify`] maps error names and message text onto the taxonomy
//! - **Formatting**: user-facing, log-oriented, and toast renderings of an error
//! - **Redaction**: provider API keys are scrubbed before anything is logged
//! - **Logging**: `tracing` subscriber setup and a capture layer for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod format;
pub mod ids;
pub mod logging;
pub mod redact;

pub use errors::classify::classify;
pub use errors::{ClassifiedError, ErrorClass, Severity};
pub use ids::{BudgetId, TaskId, TurnId};
pub use redact::{ApiKey, redact_secrets};
