//! Error values carried by tasks.
//!
//! A [`TaskError`] is a domain/code/message triple stored in a task's error
//! cell. It is data first and an error type second: errback handlers read it,
//! may clear it ("catching" the error), or replace it with another. Only the
//! error left in the cell when the callback chain ends is reported through
//! the task's completion notifier.

use std::sync::Arc;
use thiserror::Error;

/// Error domain for errors synthesized by the runtime itself.
pub const DOMAIN_RUNTIME: u32 = 0;

/// Error code used for the synthesized cancellation error.
pub const CODE_CANCELLED: i32 = 1;

/// Error code used when a closure or handler panicked.
pub const CODE_PANICKED: i32 = 2;

/// A domain/code/message error triple attached to a task.
///
/// Domains partition error codes by origin; domain 0 is reserved for the
/// runtime. Cloning is cheap — the message is shared.
#[derive(Debug, Clone, Error)]
#[error("task error (domain {domain}, code {code}): {message}")]
pub struct TaskError {
    /// Namespace for `code`. `DOMAIN_RUNTIME` (0) is reserved.
    pub domain: u32,
    /// Domain-specific error code.
    pub code: i32,
    /// Human-readable description.
    pub message: Arc<str>,
}

impl TaskError {
    /// Create a new error triple.
    pub fn new(domain: u32, code: i32, message: impl Into<Arc<str>>) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
        }
    }

    /// The error synthesized when a cancelled task runs its errbacks.
    pub fn cancelled() -> Self {
        Self::new(DOMAIN_RUNTIME, CODE_CANCELLED, "task was cancelled")
    }

    /// The error attached when a closure or handler panics instead of
    /// setting an error itself.
    pub fn panicked(detail: &str) -> Self {
        Self::new(DOMAIN_RUNTIME, CODE_PANICKED, detail.to_owned())
    }

    /// Whether this is the runtime's synthesized cancellation error.
    pub fn is_cancellation(&self) -> bool {
        self.domain == DOMAIN_RUNTIME && self.code == CODE_CANCELLED
    }
}
