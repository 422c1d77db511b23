//! Failure taxonomy for the replication worker.
//!
//! Failures fall into three classes that drive very different handling:
//! - Retryable: per-record errno failures (ENOENT, EEXIST with a gfid
//!   mismatch, ENOTEMPTY) that the repair pass or a whole-batch retry can
//!   resolve.
//! - Fatal: conditions the worker cannot recover from in-process (a
//!   non-resilient copy-engine exit, conflicting foreign volume marks, a
//!   marker reversion).
//! - Fallback: history-replay unavailability; never an error for the worker,
//!   only a signal to run the full-tree crawl instead.

use std::io;

/// Class of a replication failure, for retry/fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// May succeed on a repair pass or whole-batch retry.
    Retryable,
    /// Unrecoverable for this worker process.
    Fatal,
    /// Not an error: switch change-detection strategy and continue.
    Fallback,
}

/// A batch-level replication error with its class and attempt count.
#[derive(Debug)]
pub struct ReplError {
    pub message: String,
    /// Brick-relative path or gfid string the failure is about, if any.
    pub subject: Option<String>,
    pub class: FailureClass,
    pub attempts: u32,
}

impl ReplError {
    pub fn retryable(message: impl Into<String>, subject: Option<String>) -> Self {
        Self {
            message: message.into(),
            subject,
            class: FailureClass::Retryable,
            attempts: 0,
        }
    }

    pub fn fatal(message: impl Into<String>, subject: Option<String>) -> Self {
        Self {
            message: message.into(),
            subject,
            class: FailureClass::Fatal,
            attempts: 0,
        }
    }

    /// Whether another whole-batch attempt is allowed under `ceiling`.
    pub fn should_retry(&self, ceiling: u32) -> bool {
        self.class == FailureClass::Retryable && self.attempts < ceiling
    }

    pub fn with_attempt(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self
    }
}

impl std::fmt::Display for ReplError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref subject) = self.subject {
            write!(f, "{}: {}", subject, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ReplError {}

/// Raw errno of an io::Error, or 0 when the error carries none.
pub fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

/// Classify an errno reported by an entry/meta primitive on the secondary.
///
/// The repairable set is exactly the set the gfid-conflict auto-repair pass
/// knows how to resolve; everything else bubbles up as a batch retry.
pub fn classify_errno(errno: i32) -> FailureClass {
    match errno {
        libc::ENOENT | libc::EEXIST | libc::ENOTEMPTY | libc::ENODATA => FailureClass::Retryable,
        libc::EIO | libc::EROFS | libc::ENOSPC => FailureClass::Fatal,
        _ => FailureClass::Retryable,
    }
}

/// io::Error constructor carrying a specific errno, for primitives that
/// detect a condition themselves (e.g. a disk-gfid mismatch surfacing as
/// EEXIST).
pub fn errno_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}
