//! Change-detection crawlers: live changelog consumption, historical
//! changelog replay, and the full-tree xsync fallback.
//!
//! The orchestrator picks among them once per run: history first, xsync for
//! whatever history cannot cover, then live changelogs forever.

pub mod changelog;
pub mod history;
pub mod xsync;

use std::io;
use std::path::Path;

use crate::endpoint::Endpoint;
use crate::errors::errno_of;
use crate::marker::{MarkTime, MarkerEngine, URXTIME};

/// Explicit outcome of a history-replay attempt. The orchestrator matches on
/// this to decide what runs next; no control-flow unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// History covered everything up to `end`.
    Done { end: i64 },
    /// No valid watermark exists yet; nothing to replay from.
    NoStime,
    /// History stopped short of live coverage at `end`; xsync must bridge
    /// the rest.
    Partial { end: i64 },
    /// The history mechanism cannot cover the gap at all.
    Unavailable,
}

/// Totals accumulated by one crawl pass, for the status file.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlStats {
    pub batches: usize,
    pub entries_applied: usize,
    pub metas_applied: usize,
    pub files_transferred: usize,
    pub entry_failures: usize,
}

impl CrawlStats {
    pub fn absorb(&mut self, stats: crate::batch::BatchStats) {
        self.batches += 1;
        self.entries_applied += stats.entries_applied;
        self.metas_applied += stats.metas_applied;
        self.files_transferred += stats.files_transferred;
        self.entry_failures += stats.entry_failures;
    }
}

/// Secondary-side stime with "path not there yet" folded into URXTIME.
pub(crate) fn stime_or_unsynced(
    markers: &MarkerEngine,
    secondary: &dyn Endpoint,
    path: &Path,
) -> io::Result<MarkTime> {
    match markers.stime(secondary, path) {
        Ok(mark) => Ok(mark),
        Err(err)
            if err.kind() == io::ErrorKind::NotFound || errno_of(&err) == libc::ENOENT =>
        {
            Ok(URXTIME)
        }
        Err(err) => Err(err),
    }
}
