//! Session configuration: one flat struct plus small closed policy enums.
//!
//! Every behavioral strategy the worker can run with (xtime creation, purge
//! handling, transfer engine, crawl mode) is a named variant chosen here at
//! startup and held by reference where needed. There is no runtime strategy
//! mutation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::marker::{ReversionPolicy, XtimeCreation};

/// How purge (UNLINK/RMDIR) records are handled on the secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurgeMode {
    /// Replay deletes.
    Apply,
    /// Drop purge records entirely (operator-requested "ignore deletes").
    Ignore,
}

/// Which external bulk-copy engine moves file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum EngineChoice {
    Rsync {
        #[serde(default = "default_rsync_program")]
        program: String,
        #[serde(default)]
        extra_args: Vec<String>,
    },
    TarPipe {
        /// Remote shell command prefix (e.g. `ssh host`); empty means the
        /// secondary is reachable as a local path.
        #[serde(default)]
        remote_shell: Vec<String>,
    },
}

fn default_rsync_program() -> String {
    "rsync".to_string()
}

impl EngineChoice {
    /// Exit codes of the engine that mean "partial failure, retry the batch"
    /// rather than "terminate the worker".
    pub fn default_resilient_codes(&self) -> Vec<i32> {
        match self {
            // 23: partial transfer, 24: source files vanished mid-run.
            EngineChoice::Rsync { .. } => vec![23, 24],
            // 1: "some files differ"-class warnings from tar.
            EngineChoice::TarPipe { .. } => vec![1],
        }
    }
}

/// Crawl strategy the orchestrator starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrawlMode {
    /// History replay, xsync to cover any gap, then live changelogs.
    Auto,
    /// Full-tree comparison only (no changelog facility on the primary).
    XsyncOnly,
}

/// Operator-set replication checkpoint: reported reached once the
/// secondary's root stime passes `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSpec {
    pub label: String,
    pub target_sec: i64,
    pub target_nsec: i64,
}

/// Everything a replication worker needs to know for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Replication-session uuid; marks are keyed by it.
    pub session_id: Uuid,
    /// Xattr namespace prefix for marks and gfids. The user namespace is the
    /// default so unprivileged runs work; production bricks use trusted.
    pub xattr_namespace: String,
    /// Working directory for staged/processed changelogs and the status file.
    pub working_dir: PathBuf,

    pub xtime_creation: XtimeCreation,
    pub reversion: ReversionPolicy,
    pub purge_mode: PurgeMode,
    pub crawl_mode: CrawlMode,
    pub engine: EngineChoice,
    /// Engine exit codes classified as resilient (retryable) failures.
    pub resilient_exit_codes: Vec<i32>,

    /// Size of the syncer worker pool.
    pub sync_jobs: usize,
    /// Aggregate changelog bytes per processing batch.
    pub batch_max_bytes: u64,
    /// Whole-batch retry ceiling before the force-advance decision.
    pub batch_retries: u32,
    /// After exhausted retries: advance the marker past the failed batch
    /// (availability over durability, logged loudly) or halt the worker.
    pub skip_failed_batches: bool,
    /// Run the gfid-conflict auto-repair pass on entry failures.
    pub repair_gfid_conflicts: bool,
    /// Fold SETXATTR/XATTROP meta records into the data-transfer path.
    pub sync_xattrs: bool,

    /// Synthetic records per xsync changelog file before a flush.
    pub xsync_flush_entries: usize,
    /// Changelog rollover period on the primary, seconds.
    pub rollover_secs: i64,
    /// Sleep between live-crawl scan iterations.
    pub scan_interval: Duration,
    /// Sleep while passive.
    pub passive_interval: Duration,
    /// How often the active/passive role is re-evaluated.
    pub role_recheck: Duration,
    /// Keep-alive cadence and foreign volume-mark validity window, seconds.
    pub keepalive_timeout: i64,
    /// Captured stderr lines kept for fatal-engine diagnostics.
    pub stderr_ring_lines: usize,

    pub checkpoint: Option<CheckpointSpec>,
}

impl SessionConfig {
    pub fn new(session_id: Uuid, working_dir: PathBuf) -> Self {
        Self {
            session_id,
            xattr_namespace: "user.farsync".to_string(),
            working_dir,
            xtime_creation: XtimeCreation::Create,
            reversion: ReversionPolicy::Fatal,
            purge_mode: PurgeMode::Apply,
            crawl_mode: CrawlMode::Auto,
            engine: EngineChoice::Rsync {
                program: default_rsync_program(),
                extra_args: Vec::new(),
            },
            resilient_exit_codes: vec![23, 24],
            sync_jobs: num_cpus::get().clamp(1, 8),
            batch_max_bytes: 1024 * 1024,
            batch_retries: 5,
            skip_failed_batches: true,
            repair_gfid_conflicts: true,
            sync_xattrs: false,
            xsync_flush_entries: 8192,
            rollover_secs: 15,
            scan_interval: Duration::from_secs(3),
            passive_interval: Duration::from_secs(60),
            role_recheck: Duration::from_secs(60),
            keepalive_timeout: 120,
            stderr_ring_lines: 64,
            checkpoint: None,
        }
    }

    /// Directory live changelogs are staged into while being processed.
    pub fn processing_dir(&self) -> PathBuf {
        self.working_dir.join(".processing")
    }

    /// Archive of fully-acked changelogs, kept for operator forensics.
    pub fn processed_dir(&self) -> PathBuf {
        self.working_dir.join(".processed")
    }

    pub fn status_file(&self) -> PathBuf {
        self.working_dir.join("status.json")
    }

    pub fn checkpoint_socket(&self) -> PathBuf {
        self.working_dir.join("checkpoint.sock")
    }
}
