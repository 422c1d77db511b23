//! Advisory per-worker status file.
//!
//! Human-readable JSON progress counters, replaced atomically on every
//! update. Operators and the CLI read it; nothing in the replication
//! protocol depends on it.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::crawl::CrawlStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Initializing,
    Active,
    Passive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub role: WorkerRole,
    /// Which crawl strategy is currently driving change detection.
    pub crawl: String,
    pub last_synced: Option<DateTime<Utc>>,
    pub files_synced: u64,
    pub entries_applied: u64,
    pub metas_applied: u64,
    pub entry_failures: u64,
    pub checkpoint_completed: Option<DateTime<Utc>>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            role: WorkerRole::Initializing,
            crawl: "idle".to_string(),
            last_synced: None,
            files_synced: 0,
            entries_applied: 0,
            metas_applied: 0,
            entry_failures: 0,
            checkpoint_completed: None,
        }
    }
}

pub struct StatusFile {
    path: PathBuf,
    status: Mutex<WorkerStatus>,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            status: Mutex::new(WorkerStatus::default()),
        }
    }

    pub fn snapshot(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    pub fn set_role(&self, role: WorkerRole) -> io::Result<()> {
        self.status.lock().role = role;
        self.save()
    }

    pub fn set_crawl(&self, crawl: &str) -> io::Result<()> {
        self.status.lock().crawl = crawl.to_string();
        self.save()
    }

    pub fn record_crawl(&self, stats: &CrawlStats) -> io::Result<()> {
        {
            let mut status = self.status.lock();
            status.files_synced += stats.files_transferred as u64;
            status.entries_applied += stats.entries_applied as u64;
            status.metas_applied += stats.metas_applied as u64;
            status.entry_failures += stats.entry_failures as u64;
            if stats.batches > 0 {
                status.last_synced = Some(Utc::now());
            }
        }
        self.save()
    }

    pub fn record_checkpoint(&self, completed: DateTime<Utc>) -> io::Result<()> {
        self.status.lock().checkpoint_completed = Some(completed);
        self.save()
    }

    fn save(&self) -> io::Result<()> {
        let json = {
            let status = self.status.lock();
            serde_json::to_vec_pretty(&*status)?
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    /// Load a previously persisted status (counters survive restarts).
    pub fn load(path: PathBuf) -> Self {
        let status = fs::read(&path)
            .ok()
            .and_then(|buf| serde_json::from_slice(&buf).ok())
            .unwrap_or_default();
        Self {
            path,
            status: Mutex::new(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let status = StatusFile::new(path.clone());
        status.set_role(WorkerRole::Active).unwrap();
        status
            .record_crawl(&CrawlStats {
                batches: 1,
                entries_applied: 3,
                metas_applied: 2,
                files_transferred: 5,
                entry_failures: 0,
            })
            .unwrap();

        let reloaded = StatusFile::load(path);
        let snap = reloaded.snapshot();
        assert_eq!(snap.role, WorkerRole::Active);
        assert_eq!(snap.files_synced, 5);
        assert_eq!(snap.entries_applied, 3);
        assert!(snap.last_synced.is_some());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::load(dir.path().join("absent.json"));
        assert_eq!(status.snapshot().role, WorkerRole::Initializing);
    }
}
