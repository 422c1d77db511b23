//! Shared fixture: a primary and secondary brick pair wired through an
//! in-test copy engine, so scenarios drive the real endpoints, syncer and
//! batch processor end to end.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use uuid::Uuid;

use farsync_core::batch::BatchProcessor;
use farsync_core::config::SessionConfig;
use farsync_core::endpoint::{EndpointOptions, LocalEndpoint};
use farsync_core::engine::{BulkCopy, EngineRun};
use farsync_core::marker::{MarkTime, MarkerEngine, ReversionPolicy, XtimeCreation};
use farsync_core::syncer::{FatalHook, Syncer};

pub const SESSION: Uuid = Uuid::from_u128(0xFA);

/// In-test engine: copies each brick-relative path to the secondary root,
/// writing through existing inodes the way `rsync --inplace` does.
pub struct CopyEngine {
    pub dest_root: PathBuf,
}

impl BulkCopy for CopyEngine {
    fn name(&self) -> &'static str {
        "test-copy"
    }

    fn sync(&self, source_root: &Path, files: &[PathBuf]) -> Result<EngineRun> {
        for rel in files {
            let src = source_root.join(rel);
            let dst = self.dest_root.join(rel);
            let Ok(content) = fs::read(&src) else {
                continue; // vanished source: rsync would report code 24
            };
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dst, content)?;
        }
        Ok(EngineRun {
            command: "test-copy".to_string(),
            code: 0,
            stderr_tail: vec![],
        })
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub primary: LocalEndpoint,
    pub secondary: LocalEndpoint,
    pub markers: MarkerEngine,
    pub config: SessionConfig,
    pub syncer: Syncer,
}

fn noop_fatal_hook() -> FatalHook {
    Arc::new(|_run| {})
}

impl Harness {
    pub fn new() -> Result<Harness> {
        let dir = tempfile::tempdir()?;
        let primary_root = dir.path().join("primary");
        let secondary_root = dir.path().join("secondary");
        let working_dir = dir.path().join("work");
        let changelog_dir = dir.path().join("changelogs");
        for d in [&primary_root, &secondary_root, &working_dir, &changelog_dir] {
            fs::create_dir_all(d)?;
        }

        let mut config = SessionConfig::new(SESSION, working_dir.clone());
        config.sync_jobs = 2;
        config.scan_interval = std::time::Duration::from_millis(10);
        config.passive_interval = std::time::Duration::from_millis(10);
        config.role_recheck = std::time::Duration::from_millis(10);

        let primary = LocalEndpoint::new(
            &primary_root,
            EndpointOptions {
                xattr_namespace: config.xattr_namespace.clone(),
                working_dir: working_dir.clone(),
                changelog_dir: Some(changelog_dir),
                authoritative: true,
                node_ids: vec![],
                rollover_secs: 15,
            },
        )?;
        let secondary = LocalEndpoint::new(
            &secondary_root,
            EndpointOptions {
                xattr_namespace: config.xattr_namespace.clone(),
                working_dir: dir.path().join("work-secondary"),
                ..Default::default()
            },
        )?;

        let engine = Arc::new(CopyEngine {
            dest_root: secondary_root,
        });
        let syncer = Syncer::new(
            engine,
            primary_root,
            config.sync_jobs,
            config.resilient_exit_codes.clone(),
            noop_fatal_hook(),
        );

        let markers = MarkerEngine::new(
            SESSION,
            XtimeCreation::Create,
            ReversionPolicy::Fatal,
            MarkTime::new(0, 0),
        );

        Ok(Harness {
            dir,
            primary,
            secondary,
            markers,
            config,
            syncer,
        })
    }

    pub fn processor(&self) -> BatchProcessor<'_> {
        BatchProcessor {
            primary: &self.primary,
            secondary: &self.secondary,
            syncer: &self.syncer,
            markers: &self.markers,
            config: &self.config,
        }
    }

    pub fn changelog_dir(&self) -> PathBuf {
        self.dir.path().join("changelogs")
    }

    /// Write one rolled-over changelog file and return its path.
    pub fn write_changelog(&self, ts: i64, lines: &[String]) -> Result<PathBuf> {
        let path = self.changelog_dir().join(format!("CHANGELOG.{ts}"));
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body)?;
        Ok(path)
    }

    pub fn root_stime(&self) -> Option<MarkTime> {
        self.markers
            .stime(&self.secondary, Path::new("."))
            .ok()
            .filter(|m| !m.is_unsynced())
    }

    pub fn ids() -> (u32, u32) {
        unsafe { (libc::geteuid(), libc::getegid()) }
    }
}
