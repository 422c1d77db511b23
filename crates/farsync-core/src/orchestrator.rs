//! The worker orchestration loop.
//!
//! One replication worker per brick: select the active/passive role, catch
//! up via history replay (falling back to the full-tree crawl for whatever
//! history cannot cover), then consume live changelogs forever. A
//! keep-alive thread beats against the secondary while the worker lives;
//! checkpoint completion is observed after every crawl pass.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eyre::{eyre, Context, Result};
use log::{error, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::batch::BatchProcessor;
use crate::checkpoint::CheckpointState;
use crate::config::{CrawlMode, SessionConfig};
use crate::crawl::{changelog::changelog_crawl, history::history_crawl, xsync::xsync_crawl};
use crate::crawl::{stime_or_unsynced, HistoryOutcome};
use crate::endpoint::Endpoint;
use crate::marker::{MarkTime, MarkerEngine};
use crate::status::{StatusFile, WorkerRole};
use crate::syncer::Syncer;
use crate::volinfo::VolumeMark;

/// How this worker decides whether it is the active replica for its brick.
#[derive(Debug, Clone)]
pub enum RoleSource {
    /// Fixed assignment (single-worker deployments, tests).
    Static(bool),
    /// Active iff this node serves the primary brick.
    NodeMembership { node_id: Uuid },
}

impl RoleSource {
    fn is_active(&self, primary: &dyn Endpoint) -> Result<bool> {
        match self {
            RoleSource::Static(active) => Ok(*active),
            RoleSource::NodeMembership { node_id } => {
                let nodes = primary
                    .node_uuids()
                    .wrap_err("failed to read brick node membership")?;
                Ok(nodes.contains(node_id))
            }
        }
    }
}

enum Phase {
    Catchup,
    Live,
}

pub struct Worker<'a> {
    pub primary: &'a dyn Endpoint,
    pub secondary: &'a dyn Endpoint,
    pub markers: &'a MarkerEngine,
    pub syncer: &'a Syncer,
    pub config: &'a SessionConfig,
    pub status: &'a StatusFile,
    pub role_source: RoleSource,
    pub checkpoint: Option<Arc<CheckpointState>>,
    /// External stop request (signal handler, tests).
    pub shutdown: Arc<AtomicBool>,
}

impl<'a> Worker<'a> {
    pub fn run(&self) -> Result<()> {
        let processor = BatchProcessor {
            primary: self.primary,
            secondary: self.secondary,
            syncer: self.syncer,
            markers: self.markers,
            config: self.config,
        };

        let register_time = match self.config.crawl_mode {
            CrawlMode::Auto => Some(
                self.primary
                    .changelog_register()
                    .wrap_err("changelog registration failed")?,
            ),
            CrawlMode::XsyncOnly => None,
        };

        let keepalive_fault: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        thread::scope(|scope| {
            let beat_shutdown = Arc::clone(&self.shutdown);
            let fault = Arc::clone(&keepalive_fault);
            let native = VolumeMark {
                uuid: self.config.session_id,
                version: (1, 0),
                retval: 0,
                volume_mark_sec: 0,
                volume_mark_nsec: 0,
                timeout: self.config.keepalive_timeout,
            };
            let secondary = self.secondary;
            let interval = Duration::from_secs((self.config.keepalive_timeout as u64 / 2).max(1));
            scope.spawn(move || {
                while !beat_shutdown.load(Ordering::SeqCst) {
                    if let Err(err) = secondary.keep_alive(Some(&native)) {
                        *fault.lock() = Some(format!("keep-alive failed: {err}"));
                        break;
                    }
                    // Sleep in slices so shutdown stays prompt.
                    let until = Instant::now() + interval;
                    while Instant::now() < until && !beat_shutdown.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            });

            let result = self.main_loop(&processor, register_time, &keepalive_fault);
            self.shutdown.store(true, Ordering::SeqCst);
            result
        })
    }

    fn main_loop(
        &self,
        processor: &BatchProcessor<'_>,
        register_time: Option<MarkTime>,
        keepalive_fault: &Mutex<Option<String>>,
    ) -> Result<()> {
        let mut phase = Phase::Catchup;
        let mut role_checked_at: Option<Instant> = None;
        let mut active = false;

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Some(fault) = keepalive_fault.lock().take() {
                return Err(eyre!(fault));
            }

            let recheck_due = role_checked_at
                .map(|at| at.elapsed() >= self.config.role_recheck)
                .unwrap_or(true);
            if recheck_due {
                let was_active = active;
                active = self.role_source.is_active(self.primary)?;
                role_checked_at = Some(Instant::now());
                self.status.set_role(if active {
                    WorkerRole::Active
                } else {
                    WorkerRole::Passive
                })?;
                if active && !was_active {
                    info!("worker is the active replica for this brick");
                }
            }

            if !active {
                // Passive workers do no comparison or marker work; the
                // active peer owns the watermark.
                thread::sleep(self.config.passive_interval);
                continue;
            }

            self.check_reversion()?;

            match phase {
                Phase::Catchup => {
                    match self.config.crawl_mode {
                        CrawlMode::XsyncOnly => {
                            self.status.set_crawl("xsync")?;
                            let stats = xsync_crawl(processor, None)?;
                            self.status.record_crawl(&stats)?;
                            self.observe_checkpoint()?;
                            thread::sleep(self.config.scan_interval);
                            // Stay in catch-up: the full walk is the only
                            // change-detection source in this mode.
                            continue;
                        }
                        CrawlMode::Auto => {
                            let register_time =
                                register_time.expect("auto mode always registers");
                            self.status.set_crawl("history")?;
                            let (outcome, stats) = history_crawl(processor, register_time)?;
                            self.status.record_crawl(&stats)?;
                            match outcome {
                                HistoryOutcome::Done { end } => {
                                    info!("history replay caught up through {end}");
                                }
                                HistoryOutcome::NoStime => {
                                    info!("no usable watermark: full-tree crawl");
                                    self.status.set_crawl("xsync")?;
                                    let stats = xsync_crawl(processor, Some(register_time))?;
                                    self.status.record_crawl(&stats)?;
                                }
                                HistoryOutcome::Unavailable => {
                                    warn!("changelog history unavailable: full-tree crawl");
                                    self.status.set_crawl("xsync")?;
                                    let stats = xsync_crawl(processor, Some(register_time))?;
                                    self.status.record_crawl(&stats)?;
                                }
                                HistoryOutcome::Partial { end } => {
                                    warn!(
                                        "history stopped at {end}, before live coverage; \
                                         bridging the gap with a full-tree crawl"
                                    );
                                    self.status.set_crawl("xsync")?;
                                    let stats = xsync_crawl(processor, Some(register_time))?;
                                    self.status.record_crawl(&stats)?;
                                }
                            }
                            phase = Phase::Live;
                            self.status.set_crawl("changelog")?;
                        }
                    }
                }
                Phase::Live => {
                    let stats = changelog_crawl(processor)?;
                    self.status.record_crawl(&stats)?;
                    self.observe_checkpoint()?;
                    thread::sleep(self.config.scan_interval);
                }
            }

            self.observe_checkpoint()?;
        }
        Ok(())
    }

    /// A secondary claiming to be ahead of the primary is corruption (or a
    /// relaxed-mode shrug); decided by the marker engine's policy.
    fn check_reversion(&self) -> Result<()> {
        let xtime = self
            .markers
            .xtime(self.primary, Path::new("."))
            .wrap_err("failed to read primary root xtime")?;
        let stime = stime_or_unsynced(self.markers, self.secondary, Path::new("."))
            .wrap_err("failed to read secondary root stime")?;
        self.markers
            .check_reversion(Path::new("."), xtime, stime)
            .inspect_err(|err| error!("{err}"))
    }

    fn observe_checkpoint(&self) -> Result<()> {
        let Some(checkpoint) = &self.checkpoint else {
            return Ok(());
        };
        let stime = stime_or_unsynced(self.markers, self.secondary, Path::new("."))?;
        if let Some(completed) = checkpoint.observe(stime) {
            self.status.record_checkpoint(completed)?;
        }
        Ok(())
    }
}
