//! The batch processor: turns parsed changelog records into applied
//! secondary-side state and an advanced watermark.
//!
//! Per processing round: entry ops are applied (with the gfid-conflict
//! repair loop), then metadata ops, then data transfers are handed to the
//! syncer and awaited. The marker commit happens only after every data box
//! of the round reports success; a failed round retries whole, bounded by
//! the configured ceiling, after which the force-advance policy decides
//! between skipping (availability) and halting (durability).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{eyre, Context, Result};
use log::{error, info, warn};

use crate::changelog::{ChangeRecord, ChangelogBatch, EntryChange, EntryVerb, Gfid, MetaKind};
use crate::config::{PurgeMode, SessionConfig};
use crate::endpoint::{Endpoint, EntryFailure, EntryRecord, MetaRecord, SetattrSpec};
use crate::errors::{errno_of, ReplError};
use crate::marker::MarkerEngine;
use crate::syncer::{wait_all, PostBox, Syncer};

/// Repair rounds per batch attempt before giving up on entry conflicts.
const MAX_REPAIR_ROUNDS: u32 = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchStats {
    pub entries_applied: usize,
    pub metas_applied: usize,
    pub files_transferred: usize,
    pub entry_failures: usize,
}

pub struct BatchProcessor<'a> {
    pub primary: &'a dyn Endpoint,
    pub secondary: &'a dyn Endpoint,
    pub syncer: &'a Syncer,
    pub markers: &'a MarkerEngine,
    pub config: &'a SessionConfig,
}

impl<'a> BatchProcessor<'a> {
    /// Process one changelog batch with retries and commit the watermark.
    pub fn process_batch(&self, batch: &ChangelogBatch, commit_path: &Path) -> Result<BatchStats> {
        let stats = self.process_with_retries(&batch.files)?;
        self.commit(commit_path, batch)?;
        Ok(stats)
    }

    /// Retry a set of changelog files up to the configured ceiling; past it,
    /// the force-advance policy decides between skipping the files
    /// (availability, logged per file) and halting the worker.
    pub fn process_with_retries(&self, files: &[PathBuf]) -> Result<BatchStats> {
        let mut attempt = 0u32;
        loop {
            match self.process_files(files) {
                Ok(stats) => return Ok(stats),
                Err(err) => {
                    attempt += 1;
                    if err.should_retry(self.config.batch_retries)
                        && attempt <= self.config.batch_retries
                    {
                        warn!(
                            "changelog batch failed (attempt {attempt}/{}): {err}",
                            self.config.batch_retries
                        );
                        continue;
                    }
                    if self.config.skip_failed_batches {
                        // Availability over durability: move on anyway and
                        // say exactly what was skipped.
                        for file in files {
                            warn!(
                                "skipping unsynced changelog {} after {attempt} attempts",
                                file.display()
                            );
                        }
                        return Ok(BatchStats::default());
                    }
                    return Err(eyre!(
                        "changelog batch failed after {attempt} attempts: {err}"
                    ));
                }
            }
        }
    }

    fn commit(&self, commit_path: &Path, batch: &ChangelogBatch) -> Result<()> {
        let mark = batch.commit_mark();
        self.markers
            .set_stime(self.secondary, commit_path, mark)
            .wrap_err("failed to persist stime")?;
        self.markers
            .set_entry_stime(self.secondary, commit_path, mark)
            .wrap_err("failed to persist entry_stime")?;
        Ok(())
    }

    /// One processing attempt over a set of changelog files: parse, apply,
    /// dispatch, await. No marker movement.
    pub fn process_files(&self, files: &[PathBuf]) -> std::result::Result<BatchStats, ReplError> {
        let round = self
            .parse_files(files)
            .map_err(|err| ReplError::retryable(format!("{err:#}"), None))?;
        self.apply_round(round)
    }

    fn parse_files(&self, files: &[PathBuf]) -> Result<Round> {
        let mut round = Round::default();
        for file in files {
            let text = fs::read_to_string(file)
                .wrap_err_with(|| format!("failed to read changelog {}", file.display()))?;
            for line in text.lines().filter(|l| !l.is_empty()) {
                let record = ChangeRecord::parse_line(line)
                    .wrap_err_with(|| format!("bad record in {}", file.display()))?;
                self.fold_record(&mut round, record);
            }
        }
        Ok(round)
    }

    fn fold_record(&self, round: &mut Round, record: ChangeRecord) {
        match record {
            ChangeRecord::Entry(change) => self.fold_entry(round, change),
            ChangeRecord::Data { gfid } => {
                if round.unlinked.contains(&gfid) {
                    // Already gone in this very batch; a transfer would be
                    // wasted on a file the replay deletes again.
                    return;
                }
                match self.primary.gfid_path(&gfid) {
                    Ok(rel) => {
                        round.datas.insert(rel);
                    }
                    Err(err) if errno_of(&err) == libc::ENOENT => {
                        info!("dropping data record {gfid}: source gone");
                    }
                    Err(err) => warn!("cannot resolve data record {gfid}: {err}"),
                }
            }
            ChangeRecord::Meta { gfid, kind } => match kind {
                MetaKind::Setattr => match self.primary_stat_of(&gfid) {
                    Some(stat) => round.metas.push(MetaRecord {
                        gfid,
                        attrs: SetattrSpec::from_stat(&stat),
                    }),
                    None => info!("dropping setattr record {gfid}: source gone"),
                },
                MetaKind::Setxattr | MetaKind::Xattrop => {
                    // The copy tool carries attributes; only an explicit
                    // xattr-sync setup folds these into the data path.
                    if self.config.sync_xattrs {
                        if let Ok(rel) = self.primary.gfid_path(&gfid) {
                            round.datas.insert(rel);
                        }
                    }
                }
            },
        }
    }

    fn fold_entry(&self, round: &mut Round, change: EntryChange) {
        match change.verb {
            EntryVerb::Unlink | EntryVerb::Rmdir => {
                round.unlinked.insert(change.gfid);
                if let Ok(rel) = self.primary.gfid_path(&change.gfid) {
                    round.datas.remove(&rel);
                }
                if self.config.purge_mode == PurgeMode::Ignore {
                    return;
                }
                round.entries.push(plain_record(&change));
            }
            EntryVerb::Create | EntryVerb::Mkdir => round.entries.push(plain_record(&change)),
            EntryVerb::Mknod => {
                if change.is_sticky_linkto() {
                    // A dht linkto stub: replay as a hard link and queue the
                    // content, the stub itself never lands on the secondary.
                    let mut record = plain_record(&change);
                    record.op = EntryVerb::Link;
                    record.stat = self.primary_stat_of(&change.gfid);
                    round.entries.push(record);
                    if let Ok(rel) = self.primary.gfid_path(&change.gfid) {
                        round.datas.insert(rel);
                    }
                } else {
                    round.entries.push(plain_record(&change));
                }
            }
            EntryVerb::Link => match self.primary_stat_of(&change.gfid) {
                Some(stat) => {
                    let mut record = plain_record(&change);
                    record.stat = Some(stat);
                    round.entries.push(record);
                }
                None => info!(
                    "dropping link record {} {}: source gone",
                    change.gfid, change.entry
                ),
            },
            EntryVerb::Symlink => {
                let source = self
                    .primary
                    .gfid_path(&change.entry.parent)
                    .map(|parent| parent.join(&change.entry.basename));
                match source.and_then(|rel| self.primary.readlink(&rel)) {
                    Ok(target) => {
                        let mut record = plain_record(&change);
                        record.link = Some(target);
                        round.entries.push(record);
                    }
                    Err(err) if errno_of(&err) == libc::ENOENT => info!(
                        "dropping symlink record {} {}: source gone",
                        change.gfid, change.entry
                    ),
                    Err(err) => warn!("symlink record {} unresolved: {err}", change.gfid),
                }
            }
            EntryVerb::Rename => match self.primary_stat_of(&change.gfid) {
                Some(stat) => {
                    let mut record = plain_record(&change);
                    record.stat = Some(stat);
                    if stat.is_symlink() {
                        record.link = change
                            .entry1
                            .as_ref()
                            .and_then(|dest| {
                                self.primary
                                    .gfid_path(&dest.parent)
                                    .map(|p| p.join(&dest.basename))
                                    .ok()
                            })
                            .and_then(|rel| self.primary.readlink(&rel).ok());
                    }
                    round.entries.push(record);
                }
                None => {
                    // The renamed object is gone from the primary: whatever
                    // the destination used to be, it must go away too.
                    if let Some(dest) = change.entry1.clone() {
                        let mut record = plain_record(&change);
                        record.op = EntryVerb::Unlink;
                        record.entry = dest;
                        record.entry1 = None;
                        round.entries.push(record);
                    }
                    round.unlinked.insert(change.gfid);
                }
            },
        }
    }

    fn primary_stat_of(&self, gfid: &Gfid) -> Option<crate::endpoint::FileStat> {
        self.primary
            .gfid_path(gfid)
            .and_then(|rel| self.primary.lstat(&rel))
            .ok()
    }

    fn apply_round(&self, round: Round) -> std::result::Result<BatchStats, ReplError> {
        let mut stats = BatchStats {
            entries_applied: round.entries.len(),
            metas_applied: round.metas.len(),
            files_transferred: round.datas.len(),
            entry_failures: 0,
        };

        // Entry ops first; data is allowed to race ahead of nothing.
        let mut failures = self.secondary.entry_ops(&round.entries);
        if !failures.is_empty() && self.config.repair_gfid_conflicts {
            failures = self.repair_loop(failures);
        }
        for failure in &failures {
            error!(
                "entry op left unapplied (errno {}): {}",
                failure.errno,
                failure.record.describe()
            );
        }
        stats.entry_failures = failures.len();

        for failure in self.secondary.meta_ops(&round.metas) {
            warn!(
                "meta op on {} failed with errno {}",
                failure.record.gfid, failure.errno
            );
        }

        let handles: Vec<Arc<PostBox>> = round
            .datas
            .iter()
            .map(|rel| self.syncer.add(rel.clone()))
            .collect();
        if !wait_all(&handles) {
            return Err(ReplError::retryable(
                format!("{} data transfers incomplete", round.datas.len()),
                None,
            )
            .with_attempt());
        }
        Ok(stats)
    }

    /// Gfid-conflict auto-repair: classify each failure against the
    /// primary's current state, synthesize fixes, resubmit, bounded rounds.
    fn repair_loop(&self, mut failures: Vec<EntryFailure>) -> Vec<EntryFailure> {
        for round in 1..=MAX_REPAIR_ROUNDS {
            let mut fixes: Vec<EntryRecord> = Vec::new();
            let mut still_failed: Vec<EntryRecord> = Vec::new();

            for failure in &failures {
                match self.plan_repair(failure) {
                    RepairPlan::Fix(fix) => {
                        fixes.push(fix);
                        still_failed.push(failure.record.clone());
                    }
                    RepairPlan::Retry => still_failed.push(failure.record.clone()),
                    RepairPlan::Drop => {}
                }
            }

            if fixes.is_empty() && still_failed.is_empty() {
                return Vec::new();
            }
            if fixes.is_empty() && round == MAX_REPAIR_ROUNDS {
                break;
            }

            info!(
                "gfid conflict repair round {round}: {} fixes, {} resubmissions",
                fixes.len(),
                still_failed.len()
            );
            let mut records = fixes;
            records.extend(still_failed);
            failures = self.secondary.entry_ops(&records);
            if failures.is_empty() {
                return Vec::new();
            }
        }
        failures
    }

    fn plan_repair(&self, failure: &EntryFailure) -> RepairPlan {
        let record = &failure.record;

        // Missing parent directory on the secondary.
        if failure.errno == libc::ENOENT && failure.conflict.is_none() {
            return match self.primary.gfid_path(&record.entry.parent) {
                Err(_) => RepairPlan::Drop, // parent gone on the primary too
                Ok(parent_rel) => self.synthesize_parent_mkdir(record, &parent_rel),
            };
        }

        let Some(conflict) = failure.conflict else {
            // EEXIST without identity detail: nothing safe to synthesize.
            return RepairPlan::Retry;
        };

        match self.primary.gfid_path(&conflict.disk_gfid) {
            Err(err) if errno_of(&err) == libc::ENOENT => {
                // The occupant no longer exists on the primary: delete it.
                let mut fix = record.clone();
                fix.op = if conflict.secondary_is_dir {
                    EntryVerb::Rmdir
                } else {
                    EntryVerb::Unlink
                };
                fix.gfid = conflict.disk_gfid;
                fix.entry1 = None;
                fix.stat = None;
                fix.link = None;
                RepairPlan::Fix(fix)
            }
            Err(_) => RepairPlan::Retry,
            Ok(primary_rel) => {
                // The occupant still exists on the primary. If it lives at
                // this very entry, our record is the stale one.
                let same_entry = self
                    .primary
                    .gfid_path(&record.entry.parent)
                    .map(|parent| parent.join(&record.entry.basename))
                    .map(|rel| {
                        self.primary
                            .gfid(&rel)
                            .map(|g| g == conflict.disk_gfid)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);
                if same_entry {
                    return RepairPlan::Drop;
                }
                if conflict.secondary_is_dir {
                    // Move the occupant to the primary's canonical name and
                    // let the resubmission take the vacated entry.
                    self.synthesize_rename(record, &conflict.disk_gfid, &primary_rel)
                } else {
                    // The occupant's current name is not resolvable for
                    // plain files; the later changelog record for it will
                    // move it. Keep resubmitting meanwhile.
                    RepairPlan::Retry
                }
            }
        }
    }

    fn synthesize_parent_mkdir(&self, record: &EntryRecord, parent_rel: &Path) -> RepairPlan {
        let Some(basename) = parent_rel.file_name().and_then(|n| n.to_str()) else {
            return RepairPlan::Drop;
        };
        let grandparent_rel = parent_rel.parent().unwrap_or(Path::new("."));
        let grandparent = match self.primary.gfid(grandparent_rel) {
            Ok(gfid) => gfid,
            Err(_) => return RepairPlan::Drop,
        };
        let stat = match self.primary.lstat(parent_rel) {
            Ok(stat) => stat,
            Err(_) => return RepairPlan::Drop,
        };
        RepairPlan::Fix(EntryRecord {
            op: EntryVerb::Mkdir,
            gfid: record.entry.parent,
            entry: crate::changelog::EntryRef::new(grandparent, basename),
            entry1: None,
            mode: stat.perm(),
            uid: stat.uid,
            gid: stat.gid,
            stat: Some(stat),
            link: None,
            skip: false,
        })
    }

    fn synthesize_rename(
        &self,
        record: &EntryRecord,
        occupant: &Gfid,
        primary_rel: &Path,
    ) -> RepairPlan {
        let Some(basename) = primary_rel.file_name().and_then(|n| n.to_str()) else {
            return RepairPlan::Retry;
        };
        let parent_rel = primary_rel.parent().unwrap_or(Path::new("."));
        let parent = match self.primary.gfid(parent_rel) {
            Ok(gfid) => gfid,
            Err(_) => return RepairPlan::Retry,
        };
        let dest = crate::changelog::EntryRef::new(parent, basename);
        if dest == record.entry {
            return RepairPlan::Drop;
        }
        RepairPlan::Fix(EntryRecord {
            op: EntryVerb::Rename,
            gfid: *occupant,
            entry: record.entry.clone(),
            entry1: Some(dest),
            mode: 0,
            uid: 0,
            gid: 0,
            stat: self.primary.lstat(primary_rel).ok(),
            link: None,
            skip: false,
        })
    }
}

enum RepairPlan {
    /// Apply this synthesized record, then resubmit the original.
    Fix(EntryRecord),
    /// Resubmit the original unchanged.
    Retry,
    /// The failure is benign; drop it.
    Drop,
}

#[derive(Default)]
struct Round {
    entries: Vec<EntryRecord>,
    metas: Vec<MetaRecord>,
    datas: std::collections::BTreeSet<PathBuf>,
    unlinked: HashSet<Gfid>,
}

fn plain_record(change: &EntryChange) -> EntryRecord {
    EntryRecord {
        op: change.verb,
        gfid: change.gfid,
        entry: change.entry.clone(),
        entry1: change.entry1.clone(),
        mode: change.mode,
        uid: change.uid,
        gid: change.gid,
        stat: None,
        link: None,
        skip: false,
    }
}
