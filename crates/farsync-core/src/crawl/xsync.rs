//! Full-tree fallback crawl ("xsync").
//!
//! A depth-first walk of the primary synthesizes changelog-shaped records
//! for everything newer than the secondary's watermark and streams them to
//! the batch processor over a bounded channel. The producer writes records
//! into `XSYNC-CHANGELOG.<seq>` files (flushed every N entries to bound
//! memory) and interleaves per-subtree watermark updates; an explicit
//! `Finale` sentinel ends the stream.
//!
//! Watermarks advanced by this crawl are clamped so they never exceed the
//! point where live-changelog coverage begins — otherwise delete/rename
//! replays queued behind that point would be skipped forever.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::{bounded, Receiver, Sender};
use eyre::{eyre, Context, Result};
use log::{debug, info};

use crate::batch::BatchProcessor;
use crate::changelog::{
    ChangeRecord, EntryChange, EntryRef, EntryVerb, MetaKind, XSYNC_PREFIX,
};
use crate::marker::{needs_sync, MarkTime};

use super::{stime_or_unsynced, CrawlStats};

enum XsyncEvent {
    /// A flushed synthetic changelog, ready for the batch processor.
    Batch(PathBuf),
    /// Subtree fully emitted: advance this path's watermark (clamped).
    Stime(PathBuf, MarkTime),
    Finale,
}

/// Run a full-tree crawl. `upper_limit` is where live coverage begins; pass
/// `None` only when no changelog facility exists at all.
pub fn xsync_crawl(
    processor: &BatchProcessor<'_>,
    upper_limit: Option<MarkTime>,
) -> Result<CrawlStats> {
    let staging = processor.config.working_dir.join("xsync");
    fs::create_dir_all(&staging)
        .wrap_err_with(|| format!("failed to create {}", staging.display()))?;

    let (tx, rx) = bounded::<XsyncEvent>(16);
    std::thread::scope(|scope| {
        let producer = scope.spawn(|| produce(processor, &staging, tx));
        let consumed = consume(processor, upper_limit, rx);
        let produced = producer
            .join()
            .map_err(|_| eyre!("xsync producer panicked"))?;
        let stats = consumed?;
        produced?;
        Ok(stats)
    })
}

fn consume(
    processor: &BatchProcessor<'_>,
    upper_limit: Option<MarkTime>,
    rx: Receiver<XsyncEvent>,
) -> Result<CrawlStats> {
    let mut stats = CrawlStats::default();
    for event in rx.iter() {
        match event {
            XsyncEvent::Batch(file) => {
                stats.absorb(processor.process_with_retries(std::slice::from_ref(&file))?);
            }
            XsyncEvent::Stime(path, mark) => {
                let mark = clamp(mark, upper_limit);
                processor
                    .markers
                    .set_stime(processor.secondary, &path, mark)
                    .wrap_err_with(|| format!("failed to advance stime on {}", path.display()))?;
            }
            XsyncEvent::Finale => break,
        }
    }
    Ok(stats)
}

fn produce(
    processor: &BatchProcessor<'_>,
    staging: &Path,
    tx: Sender<XsyncEvent>,
) -> Result<()> {
    let mut log = SyntheticLog::new(
        staging,
        processor.config.xsync_flush_entries,
        tx.clone(),
    );

    let root = PathBuf::from(".");
    let root_stime = stime_or_unsynced(processor.markers, processor.secondary, &root)?;
    let root_xtime = processor.markers.xtime(processor.primary, &root)?;

    if needs_sync(root_xtime, root_stime) {
        info!(
            "xsync crawl: root xtime {root_xtime} ahead of stime {root_stime}, walking the tree"
        );
        crawl_dir(processor, &root, root_stime, &mut log)?;
        log.flush()?;
        send(&tx, XsyncEvent::Stime(root, root_xtime))?;
    } else {
        debug!("xsync crawl: root already covered");
    }
    send(&tx, XsyncEvent::Finale)
}

fn crawl_dir(
    processor: &BatchProcessor<'_>,
    rel: &Path,
    root_stime: MarkTime,
    log: &mut SyntheticLog,
) -> Result<()> {
    let primary = processor.primary;
    let markers = processor.markers;
    let parent_gfid = if rel == Path::new(".") {
        crate::changelog::ROOT_GFID
    } else {
        primary.gfid(rel)?
    };
    let dir_stime = stime_or_unsynced(markers, processor.secondary, rel)?;
    let file_reference = dir_stime.max(root_stime);

    for name in primary.entries(rel)? {
        let child = rel.join(&name);
        let stat = match primary.lstat(&child) {
            Ok(stat) => stat,
            // Vanished mid-walk: the next crawl sees the final state.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to stat {}", child.display()))
            }
        };
        let basename = name.to_string_lossy().into_owned();

        if stat.is_dir() {
            let child_xtime = markers.xtime(primary, &child)?;
            let child_stime = stime_or_unsynced(markers, processor.secondary, &child)?;
            if !needs_sync(child_xtime, child_stime.max(root_stime)) {
                continue;
            }
            let gfid = primary.gfid(&child)?;
            log.append(&ChangeRecord::Entry(EntryChange {
                gfid,
                verb: EntryVerb::Mkdir,
                entry: EntryRef::new(parent_gfid, basename),
                entry1: None,
                mode: stat.mode,
                uid: stat.uid,
                gid: stat.gid,
            }))?;
            log.append(&ChangeRecord::Meta {
                gfid,
                kind: MetaKind::Setattr,
            })?;
            crawl_dir(processor, &child, root_stime, log)?;
            // Subtree emitted: flush so the watermark never overtakes its
            // own records in the stream.
            log.flush()?;
            send(&log.tx, XsyncEvent::Stime(child, child_xtime))?;
        } else if stat.is_regular() {
            let child_xtime = markers.xtime(primary, &child)?;
            if !needs_sync(child_xtime, file_reference) {
                continue;
            }
            let gfid = primary.gfid(&child)?;
            let verb = if stat.nlink > 1 {
                EntryVerb::Link
            } else {
                EntryVerb::Mknod
            };
            log.append(&ChangeRecord::Entry(EntryChange {
                gfid,
                verb,
                entry: EntryRef::new(parent_gfid, basename),
                entry1: None,
                mode: stat.mode,
                uid: stat.uid,
                gid: stat.gid,
            }))?;
            log.append(&ChangeRecord::Meta {
                gfid,
                kind: MetaKind::Setattr,
            })?;
            log.append(&ChangeRecord::Data { gfid })?;
        } else if stat.is_symlink() {
            // Symlinks carry no per-object watermark; the parent decided.
            let gfid = crate::changelog::Gfid::random();
            log.append(&ChangeRecord::Entry(EntryChange {
                gfid,
                verb: EntryVerb::Symlink,
                entry: EntryRef::new(parent_gfid, basename),
                entry1: None,
                mode: stat.mode,
                uid: stat.uid,
                gid: stat.gid,
            }))?;
        }
    }
    Ok(())
}

fn clamp(mark: MarkTime, upper: Option<MarkTime>) -> MarkTime {
    match upper {
        Some(limit) if mark > limit => limit,
        _ => mark,
    }
}

fn send(tx: &Sender<XsyncEvent>, event: XsyncEvent) -> Result<()> {
    tx.send(event)
        .map_err(|_| eyre!("xsync consumer went away"))
}

/// Changelog-shaped buffer for synthetic records: one file per
/// `flush_at` entries, handed to the consumer on every flush.
struct SyntheticLog {
    dir: PathBuf,
    tx: Sender<XsyncEvent>,
    seq: i64,
    count: usize,
    flush_at: usize,
    current: Option<(PathBuf, BufWriter<fs::File>)>,
}

impl SyntheticLog {
    fn new(dir: &Path, flush_at: usize, tx: Sender<XsyncEvent>) -> SyntheticLog {
        SyntheticLog {
            dir: dir.to_path_buf(),
            tx,
            seq: MarkTime::now().sec,
            count: 0,
            flush_at: flush_at.max(1),
            current: None,
        }
    }

    fn append(&mut self, record: &ChangeRecord) -> Result<()> {
        if self.current.is_none() {
            let path = self.dir.join(format!("{}{}", XSYNC_PREFIX, self.seq));
            let file = fs::File::create(&path)
                .wrap_err_with(|| format!("failed to create {}", path.display()))?;
            self.current = Some((path, BufWriter::new(file)));
        }
        let (_, writer) = self.current.as_mut().expect("just ensured");
        writeln!(writer, "{}", record.to_line())?;
        self.count += 1;
        if self.count >= self.flush_at {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some((path, mut writer)) = self.current.take() {
            writer.flush()?;
            drop(writer);
            send(&self.tx, XsyncEvent::Batch(path))?;
        }
        self.count = 0;
        self.seq += 1;
        Ok(())
    }
}
