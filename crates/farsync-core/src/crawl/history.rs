//! Historical changelog replay: a one-shot catch-up between the persisted
//! watermark and "now", replaying rolled-over changelogs the producer still
//! has on disk.

use std::path::Path;

use eyre::{Context, Result};
use log::info;

use crate::batch::BatchProcessor;
use crate::changelog::batch_changes;
use crate::errors::errno_of;
use crate::marker::MarkTime;

use super::{stime_or_unsynced, CrawlStats, HistoryOutcome};

/// Attempt history replay. `register_time` is when live changelog coverage
/// began; history that stops short of it is partial.
pub fn history_crawl(
    processor: &BatchProcessor<'_>,
    register_time: MarkTime,
) -> Result<(HistoryOutcome, CrawlStats)> {
    let mut stats = CrawlStats::default();

    let stime = stime_or_unsynced(processor.markers, processor.secondary, Path::new("."))
        .wrap_err("failed to read the secondary watermark")?;
    if stime.is_unsynced() {
        return Ok((HistoryOutcome::NoStime, stats));
    }

    let now = MarkTime::now().sec;
    let actual_end = match processor
        .primary
        .history_changelog(stime.sec, now, processor.config.sync_jobs)
    {
        Ok(end) => end,
        Err(err) if errno_of(&err) == libc::ENODATA => {
            return Ok((HistoryOutcome::Unavailable, stats));
        }
        Err(err) => return Err(err).wrap_err("history request failed"),
    };

    info!(
        "history replay from {} covering through {actual_end}",
        stime.sec
    );

    while processor.primary.history_scan()? > 0 {
        let changes = processor.primary.history_getchanges()?;
        if changes.is_empty() {
            break;
        }
        let batches = batch_changes(changes, processor.config.batch_max_bytes)?;
        for batch in batches {
            stats.absorb(processor.process_batch(&batch, Path::new("."))?);
            for file in &batch.files {
                processor.primary.history_done(file)?;
            }
        }
    }

    if actual_end < register_time.sec {
        Ok((HistoryOutcome::Partial { end: actual_end }, stats))
    } else {
        Ok((HistoryOutcome::Done { end: actual_end }, stats))
    }
}
