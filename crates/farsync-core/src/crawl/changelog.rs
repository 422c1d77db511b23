//! Live changelog crawl: consume newly rolled-over changelogs, batch them by
//! cumulative size, process each batch, ack what is fully synced.

use std::path::Path;

use eyre::Result;
use log::debug;

use crate::batch::BatchProcessor;
use crate::changelog::batch_changes;

use super::CrawlStats;

/// One live-crawl iteration. Returns the totals; an empty iteration simply
/// found no new rollovers.
pub fn changelog_crawl(processor: &BatchProcessor<'_>) -> Result<CrawlStats> {
    let mut stats = CrawlStats::default();

    processor.primary.changelog_scan()?;
    let changes = processor.primary.changelog_getchanges()?;
    if changes.is_empty() {
        return Ok(stats);
    }
    debug!("live crawl picked up {} changelogs", changes.len());

    let batches = batch_changes(changes, processor.config.batch_max_bytes)?;
    for batch in batches {
        stats.absorb(processor.process_batch(&batch, Path::new("."))?);
        for file in &batch.files {
            processor.primary.changelog_done(file)?;
        }
    }
    Ok(stats)
}
