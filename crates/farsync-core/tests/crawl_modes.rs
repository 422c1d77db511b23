//! Crawler selection: history outcomes and the live changelog cycle.

mod common;

use std::fs;
use std::path::Path;

use eyre::Result;

use common::Harness;
use farsync_core::crawl::changelog::changelog_crawl;
use farsync_core::crawl::history::history_crawl;
use farsync_core::crawl::HistoryOutcome;
use farsync_core::endpoint::Endpoint;
use farsync_core::marker::MarkTime;

#[test]
fn history_without_a_watermark_reports_no_stime() -> Result<()> {
    let h = Harness::new()?;
    let register = h.primary.changelog_register()?;
    let (outcome, _stats) = history_crawl(&h.processor(), register)?;
    assert_eq!(outcome, HistoryOutcome::NoStime);
    Ok(())
}

#[test]
fn history_with_no_surviving_changelogs_is_unavailable() -> Result<()> {
    let h = Harness::new()?;
    h.markers
        .set_stime(&h.secondary, Path::new("."), MarkTime::new(500, 0))?;
    let register = h.primary.changelog_register()?;
    let (outcome, _stats) = history_crawl(&h.processor(), register)?;
    assert_eq!(outcome, HistoryOutcome::Unavailable);
    Ok(())
}

#[test]
fn history_replays_covered_changelogs_and_reports_partial() -> Result<()> {
    let h = Harness::new()?;
    let (uid, gid) = Harness::ids();

    fs::write(h.primary.root().join("f"), b"from history")?;
    let gfid = h.primary.gfid(Path::new("f"))?;

    let ts = 1_700_000_600;
    h.write_changelog(
        ts,
        &[
            format!(
                "E {gfid} CREATE 420 {uid} {gid} {}/f",
                farsync_core::changelog::ROOT_GFID
            ),
            format!("D {gfid}"),
        ],
    )?;
    // The watermark sits within rollover reach of that changelog.
    h.markers
        .set_stime(&h.secondary, Path::new("."), MarkTime::new(ts - 10, 0))?;

    let register = h.primary.changelog_register()?;
    let (outcome, stats) = history_crawl(&h.processor(), register)?;

    // Registration happened "now", far past the newest changelog: partial.
    assert_eq!(outcome, HistoryOutcome::Partial { end: ts });
    assert_eq!(stats.files_transferred, 1);
    assert_eq!(fs::read(h.secondary.root().join("f"))?, b"from history");
    assert_eq!(h.root_stime(), Some(MarkTime::new(ts - 1, 0)));
    Ok(())
}

#[test]
fn live_crawl_processes_acks_and_advances() -> Result<()> {
    let h = Harness::new()?;
    let (uid, gid) = Harness::ids();
    h.primary.changelog_register()?;

    fs::write(h.primary.root().join("live"), b"live data")?;
    let gfid = h.primary.gfid(Path::new("live"))?;
    // Rolled over after registration.
    let ts = 1_900_000_700;
    h.write_changelog(
        ts,
        &[
            format!(
                "E {gfid} CREATE 420 {uid} {gid} {}/live",
                farsync_core::changelog::ROOT_GFID
            ),
            format!("D {gfid}"),
        ],
    )?;

    let stats = changelog_crawl(&h.processor())?;
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.files_transferred, 1);
    assert_eq!(fs::read(h.secondary.root().join("live"))?, b"live data");
    assert_eq!(h.root_stime(), Some(MarkTime::new(ts - 1, 0)));

    // Fully-acked changelogs are archived, not reprocessed.
    assert!(h
        .config
        .processed_dir()
        .join(format!("CHANGELOG.{ts}"))
        .exists());
    assert!(!h
        .config
        .processing_dir()
        .join(format!("CHANGELOG.{ts}"))
        .exists());
    let stats = changelog_crawl(&h.processor())?;
    assert_eq!(stats.batches, 0);
    Ok(())
}

#[test]
fn live_crawl_batches_by_cumulative_size() -> Result<()> {
    let mut h = Harness::new()?;
    h.config.batch_max_bytes = 1; // every changelog forms its own batch
    let (uid, gid) = Harness::ids();
    h.primary.changelog_register()?;

    for (i, ts) in [(1, 1_900_000_800i64), (2, 1_900_000_815)] {
        let name = format!("b{i}");
        fs::write(h.primary.root().join(&name), format!("content {i}"))?;
        let gfid = h.primary.gfid(Path::new(&name))?;
        h.write_changelog(
            ts,
            &[
                format!(
                    "E {gfid} CREATE 420 {uid} {gid} {}/{name}",
                    farsync_core::changelog::ROOT_GFID
                ),
                format!("D {gfid}"),
            ],
        )?;
    }

    let stats = changelog_crawl(&h.processor())?;
    assert_eq!(stats.batches, 2);
    assert!(h.secondary.root().join("b1").exists());
    assert!(h.secondary.root().join("b2").exists());
    // The watermark reflects the newest fully-confirmed batch.
    assert_eq!(h.root_stime(), Some(MarkTime::new(1_900_000_814, 0)));
    Ok(())
}
