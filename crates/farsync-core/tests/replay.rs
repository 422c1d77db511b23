//! Changelog replay scenarios against a live primary/secondary pair.

mod common;

use std::fs;
use std::path::Path;

use eyre::Result;

use common::Harness;
use farsync_core::changelog::{ChangelogBatch, Gfid, ROOT_GFID};
use farsync_core::endpoint::Endpoint;
use farsync_core::marker::MarkTime;

#[test]
fn mkdir_and_data_batch_advances_stime() -> Result<()> {
    let h = Harness::new()?;
    let (uid, gid) = Harness::ids();

    // Primary: /a (dir) containing a file with content.
    fs::create_dir(h.primary.root().join("a"))?;
    fs::write(h.primary.root().join("a/f"), b"hello replica")?;
    let dir_gfid = h.primary.gfid(Path::new("a"))?;
    let file_gfid = h.primary.gfid(Path::new("a/f"))?;

    // Secondary thinks it is synced through (50, 0).
    h.markers
        .set_stime(&h.secondary, Path::new("."), MarkTime::new(50, 0))?;

    let ts = 1_700_000_100;
    let file = h.write_changelog(
        ts,
        &[
            format!("E {dir_gfid} MKDIR 493 {uid} {gid} {ROOT_GFID}/a"),
            format!("E {file_gfid} CREATE 420 {uid} {gid} {dir_gfid}/f"),
            format!("D {file_gfid}"),
        ],
    )?;

    let batch = ChangelogBatch {
        files: vec![file],
        end_ts: ts,
    };
    let stats = h.processor().process_batch(&batch, Path::new("."))?;
    assert_eq!(stats.entry_failures, 0);
    assert_eq!(stats.files_transferred, 1);

    // The named entry and its content both landed.
    assert!(h.secondary.root().join("a").is_dir());
    let got = h.secondary.gfid(Path::new("a/f"))?;
    assert_eq!(got, file_gfid);
    assert_eq!(fs::read(h.secondary.root().join("a/f"))?, b"hello replica");

    // Watermark moved to one second before the rollover.
    assert_eq!(h.root_stime(), Some(MarkTime::new(ts - 1, 0)));
    assert_eq!(
        h.markers.entry_stime(&h.secondary, Path::new("."))?,
        MarkTime::new(ts - 1, 0)
    );
    Ok(())
}

#[test]
fn reprocessing_a_batch_is_idempotent() -> Result<()> {
    let h = Harness::new()?;
    let (uid, gid) = Harness::ids();

    fs::create_dir(h.primary.root().join("d"))?;
    fs::write(h.primary.root().join("d/f"), b"once")?;
    let dir_gfid = h.primary.gfid(Path::new("d"))?;
    let file_gfid = h.primary.gfid(Path::new("d/f"))?;

    let ts = 1_700_000_200;
    let file = h.write_changelog(
        ts,
        &[
            format!("E {dir_gfid} MKDIR 493 {uid} {gid} {ROOT_GFID}/d"),
            format!("E {file_gfid} CREATE 420 {uid} {gid} {dir_gfid}/f"),
            format!("D {file_gfid}"),
        ],
    )?;

    // A worker crash after applying ops but before the marker commit means
    // the same batch is replayed on restart.
    let first = h.processor().process_files(std::slice::from_ref(&file));
    assert!(first.is_ok());
    let second = h
        .processor()
        .process_files(std::slice::from_ref(&file))
        .expect("replay must not fail");
    assert_eq!(second.entry_failures, 0);

    assert_eq!(fs::read(h.secondary.root().join("d/f"))?, b"once");
    Ok(())
}

#[test]
fn gfid_conflict_is_repaired_by_synthesized_unlink() -> Result<()> {
    let h = Harness::new()?;
    let (uid, gid) = Harness::ids();

    // The secondary holds an object at "c" whose identity exists nowhere on
    // the primary (a leftover from a skipped batch).
    let stale = Gfid::random();
    let ts0 = 1_700_000_250;
    let seed = h.write_changelog(
        ts0,
        &[format!("E {stale} CREATE 420 {uid} {gid} {ROOT_GFID}/c")],
    )?;
    h.processor().process_files(std::slice::from_ref(&seed))?;
    assert_eq!(h.secondary.gfid(Path::new("c"))?, stale);

    // The primary's current truth: "c" is a different object.
    fs::write(h.primary.root().join("c"), b"current")?;
    let current = h.primary.gfid(Path::new("c"))?;

    let ts = 1_700_000_300;
    let file = h.write_changelog(
        ts,
        &[
            format!("E {current} CREATE 420 {uid} {gid} {ROOT_GFID}/c"),
            format!("D {current}"),
        ],
    )?;
    let stats = h.processor().process_files(std::slice::from_ref(&file))?;
    assert_eq!(stats.entry_failures, 0);

    // The conflicting object was unlinked and the create re-applied.
    assert_eq!(h.secondary.gfid(Path::new("c"))?, current);
    assert_eq!(fs::read(h.secondary.root().join("c"))?, b"current");
    assert!(h.secondary.gfid_path(&stale).is_err());
    Ok(())
}

#[test]
fn data_for_a_gfid_unlinked_in_the_same_batch_is_not_transferred() -> Result<()> {
    let h = Harness::new()?;
    let (uid, gid) = Harness::ids();

    fs::write(h.primary.root().join("tmpfile"), b"short-lived")?;
    let gfid = h.primary.gfid(Path::new("tmpfile"))?;

    let ts = 1_700_000_400;
    let file = h.write_changelog(
        ts,
        &[
            format!("E {gfid} CREATE 420 {uid} {gid} {ROOT_GFID}/tmpfile"),
            format!("D {gfid}"),
            format!("E {gfid} UNLINK {ROOT_GFID}/tmpfile"),
        ],
    )?;
    let stats = h.processor().process_files(std::slice::from_ref(&file))?;

    assert_eq!(stats.files_transferred, 0);
    assert!(!h.secondary.root().join("tmpfile").exists());
    Ok(())
}

#[test]
fn rename_replay_moves_the_secondary_name() -> Result<()> {
    let h = Harness::new()?;
    let (uid, gid) = Harness::ids();

    fs::write(h.primary.root().join("old"), b"payload")?;
    let gfid = h.primary.gfid(Path::new("old"))?;

    let ts1 = 1_700_000_500;
    let create = h.write_changelog(
        ts1,
        &[
            format!("E {gfid} CREATE 420 {uid} {gid} {ROOT_GFID}/old"),
            format!("D {gfid}"),
        ],
    )?;
    h.processor().process_files(std::slice::from_ref(&create))?;
    assert!(h.secondary.root().join("old").exists());

    // Primary renames old -> new; the changelog records it.
    fs::rename(h.primary.root().join("old"), h.primary.root().join("new"))?;
    let ts2 = ts1 + 15;
    let rename = h.write_changelog(
        ts2,
        &[format!("E {gfid} RENAME {ROOT_GFID}/old {ROOT_GFID}/new")],
    )?;
    let stats = h.processor().process_files(std::slice::from_ref(&rename))?;
    assert_eq!(stats.entry_failures, 0);

    assert!(!h.secondary.root().join("old").exists());
    assert_eq!(fs::read(h.secondary.root().join("new"))?, b"payload");
    Ok(())
}
