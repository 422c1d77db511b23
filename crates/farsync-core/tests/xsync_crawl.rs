//! Full-tree fallback crawl scenarios.

mod common;

use std::fs;
use std::path::Path;

use eyre::Result;

use common::Harness;
use farsync_core::crawl::xsync::xsync_crawl;
use farsync_core::endpoint::Endpoint;
use farsync_core::marker::MarkTime;

#[test]
fn full_tree_crawl_replicates_and_stamps_root_stime() -> Result<()> {
    let h = Harness::new()?;

    // Primary tree: /d (dir) with one regular file; secondary never synced.
    fs::create_dir(h.primary.root().join("d"))?;
    fs::write(h.primary.root().join("d/f"), b"xsync payload")?;

    let stats = xsync_crawl(&h.processor(), None)?;
    assert!(stats.batches >= 1);
    assert_eq!(stats.entry_failures, 0);
    assert_eq!(stats.files_transferred, 1);

    assert!(h.secondary.root().join("d").is_dir());
    assert_eq!(fs::read(h.secondary.root().join("d/f"))?, b"xsync payload");

    // Root stime equals the primary's root xtime.
    let root_xtime = h.markers.xtime(&h.primary, Path::new("."))?;
    assert_eq!(h.root_stime(), Some(root_xtime));

    // The synthetic changelog shows the canonical emission order: the MKDIR
    // for /d precedes the MKNOD and D records for /d/f.
    let xsync_dir = h.config.working_dir.join("xsync");
    let mut text = String::new();
    for entry in fs::read_dir(&xsync_dir)? {
        text.push_str(&fs::read_to_string(entry?.path())?);
    }
    let mkdir_at = text.find("MKDIR").expect("MKDIR record emitted");
    let mknod_at = text.find("MKNOD").expect("MKNOD record emitted");
    let data_at = text.find("\nD ").expect("data record emitted");
    assert!(mkdir_at < mknod_at);
    assert!(mknod_at < data_at);
    Ok(())
}

#[test]
fn covered_subtrees_are_skipped_entirely() -> Result<()> {
    let h = Harness::new()?;

    fs::create_dir(h.primary.root().join("d"))?;
    fs::write(h.primary.root().join("d/f"), b"v1")?;

    let stats = xsync_crawl(&h.processor(), None)?;
    assert_eq!(stats.files_transferred, 1);

    // Nothing changed: the second crawl compares equal and syncs nothing.
    let stats = xsync_crawl(&h.processor(), None)?;
    assert_eq!(stats.files_transferred, 0);
    assert_eq!(stats.batches, 0);
    Ok(())
}

#[test]
fn stime_is_clamped_to_live_coverage_start() -> Result<()> {
    let h = Harness::new()?;

    fs::write(h.primary.root().join("f"), b"x")?;

    // Live changelog coverage began long before the files' xtimes.
    let limit = MarkTime::new(100, 0);
    xsync_crawl(&h.processor(), Some(limit))?;

    // Content synced, but the watermark must not overtake the limit, or the
    // deletes/renames queued behind it would never replay.
    assert_eq!(fs::read(h.secondary.root().join("f"))?, b"x");
    assert_eq!(h.root_stime(), Some(limit));
    Ok(())
}

#[test]
fn hardlinked_files_are_emitted_as_links() -> Result<()> {
    let h = Harness::new()?;

    fs::write(h.primary.root().join("one"), b"shared")?;
    fs::hard_link(h.primary.root().join("one"), h.primary.root().join("two"))?;

    let stats = xsync_crawl(&h.processor(), None)?;
    assert_eq!(stats.entry_failures, 0);

    // Both names exist on the secondary and share an inode.
    use std::os::unix::fs::MetadataExt;
    let a = fs::metadata(h.secondary.root().join("one"))?;
    let b = fs::metadata(h.secondary.root().join("two"))?;
    assert_eq!(a.ino(), b.ino());
    assert_eq!(fs::read(h.secondary.root().join("one"))?, b"shared");
    Ok(())
}

#[test]
fn symlinks_are_recreated_with_their_targets() -> Result<()> {
    let h = Harness::new()?;

    fs::write(h.primary.root().join("target"), b"t")?;
    std::os::unix::fs::symlink("target", h.primary.root().join("alias"))?;

    xsync_crawl(&h.processor(), None)?;

    let link = h.secondary.root().join("alias");
    assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
    assert_eq!(fs::read_link(&link)?, Path::new("target"));
    Ok(())
}
