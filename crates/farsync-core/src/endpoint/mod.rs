//! The remote procedure surface: every way the core talks to a primary or
//! secondary storage endpoint.
//!
//! An endpoint is either in-process (direct filesystem calls against a brick
//! root, [`LocalEndpoint`]) or a proxy over an opaque transport to a remote
//! peer exposing the same method set. The core only ever sees this trait;
//! transport framing lives outside the repo.
//!
//! All paths are brick-relative. Errors carry errnos (`std::io::Error`) so
//! callers can classify ENOENT/EEXIST/ENOTEMPTY/ENODATA per record.

mod entry_ops;
mod local;

pub use entry_ops::EntryDescriptor;
pub use local::{EndpointOptions, LocalEndpoint};

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::changelog::{EntryRef, EntryVerb, Gfid};
use crate::marker::{MarkTime, SessionId};
use crate::volinfo::VolumeMark;

/// Stat tuple as carried in change records and setattr passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u64,
    pub atime: i64,
    pub mtime: i64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFREG
    }

    /// Permission bits only, no file-type bits.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    #[cfg(unix)]
    pub fn from_metadata(md: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            size: md.size(),
            nlink: md.nlink(),
            atime: md.atime(),
            mtime: md.mtime(),
        }
    }
}

/// Attribute changes applied by a SETATTR pass: chmod, then chown, then
/// utime, first failure wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetattrSpec {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// (atime, mtime), seconds.
    pub times: Option<(i64, i64)>,
}

impl SetattrSpec {
    pub fn from_stat(stat: &FileStat) -> Self {
        Self {
            mode: Some(stat.perm()),
            uid: Some(stat.uid),
            gid: Some(stat.gid),
            times: Some((stat.atime, stat.mtime)),
        }
    }
}

/// A fully-resolved entry operation ready to apply on the secondary.
///
/// This is the changelog [`EntryChange`](crate::changelog::EntryChange)
/// after the batch processor has resolved everything that needs a live look
/// at the primary (rename stats, symlink targets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub op: EntryVerb,
    pub gfid: Gfid,
    pub entry: EntryRef,
    /// Rename destination.
    pub entry1: Option<EntryRef>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Primary-side stat, where the op needs one (rename fallback create).
    pub stat: Option<FileStat>,
    /// Symlink target.
    pub link: Option<String>,
    /// Repair flag: a record marked skipped is not applied on resubmission.
    pub skip: bool,
}

impl EntryRecord {
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.op.as_str(), self.gfid, self.entry)
    }
}

/// A metadata operation: attribute sync for one gfid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub gfid: Gfid,
    pub attrs: SetattrSpec,
}

/// Secondary-side detail attached to an EEXIST create failure: what actually
/// occupies the entry name on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfidConflict {
    pub disk_gfid: Gfid,
    pub secondary_is_dir: bool,
}

/// One failed entry operation, reported back for the repair pass.
#[derive(Debug, Clone)]
pub struct EntryFailure {
    pub record: EntryRecord,
    pub errno: i32,
    pub conflict: Option<GfidConflict>,
}

/// One failed metadata operation.
#[derive(Debug, Clone)]
pub struct MetaFailure {
    pub record: MetaRecord,
    pub errno: i32,
}

/// The method-call interface to a storage endpoint.
pub trait Endpoint: Send + Sync {
    /// Brick root this endpoint serves (engines run relative to it).
    fn root(&self) -> &Path;

    fn entries(&self, path: &Path) -> io::Result<Vec<OsString>>;
    fn lstat(&self, path: &Path) -> io::Result<FileStat>;
    fn readlink(&self, path: &Path) -> io::Result<String>;

    /// Identity of the object at `path`.
    fn gfid(&self, path: &Path) -> io::Result<Gfid>;
    /// Backing-store reverse lookup: brick-relative canonical path of a
    /// directory gfid, or the store alias path of a file gfid.
    fn gfid_path(&self, gfid: &Gfid) -> io::Result<PathBuf>;

    fn xtime(&self, path: &Path, id: &SessionId) -> io::Result<MarkTime>;
    fn stime(&self, path: &Path, id: &SessionId) -> io::Result<MarkTime>;
    fn entry_stime(&self, path: &Path, id: &SessionId) -> io::Result<MarkTime>;
    fn set_xtime(&self, path: &Path, id: &SessionId, mark: MarkTime) -> io::Result<()>;
    fn set_stime(&self, path: &Path, id: &SessionId, mark: MarkTime) -> io::Result<()>;
    fn set_entry_stime(&self, path: &Path, id: &SessionId, mark: MarkTime) -> io::Result<()>;

    /// Apply entry operations; failures come back per record, never raised.
    fn entry_ops(&self, records: &[EntryRecord]) -> Vec<EntryFailure>;
    /// Apply metadata operations; same contract.
    fn meta_ops(&self, records: &[MetaRecord]) -> Vec<MetaFailure>;
    fn setattr(&self, path: &Path, attrs: &SetattrSpec) -> io::Result<()>;
    /// Remove `names` under `path`, or everything under it when `None`.
    fn purge(&self, path: &Path, names: Option<&[OsString]>) -> io::Result<()>;

    /// Keep-alive beat; `mark` carries the caller's volume mark (foreign
    /// from this endpoint's perspective). Returns the beat counter.
    fn keep_alive(&self, mark: Option<&VolumeMark>) -> io::Result<u64>;
    /// Node uuids serving this endpoint's brick, for role gating.
    fn node_uuids(&self) -> io::Result<Vec<Uuid>>;

    /// Register with the change-tracking facility. Returns registration time;
    /// failure is fatal for the worker.
    fn changelog_register(&self) -> io::Result<MarkTime>;
    fn changelog_scan(&self) -> io::Result<()>;
    fn changelog_getchanges(&self) -> io::Result<Vec<PathBuf>>;
    fn changelog_done(&self, change: &Path) -> io::Result<()>;

    /// Request history replay coverage for `[start, end]`. Returns the
    /// timestamp actually covered (may be short of `end`); ENODATA when the
    /// mechanism cannot cover the gap at all.
    fn history_changelog(&self, start: i64, end: i64, jobs: usize) -> io::Result<i64>;
    fn history_scan(&self) -> io::Result<usize>;
    fn history_getchanges(&self) -> io::Result<Vec<PathBuf>>;
    fn history_done(&self, change: &Path) -> io::Result<()>;
}
