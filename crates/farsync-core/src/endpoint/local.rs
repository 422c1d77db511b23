//! In-process endpoint: direct filesystem calls against a brick root.
//!
//! Layout owned by this endpoint:
//! - `<root>/.farsync-ids/<xx>/<gfid>` — the gfid backing store. Regular
//!   files are hard-linked here (the store alias is a real name for the
//!   inode, so bulk transfers can land content by gfid); directories are
//!   recorded as a symlink whose target is the brick-relative canonical
//!   path. Symlink objects carry no gfid: their identity is parent + name +
//!   target.
//! - `<working_dir>/.processing` — changelogs staged for the current run.
//! - `<working_dir>/.processed` — fully-acked changelogs, kept for operator
//!   forensics.
//! - `<working_dir>/.tracker` — highest rollover timestamp already staged.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::changelog::{changelog_ts, Gfid, CHANGELOG_PREFIX, ROOT_GFID};
use crate::errors::errno_error;
use crate::marker::{MarkTime, SessionId};
use crate::volinfo::VolumeMark;

use super::entry_ops;
use super::{EntryFailure, EntryRecord, Endpoint, FileStat, MetaFailure, MetaRecord, SetattrSpec};

pub(crate) const STORE_DIR: &str = ".farsync-ids";

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Xattr namespace prefix for marks and gfids.
    pub xattr_namespace: String,
    /// Staging area for the changelog consumer.
    pub working_dir: PathBuf,
    /// Where the changelog producer rolls `CHANGELOG.<ts>` files; `None`
    /// means this brick has no changelog facility (xsync-only primaries,
    /// plain secondaries).
    pub changelog_dir: Option<PathBuf>,
    /// Authoritative (primary) side: lazily stamp identity on untagged
    /// objects instead of failing the lookup.
    pub authoritative: bool,
    /// Node uuids serving this brick, for role gating.
    pub node_ids: Vec<Uuid>,
    /// Changelog rollover period, for history coverage checks.
    pub rollover_secs: i64,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            xattr_namespace: "user.farsync".to_string(),
            working_dir: PathBuf::new(),
            changelog_dir: None,
            authoritative: false,
            node_ids: Vec::new(),
            rollover_secs: 15,
        }
    }
}

#[derive(Debug, Default)]
struct ChangelogTracker {
    /// Highest rollover ts already copied into `.processing`.
    staged_through: i64,
}

pub struct LocalEndpoint {
    root: PathBuf,
    opts: EndpointOptions,
    beats: AtomicU64,
    foreign_marks: Mutex<Vec<VolumeMark>>,
    tracker: Mutex<ChangelogTracker>,
    history_queue: Mutex<Vec<PathBuf>>,
}

impl LocalEndpoint {
    pub fn new(root: impl Into<PathBuf>, opts: EndpointOptions) -> io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("brick root {} is not a directory", root.display()),
            ));
        }
        let staged_through = if opts.working_dir.as_os_str().is_empty() {
            0
        } else {
            fs::read_to_string(opts.working_dir.join(".tracker"))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0)
        };
        Ok(Self {
            root,
            opts,
            beats: AtomicU64::new(0),
            foreign_marks: Mutex::new(Vec::new()),
            tracker: Mutex::new(ChangelogTracker { staged_through }),
            history_queue: Mutex::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.opts
    }

    /// Resolve a brick-relative path against the root, rejecting traversal.
    pub(crate) fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        let mut abs = self.root.clone();
        for comp in path.components() {
            match comp {
                Component::Normal(name) => abs.push(name),
                Component::CurDir | Component::RootDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path {} escapes the brick root", path.display()),
                    ))
                }
            }
        }
        Ok(abs)
    }

    fn mark_key(&self, id: &SessionId, which: &str) -> String {
        format!("{}.{}.{}", self.opts.xattr_namespace, id, which)
    }

    fn gfid_key(&self) -> String {
        format!("{}.gfid", self.opts.xattr_namespace)
    }

    fn read_mark(&self, path: &Path, id: &SessionId, which: &str) -> io::Result<MarkTime> {
        let abs = self.resolve(path)?;
        match xattr::get(&abs, self.mark_key(id, which))? {
            Some(buf) => MarkTime::decode(&buf),
            None => Err(errno_error(libc::ENODATA)),
        }
    }

    fn write_mark(
        &self,
        path: &Path,
        id: &SessionId,
        which: &str,
        mark: MarkTime,
    ) -> io::Result<()> {
        let abs = self.resolve(path)?;
        xattr::set(&abs, self.mark_key(id, which), &mark.encode())
    }

    /// Brick-relative store alias for a gfid.
    pub(crate) fn store_rel(&self, gfid: &Gfid) -> PathBuf {
        let hex = gfid.0.simple().to_string();
        Path::new(STORE_DIR).join(&hex[..2]).join(gfid.to_string())
    }

    pub(crate) fn store_abs(&self, gfid: &Gfid) -> PathBuf {
        self.root.join(self.store_rel(gfid))
    }

    /// On-disk identity of the object at an absolute path, without any
    /// lazy stamping. ENODATA when untagged, ENOENT when absent.
    pub(crate) fn disk_gfid_abs(&self, abs: &Path) -> io::Result<Gfid> {
        let md = fs::symlink_metadata(abs)?;
        if md.file_type().is_symlink() {
            return Err(errno_error(libc::ENODATA));
        }
        match xattr::get(abs, self.gfid_key())? {
            Some(buf) if buf.len() == 16 => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&buf);
                Ok(Gfid::from_bytes(raw))
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "gfid xattr is not 16 bytes",
            )),
            None => Err(errno_error(libc::ENODATA)),
        }
    }

    /// Stamp identity on an object and register it in the backing store.
    pub(crate) fn stamp_gfid(&self, abs: &Path, gfid: &Gfid) -> io::Result<()> {
        xattr::set(abs, self.gfid_key(), gfid.as_bytes())?;
        self.link_into_store(abs, gfid)
    }

    pub(crate) fn link_into_store(&self, abs: &Path, gfid: &Gfid) -> io::Result<()> {
        let store = self.store_abs(gfid);
        if let Some(parent) = store.parent() {
            fs::create_dir_all(parent)?;
        }
        let md = fs::symlink_metadata(abs)?;
        if md.is_dir() {
            let rel = abs
                .strip_prefix(&self.root)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path outside brick"))?;
            let _ = fs::remove_file(&store);
            std::os::unix::fs::symlink(rel, &store)
        } else {
            match fs::hard_link(abs, &store) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                Err(err) => Err(err),
            }
        }
    }

    /// Drop the store alias once the last real name of a file is gone.
    pub(crate) fn prune_store(&self, gfid: &Gfid) -> io::Result<()> {
        let store = self.store_abs(gfid);
        match fs::symlink_metadata(&store) {
            Ok(md) => {
                if md.file_type().is_symlink() || md.nlink() <= 1 {
                    fs::remove_file(&store)?;
                }
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Absolute path of the directory a parent gfid denotes.
    pub(crate) fn parent_abs(&self, parent: &Gfid) -> io::Result<PathBuf> {
        if *parent == ROOT_GFID {
            return Ok(self.root.clone());
        }
        let rel = self.gfid_path_inner(parent)?;
        self.resolve(&rel)
    }

    fn gfid_path_inner(&self, gfid: &Gfid) -> io::Result<PathBuf> {
        if *gfid == ROOT_GFID {
            return Ok(PathBuf::from("."));
        }
        let store = self.store_abs(gfid);
        let md = fs::symlink_metadata(&store)?;
        if md.file_type().is_symlink() {
            Ok(fs::read_link(&store)?)
        } else {
            Ok(self.store_rel(gfid))
        }
    }

    fn processing_dir(&self) -> PathBuf {
        self.opts.working_dir.join(".processing")
    }

    fn processed_dir(&self) -> PathBuf {
        self.opts.working_dir.join(".processed")
    }

    fn changelog_dir(&self) -> io::Result<&Path> {
        self.opts
            .changelog_dir
            .as_deref()
            .ok_or_else(|| errno_error(libc::ENOTSUP))
    }

    /// Rollover timestamps available from the producer, sorted ascending.
    fn available_changelogs(&self) -> io::Result<Vec<(i64, PathBuf)>> {
        let dir = self.changelog_dir()?;
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(ts) = changelog_ts(&path) {
                found.push((ts, path));
            }
        }
        found.sort_by_key(|(ts, _)| *ts);
        Ok(found)
    }

    fn persist_tracker(&self, staged_through: i64) -> io::Result<()> {
        fs::write(
            self.opts.working_dir.join(".tracker"),
            format!("{staged_through}\n"),
        )
    }
}

impl Endpoint for LocalEndpoint {
    fn root(&self) -> &Path {
        &self.root
    }

    fn entries(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let abs = self.resolve(path)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&abs)? {
            let name = entry?.file_name();
            if abs == self.root && name == STORE_DIR {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn lstat(&self, path: &Path) -> io::Result<FileStat> {
        let abs = self.resolve(path)?;
        Ok(FileStat::from_metadata(&fs::symlink_metadata(abs)?))
    }

    fn readlink(&self, path: &Path) -> io::Result<String> {
        let abs = self.resolve(path)?;
        Ok(fs::read_link(abs)?.to_string_lossy().into_owned())
    }

    fn gfid(&self, path: &Path) -> io::Result<Gfid> {
        let abs = self.resolve(path)?;
        if abs == self.root {
            return Ok(ROOT_GFID);
        }
        match self.disk_gfid_abs(&abs) {
            Ok(gfid) => Ok(gfid),
            Err(err) if self.opts.authoritative && err.raw_os_error() == Some(libc::ENODATA) => {
                if fs::symlink_metadata(&abs)?.file_type().is_symlink() {
                    return Err(err);
                }
                let fresh = Gfid::random();
                self.stamp_gfid(&abs, &fresh)?;
                Ok(fresh)
            }
            Err(err) => Err(err),
        }
    }

    fn gfid_path(&self, gfid: &Gfid) -> io::Result<PathBuf> {
        self.gfid_path_inner(gfid)
    }

    fn xtime(&self, path: &Path, id: &SessionId) -> io::Result<MarkTime> {
        self.read_mark(path, id, "xtime")
    }

    fn stime(&self, path: &Path, id: &SessionId) -> io::Result<MarkTime> {
        self.read_mark(path, id, "stime")
    }

    fn entry_stime(&self, path: &Path, id: &SessionId) -> io::Result<MarkTime> {
        self.read_mark(path, id, "entry_stime")
    }

    fn set_xtime(&self, path: &Path, id: &SessionId, mark: MarkTime) -> io::Result<()> {
        self.write_mark(path, id, "xtime", mark)
    }

    fn set_stime(&self, path: &Path, id: &SessionId, mark: MarkTime) -> io::Result<()> {
        self.write_mark(path, id, "stime", mark)
    }

    fn set_entry_stime(&self, path: &Path, id: &SessionId, mark: MarkTime) -> io::Result<()> {
        self.write_mark(path, id, "entry_stime", mark)
    }

    fn entry_ops(&self, records: &[EntryRecord]) -> Vec<EntryFailure> {
        let mut failures = Vec::new();
        for record in records {
            if record.skip {
                continue;
            }
            if let Some(failure) = entry_ops::apply_entry(self, record) {
                failures.push(failure);
            }
        }
        failures
    }

    fn meta_ops(&self, records: &[MetaRecord]) -> Vec<MetaFailure> {
        let mut failures = Vec::new();
        for record in records {
            let result = self
                .gfid_path(&record.gfid)
                .and_then(|rel| self.setattr(&rel, &record.attrs));
            if let Err(err) = result {
                debug!("meta op on {} failed: {err}", record.gfid);
                failures.push(MetaFailure {
                    record: record.clone(),
                    errno: crate::errors::errno_of(&err),
                });
            }
        }
        failures
    }

    fn setattr(&self, path: &Path, attrs: &SetattrSpec) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let abs = self.resolve(path)?;
        if let Some(mode) = attrs.mode {
            fs::set_permissions(&abs, fs::Permissions::from_mode(mode))?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            std::os::unix::fs::chown(&abs, attrs.uid, attrs.gid)?;
        }
        if let Some((atime, mtime)) = attrs.times {
            filetime::set_file_times(
                &abs,
                filetime::FileTime::from_unix_time(atime, 0),
                filetime::FileTime::from_unix_time(mtime, 0),
            )?;
        }
        Ok(())
    }

    fn purge(&self, path: &Path, names: Option<&[OsString]>) -> io::Result<()> {
        let abs = self.resolve(path)?;
        let owned: Vec<OsString>;
        let targets: &[OsString] = match names {
            Some(names) => names,
            None => {
                owned = self.entries(path)?;
                &owned
            }
        };
        for name in targets {
            entry_ops::remove_object(self, &abs.join(name))?;
        }
        Ok(())
    }

    fn keep_alive(&self, mark: Option<&VolumeMark>) -> io::Result<u64> {
        let beat = self.beats.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mark) = mark {
            let now = MarkTime::now().sec;
            let mut marks = self.foreign_marks.lock();
            match marks.iter_mut().find(|m| m.uuid == mark.uuid) {
                Some(existing) => existing.refresh(now, mark.timeout),
                None => {
                    let mut stored = mark.clone();
                    let window = stored.timeout;
                    stored.refresh(now, window);
                    marks.push(stored);
                }
            }
            crate::volinfo::select_volume_mark(None, &marks, now)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("{err}")))?;
        }
        Ok(beat)
    }

    fn node_uuids(&self) -> io::Result<Vec<Uuid>> {
        Ok(self.opts.node_ids.clone())
    }

    fn changelog_register(&self) -> io::Result<MarkTime> {
        self.changelog_dir()?;
        fs::create_dir_all(self.processing_dir())?;
        fs::create_dir_all(self.processed_dir())?;
        let now = MarkTime::now();
        // Live consumption starts at registration; everything rolled over
        // before it is the history mechanism's territory. A persisted
        // tracker from an earlier run keeps its place.
        let mut tracker = self.tracker.lock();
        if tracker.staged_through == 0 {
            tracker.staged_through = now.sec;
            self.persist_tracker(now.sec)?;
        }
        Ok(now)
    }

    fn changelog_scan(&self) -> io::Result<()> {
        let mut tracker = self.tracker.lock();
        let mut staged_through = tracker.staged_through;
        for (ts, path) in self.available_changelogs()? {
            if ts <= tracker.staged_through {
                continue;
            }
            let name = path.file_name().unwrap_or_default().to_os_string();
            fs::copy(&path, self.processing_dir().join(&name))?;
            staged_through = staged_through.max(ts);
        }
        if staged_through != tracker.staged_through {
            tracker.staged_through = staged_through;
            self.persist_tracker(staged_through)?;
        }
        Ok(())
    }

    fn changelog_getchanges(&self) -> io::Result<Vec<PathBuf>> {
        let mut changes = Vec::new();
        for entry in fs::read_dir(self.processing_dir())? {
            let path = entry?.path();
            let is_live = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(CHANGELOG_PREFIX));
            if is_live && changelog_ts(&path).is_some() {
                changes.push(path);
            }
        }
        changes.sort_by_key(|p| changelog_ts(p));
        Ok(changes)
    }

    fn changelog_done(&self, change: &Path) -> io::Result<()> {
        let name = change
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "changelog has no name"))?;
        fs::rename(change, self.processed_dir().join(name))
    }

    fn history_changelog(&self, start: i64, end: i64, _jobs: usize) -> io::Result<i64> {
        let available = self.available_changelogs()?;
        if available.is_empty() {
            return Err(errno_error(libc::ENODATA));
        }
        let oldest = available[0].0;
        if oldest > start + self.opts.rollover_secs {
            // The gap between the watermark and the oldest surviving
            // changelog is unrecoverable from history alone.
            return Err(errno_error(libc::ENODATA));
        }
        let mut staged = Vec::new();
        let mut actual_end = start;
        for (ts, path) in available {
            if ts > start && ts <= end {
                actual_end = actual_end.max(ts);
                staged.push(path);
            }
        }
        *self.history_queue.lock() = staged;
        // Everything handed to history replay is consumed; the live tracker
        // must not stage the same rollovers again or the watermark would
        // move backwards on their re-commit.
        {
            let mut tracker = self.tracker.lock();
            if actual_end > tracker.staged_through {
                tracker.staged_through = actual_end;
                if !self.opts.working_dir.as_os_str().is_empty() {
                    let _ = self.persist_tracker(actual_end);
                }
            }
        }
        Ok(actual_end)
    }

    fn history_scan(&self) -> io::Result<usize> {
        Ok(self.history_queue.lock().len())
    }

    fn history_getchanges(&self) -> io::Result<Vec<PathBuf>> {
        Ok(std::mem::take(&mut *self.history_queue.lock()))
    }

    fn history_done(&self, _change: &Path) -> io::Result<()> {
        // History replays straight out of the producer's directory; there is
        // nothing to archive.
        Ok(())
    }
}
