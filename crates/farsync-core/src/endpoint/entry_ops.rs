//! Entry-operation application against the secondary brick.
//!
//! Creates go through a fixed-width binary descriptor — the wire contract
//! with the storage backend: gfid (16 bytes raw), then mode/uid/gid as u32
//! big-endian, then the basename NUL-terminated. The local backend decodes
//! the descriptor and materializes the inode; a foreign backend would
//! receive it as a single special xattr set on the parent directory.
//!
//! Destructive calls (rename, recursive delete) only proceed while the
//! on-disk gfid still matches the record: a mismatch means a concurrent
//! writer repurposed the path and the op is stale.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use log::{error, info, warn};

use crate::changelog::{EntryVerb, Gfid};
use crate::errors::{errno_error, errno_of};

use super::local::LocalEndpoint;
use super::{EntryFailure, EntryRecord, GfidConflict};

/// The binary create descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub gfid: Gfid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub basename: String,
}

impl EntryDescriptor {
    pub fn encode(&self) -> Vec<u8> {
        let name = self.basename.as_bytes();
        let mut buf = Vec::with_capacity(16 + 12 + name.len() + 1);
        buf.extend_from_slice(self.gfid.as_bytes());
        buf.extend_from_slice(&self.mode.to_be_bytes());
        buf.extend_from_slice(&self.uid.to_be_bytes());
        buf.extend_from_slice(&self.gid.to_be_bytes());
        buf.extend_from_slice(name);
        buf.push(0);
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < 16 + 12 + 1 || buf[buf.len() - 1] != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed entry descriptor",
            ));
        }
        let mut gfid = [0u8; 16];
        gfid.copy_from_slice(&buf[..16]);
        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let basename = std::str::from_utf8(&buf[28..buf.len() - 1])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "descriptor name not utf-8"))?
            .to_string();
        if basename.is_empty() || basename.contains('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "descriptor name invalid",
            ));
        }
        Ok(Self {
            gfid: Gfid::from_bytes(gfid),
            mode: word(16),
            uid: word(20),
            gid: word(24),
            basename,
        })
    }
}

fn descriptor_for(rec: &EntryRecord) -> EntryDescriptor {
    let (mode, uid, gid) = match rec.stat {
        Some(st) => (st.perm(), st.uid, st.gid),
        None => (rec.mode & 0o7777, rec.uid, rec.gid),
    };
    EntryDescriptor {
        gfid: rec.gfid,
        mode,
        uid,
        gid,
        basename: rec.entry.basename.clone(),
    }
}

enum BlobKind<'a> {
    Regular,
    Dir,
    Symlink(&'a str),
}

/// The create primitive: hand the encoded descriptor to the backend, which
/// materializes the inode under the parent.
fn create_from_blob(
    ep: &LocalEndpoint,
    parent_abs: &Path,
    blob: &[u8],
    kind: BlobKind<'_>,
) -> io::Result<()> {
    let desc = EntryDescriptor::decode(blob)?;
    let path = parent_abs.join(&desc.basename);
    match kind {
        BlobKind::Regular => {
            let store = ep.store_abs(&desc.gfid);
            if fs::symlink_metadata(&store).is_ok() {
                // Content already landed by gfid (data racing ahead of the
                // entry op); just give it its name.
                match fs::hard_link(&store, &path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err),
                }
                return Ok(());
            }
            fs::File::create(&path)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(desc.mode & 0o7777))?;
            std::os::unix::fs::chown(&path, Some(desc.uid), Some(desc.gid))?;
            ep.stamp_gfid(&path, &desc.gfid)
        }
        BlobKind::Dir => {
            match fs::create_dir(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
            fs::set_permissions(&path, fs::Permissions::from_mode(desc.mode & 0o7777))?;
            std::os::unix::fs::chown(&path, Some(desc.uid), Some(desc.gid))?;
            ep.stamp_gfid(&path, &desc.gfid)
        }
        BlobKind::Symlink(target) => std::os::unix::fs::symlink(target, &path),
    }
}

/// Whether the on-disk object at `abs` still carries the expected identity.
pub(crate) fn matching_disk_gfid(ep: &LocalEndpoint, abs: &Path, gfid: &Gfid) -> bool {
    matches!(ep.disk_gfid_abs(abs), Ok(found) if found == *gfid)
}

fn same_inode(a: &Path, b: &Path) -> bool {
    match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

fn fail(rec: &EntryRecord, errno: i32, conflict: Option<GfidConflict>) -> EntryFailure {
    EntryFailure {
        record: rec.clone(),
        errno,
        conflict,
    }
}

/// Existing-occupant check shared by the create verbs. `Ok(true)` means the
/// record is already applied and should be dropped silently.
fn check_occupant(
    ep: &LocalEndpoint,
    rec: &EntryRecord,
    path: &Path,
) -> Result<bool, EntryFailure> {
    match ep.disk_gfid_abs(path) {
        Ok(found) if found == rec.gfid => Ok(true),
        Ok(found) => {
            let is_dir = fs::symlink_metadata(path)
                .map(|md| md.is_dir())
                .unwrap_or(false);
            Err(fail(
                rec,
                libc::EEXIST,
                Some(GfidConflict {
                    disk_gfid: found,
                    secondary_is_dir: is_dir,
                }),
            ))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) if errno_of(&err) == libc::ENODATA => {
            // The name is taken by an object without identity (e.g. a
            // symlink); a genuine conflict with no gfid detail.
            Err(fail(rec, libc::EEXIST, None))
        }
        Err(err) => Err(fail(rec, errno_of(&err), None)),
    }
}

pub(super) fn apply_entry(ep: &LocalEndpoint, rec: &EntryRecord) -> Option<EntryFailure> {
    match run_entry(ep, rec) {
        Ok(()) => None,
        Err(failure) => Some(failure),
    }
}

fn run_entry(ep: &LocalEndpoint, rec: &EntryRecord) -> Result<(), EntryFailure> {
    let parent_abs = ep
        .parent_abs(&rec.entry.parent)
        .map_err(|err| fail(rec, errno_of(&err), None))?;
    let path = parent_abs.join(&rec.entry.basename);

    match rec.op {
        EntryVerb::Create | EntryVerb::Mknod => {
            if check_occupant(ep, rec, &path)? {
                return Ok(());
            }
            let blob = descriptor_for(rec).encode();
            create_from_blob(ep, &parent_abs, &blob, BlobKind::Regular)
                .map_err(|err| fail(rec, errno_of(&err), None))
        }
        EntryVerb::Mkdir => {
            if check_occupant(ep, rec, &path)? {
                return Ok(());
            }
            let blob = descriptor_for(rec).encode();
            create_from_blob(ep, &parent_abs, &blob, BlobKind::Dir)
                .map_err(|err| fail(rec, errno_of(&err), None))
        }
        EntryVerb::Symlink => apply_symlink(ep, rec, &path),
        EntryVerb::Link => apply_link(ep, rec, &parent_abs, &path),
        EntryVerb::Rename => apply_rename(ep, rec, &path),
        EntryVerb::Unlink => match fs::remove_file(&path) {
            Ok(()) => {
                let _ = ep.prune_store(&rec.gfid);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(fail(rec, errno_of(&err), None)),
        },
        EntryVerb::Rmdir => match fs::remove_dir(&path) {
            Ok(()) => {
                let _ = ep.prune_store(&rec.gfid);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) if errno_of(&err) == libc::ENOTEMPTY => {
                recursive_purge(ep, &path, Some(rec.gfid))
                    .map_err(|err| fail(rec, errno_of(&err), None))?;
                let _ = ep.prune_store(&rec.gfid);
                Ok(())
            }
            Err(err) => Err(fail(rec, errno_of(&err), None)),
        },
    }
}

fn apply_symlink(ep: &LocalEndpoint, rec: &EntryRecord, path: &Path) -> Result<(), EntryFailure> {
    let Some(target) = rec.link.as_deref() else {
        // The backing object vanished between changelog emission and
        // processing; a benign race, not an error.
        info!("dropping symlink record {}: source gone", rec.describe());
        return Ok(());
    };
    match fs::symlink_metadata(path) {
        Ok(md) if md.file_type().is_symlink() => {
            match fs::read_link(path) {
                Ok(existing) if existing.as_os_str() == target => Ok(()),
                _ => Err(fail(rec, libc::EEXIST, None)),
            }
        }
        Ok(md) => {
            let conflict = ep.disk_gfid_abs(path).ok().map(|g| GfidConflict {
                disk_gfid: g,
                secondary_is_dir: md.is_dir(),
            });
            Err(fail(rec, libc::EEXIST, conflict))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let parent = path.parent().unwrap_or(Path::new("."));
            let blob = descriptor_for(rec).encode();
            create_from_blob(ep, parent, &blob, BlobKind::Symlink(target))
                .map_err(|err| fail(rec, errno_of(&err), None))
        }
        Err(err) => Err(fail(rec, errno_of(&err), None)),
    }
}

fn apply_link(
    ep: &LocalEndpoint,
    rec: &EntryRecord,
    parent_abs: &Path,
    path: &Path,
) -> Result<(), EntryFailure> {
    let store = ep.store_abs(&rec.gfid);
    let store_is_file = fs::symlink_metadata(&store)
        .map(|md| !md.file_type().is_symlink())
        .unwrap_or(false);
    if !store_is_file {
        // No object under that gfid yet: materialize as a regular create.
        if check_occupant(ep, rec, path)? {
            return Ok(());
        }
        let blob = descriptor_for(rec).encode();
        return create_from_blob(ep, parent_abs, &blob, BlobKind::Regular)
            .map_err(|err| fail(rec, errno_of(&err), None));
    }
    match fs::hard_link(&store, path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            if same_inode(&store, path) {
                Ok(())
            } else {
                check_occupant(ep, rec, path).map(|_| ())
            }
        }
        Err(err) => Err(fail(rec, errno_of(&err), None)),
    }
}

fn apply_rename(ep: &LocalEndpoint, rec: &EntryRecord, src: &Path) -> Result<(), EntryFailure> {
    let Some(dest_ref) = &rec.entry1 else {
        return Err(fail(rec, libc::EINVAL, None));
    };
    let dest_parent = ep
        .parent_abs(&dest_ref.parent)
        .map_err(|err| fail(rec, errno_of(&err), None))?;
    let dest = dest_parent.join(&dest_ref.basename);

    let src_present = fs::symlink_metadata(src).is_ok();
    let dest_present = fs::symlink_metadata(&dest).is_ok();

    if !src_present {
        if dest_present {
            // Already renamed by an earlier attempt.
            return Ok(());
        }
        // Both names gone on the secondary: recreate at the destination
        // from the primary's stat.
        return match (&rec.stat, &rec.link) {
            (_, Some(target)) => {
                create_from_blob(
                    ep,
                    &dest_parent,
                    &rename_descriptor(rec, dest_ref).encode(),
                    BlobKind::Symlink(target),
                )
                .map_err(|err| fail(rec, errno_of(&err), None))
            }
            (Some(st), None) if st.is_dir() => create_from_blob(
                ep,
                &dest_parent,
                &rename_descriptor(rec, dest_ref).encode(),
                BlobKind::Dir,
            )
            .map_err(|err| fail(rec, errno_of(&err), None)),
            (Some(_), None) => create_from_blob(
                ep,
                &dest_parent,
                &rename_descriptor(rec, dest_ref).encode(),
                BlobKind::Regular,
            )
            .map_err(|err| fail(rec, errno_of(&err), None)),
            (None, None) => {
                info!("dropping rename record {}: source gone everywhere", rec.describe());
                Ok(())
            }
        };
    }

    if dest_present && same_inode(src, &dest) {
        // Hardlink collapse: both names already denote the object, only the
        // source name goes away.
        return fs::remove_file(src).map_err(|err| fail(rec, errno_of(&err), None));
    }

    if !matching_disk_gfid(ep, src, &rec.gfid) {
        // A racing delete+recreate repurposed the source path; applying the
        // rename now would destroy an unrelated object.
        error!(
            "refusing stale rename {}: source gfid does not match",
            rec.describe()
        );
        return Ok(());
    }

    fs::rename(src, &dest).map_err(|err| fail(rec, errno_of(&err), None))?;
    if fs::symlink_metadata(&dest).map(|md| md.is_dir()).unwrap_or(false) {
        if let Err(err) = ep.link_into_store(&dest, &rec.gfid) {
            warn!("failed to retarget store entry for {}: {err}", rec.gfid);
        }
    }
    Ok(())
}

fn rename_descriptor(rec: &EntryRecord, dest: &crate::changelog::EntryRef) -> EntryDescriptor {
    let mut desc = descriptor_for(rec);
    desc.basename = dest.basename.clone();
    desc
}

/// Depth-first delete that re-validates the parent's on-disk gfid before
/// every removal step, aborting the moment it no longer matches.
pub(crate) fn recursive_purge(
    ep: &LocalEndpoint,
    dir: &Path,
    expect: Option<Gfid>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(expect) = expect {
            if !matching_disk_gfid(ep, dir, &expect) {
                return Err(errno_error(libc::ESTALE));
            }
        }
        let child = entry.path();
        let md = fs::symlink_metadata(&child)?;
        if md.is_dir() {
            let child_gfid = ep.disk_gfid_abs(&child).ok();
            recursive_purge(ep, &child, child_gfid)?;
        } else {
            let gfid = ep.disk_gfid_abs(&child).ok();
            fs::remove_file(&child)?;
            if let Some(gfid) = gfid {
                let _ = ep.prune_store(&gfid);
            }
        }
    }
    if let Some(expect) = expect {
        if !matching_disk_gfid(ep, dir, &expect) {
            return Err(errno_error(libc::ESTALE));
        }
    }
    fs::remove_dir(dir)
}

/// Remove one object by absolute path (the `purge` surface): files directly,
/// directories recursively with gfid re-validation.
pub(crate) fn remove_object(ep: &LocalEndpoint, abs: &Path) -> io::Result<()> {
    let md = match fs::symlink_metadata(abs) {
        Ok(md) => md,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if md.is_dir() {
        let gfid = ep.disk_gfid_abs(abs).ok();
        recursive_purge(ep, abs, gfid)?;
        if let Some(gfid) = gfid {
            let _ = ep.prune_store(&gfid);
        }
        Ok(())
    } else {
        let gfid = ep.disk_gfid_abs(abs).ok();
        fs::remove_file(abs)?;
        if let Some(gfid) = gfid {
            let _ = ep.prune_store(&gfid);
        }
        Ok(())
    }
}
