//! Changelog record grammar and batch grouping.
//!
//! A changelog is an append-only, rolled-over log file named
//! `CHANGELOG.<ts>` recording filesystem operations since the previous
//! rollover. Each line is one record: an operation-class prefix (`E ` entry,
//! `D ` data, `M ` meta) followed by space-delimited fields. Basenames are
//! percent-encoded by the producer so the grammar stays unambiguous (RENAME
//! carries two path fields on one line).
//!
//! The same grammar is emitted synthetically by the xsync crawler into
//! `XSYNC-CHANGELOG.<ts>` files, so the batch processor has a single parse
//! path for all three change-detection modes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{bail, eyre, Context, Result};
use uuid::Uuid;

pub const CHANGELOG_PREFIX: &str = "CHANGELOG.";
pub const XSYNC_PREFIX: &str = "XSYNC-CHANGELOG.";

/// Stable, path-independent identity of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gfid(pub Uuid);

/// The fixed gfid of the brick root directory.
pub const ROOT_GFID: Gfid = Gfid(Uuid::from_u128(1));

impl Gfid {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).wrap_err_with(|| format!("bad gfid '{s}'"))?,
        ))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(buf: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(buf))
    }
}

impl fmt::Display for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A name in a specific parent directory: `<parent-gfid>/<basename>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRef {
    pub parent: Gfid,
    pub basename: String,
}

impl EntryRef {
    pub fn new(parent: Gfid, basename: impl Into<String>) -> Self {
        Self {
            parent,
            basename: basename.into(),
        }
    }

    fn parse(field: &str) -> Result<Self> {
        let (parent, basename) = field
            .split_once('/')
            .ok_or_else(|| eyre!("entry field '{field}' has no '/' separator"))?;
        Ok(Self {
            parent: Gfid::parse(parent)?,
            basename: decode_component(basename)?,
        })
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, encode_component(&self.basename))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryVerb {
    Create,
    Mknod,
    Mkdir,
    Link,
    Symlink,
    Rename,
    Unlink,
    Rmdir,
}

impl EntryVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryVerb::Create => "CREATE",
            EntryVerb::Mknod => "MKNOD",
            EntryVerb::Mkdir => "MKDIR",
            EntryVerb::Link => "LINK",
            EntryVerb::Symlink => "SYMLINK",
            EntryVerb::Rename => "RENAME",
            EntryVerb::Unlink => "UNLINK",
            EntryVerb::Rmdir => "RMDIR",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "CREATE" => EntryVerb::Create,
            "MKNOD" => EntryVerb::Mknod,
            "MKDIR" => EntryVerb::Mkdir,
            "LINK" => EntryVerb::Link,
            "SYMLINK" => EntryVerb::Symlink,
            "RENAME" => EntryVerb::Rename,
            "UNLINK" => EntryVerb::Unlink,
            "RMDIR" => EntryVerb::Rmdir,
            other => bail!("unknown entry verb '{other}'"),
        })
    }

    /// Verbs that create a new name (carry mode/uid/gid inline).
    pub fn is_create(&self) -> bool {
        matches!(self, EntryVerb::Create | EntryVerb::Mknod | EntryVerb::Mkdir)
    }

    pub fn is_purge(&self) -> bool {
        matches!(self, EntryVerb::Unlink | EntryVerb::Rmdir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Setattr,
    Setxattr,
    Xattrop,
}

impl MetaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaKind::Setattr => "SETATTR",
            MetaKind::Setxattr => "SETXATTR",
            MetaKind::Xattrop => "XATTROP",
        }
    }
}

/// One entry-class changelog line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChange {
    pub gfid: Gfid,
    pub verb: EntryVerb,
    pub entry: EntryRef,
    /// Rename destination.
    pub entry1: Option<EntryRef>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl EntryChange {
    /// A MKNOD carrying the sticky bit is a dht linkto stub: it is replayed
    /// as a hard link plus a queued data transfer, not as a plain node.
    pub fn is_sticky_linkto(&self) -> bool {
        self.verb == EntryVerb::Mknod && (self.mode & 0o1000) != 0
    }
}

/// One parsed changelog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    Entry(EntryChange),
    Meta { gfid: Gfid, kind: MetaKind },
    Data { gfid: Gfid },
}

impl ChangeRecord {
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n');
        let (class, rest) = line
            .split_once(' ')
            .ok_or_else(|| eyre!("changelog line '{line}' has no class prefix"))?;
        match class {
            "E" => Self::parse_entry(rest),
            "D" => {
                let gfid = Gfid::parse(rest.trim())?;
                Ok(ChangeRecord::Data { gfid })
            }
            "M" => {
                let (gfid, kind) = rest
                    .split_once(' ')
                    .ok_or_else(|| eyre!("meta record '{rest}' missing kind"))?;
                let kind = match kind.trim() {
                    "SETATTR" => MetaKind::Setattr,
                    "SETXATTR" => MetaKind::Setxattr,
                    "XATTROP" => MetaKind::Xattrop,
                    other => bail!("unknown meta kind '{other}'"),
                };
                Ok(ChangeRecord::Meta {
                    gfid: Gfid::parse(gfid)?,
                    kind,
                })
            }
            other => bail!("unknown record class '{other}'"),
        }
    }

    fn parse_entry(rest: &str) -> Result<Self> {
        let mut fields = rest.split(' ');
        let gfid = Gfid::parse(fields.next().ok_or_else(|| eyre!("entry record missing gfid"))?)?;
        let verb = EntryVerb::parse(
            fields
                .next()
                .ok_or_else(|| eyre!("entry record missing verb"))?,
        )?;

        let mut change = EntryChange {
            gfid,
            verb,
            entry: EntryRef::new(ROOT_GFID, ""),
            entry1: None,
            mode: 0,
            uid: 0,
            gid: 0,
        };

        if verb.is_create() {
            change.mode = parse_num(fields.next(), "mode")?;
            change.uid = parse_num(fields.next(), "uid")?;
            change.gid = parse_num(fields.next(), "gid")?;
        }
        change.entry = EntryRef::parse(
            fields
                .next()
                .ok_or_else(|| eyre!("entry record missing entry field"))?,
        )?;
        if verb == EntryVerb::Rename {
            change.entry1 = Some(EntryRef::parse(
                fields
                    .next()
                    .ok_or_else(|| eyre!("rename record missing destination"))?,
            )?);
        }
        Ok(ChangeRecord::Entry(change))
    }

    /// Serialize back to one changelog line (no trailing newline).
    pub fn to_line(&self) -> String {
        match self {
            ChangeRecord::Entry(e) => {
                let mut line = format!("E {} {}", e.gfid, e.verb.as_str());
                if e.verb.is_create() {
                    line.push_str(&format!(" {} {} {}", e.mode, e.uid, e.gid));
                }
                line.push_str(&format!(" {}", e.entry));
                if let Some(dest) = &e.entry1 {
                    line.push_str(&format!(" {dest}"));
                }
                line
            }
            ChangeRecord::Meta { gfid, kind } => format!("M {} {}", gfid, kind.as_str()),
            ChangeRecord::Data { gfid } => format!("D {gfid}"),
        }
    }
}

fn parse_num(field: Option<&str>, what: &str) -> Result<u32> {
    field
        .ok_or_else(|| eyre!("entry record missing {what}"))?
        .parse()
        .wrap_err_with(|| format!("bad {what} field"))
}

/// Percent-encode a basename for the space-delimited grammar. Printable
/// ASCII passes through; everything else (separators, controls, non-ASCII
/// bytes) is escaped.
pub fn encode_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'%' | b' ' | b'/' => out.push_str(&format!("%{b:02X}")),
            0x21..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

pub fn decode_component(name: &str) -> Result<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                bail!("truncated percent escape in '{name}'");
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| eyre!("bad percent escape in '{name}'"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).wrap_err("basename is not utf-8")
}

/// Rollover timestamp carried in a changelog file name, e.g.
/// `CHANGELOG.1700000000` → 1700000000.
pub fn changelog_ts(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let suffix = name
        .strip_prefix(CHANGELOG_PREFIX)
        .or_else(|| name.strip_prefix(XSYNC_PREFIX))?;
    suffix.parse().ok()
}

/// An ordered group of changelog files processed as one atomic unit of stime
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct ChangelogBatch {
    pub files: Vec<PathBuf>,
    /// Rollover timestamp of the newest file in the batch.
    pub end_ts: i64,
}

impl ChangelogBatch {
    /// The stime a fully-confirmed batch advances to: one second before the
    /// newest rollover, so a crash mid-rollover re-reads that changelog.
    pub fn commit_mark(&self) -> crate::marker::MarkTime {
        crate::marker::MarkTime::new(self.end_ts - 1, 0)
    }
}

/// Group changelog files (assumed sorted by rollover timestamp) into batches
/// whose aggregate on-disk size stays under `max_bytes`. A single oversized
/// file still forms its own batch.
pub fn batch_changes(files: Vec<PathBuf>, max_bytes: u64) -> Result<Vec<ChangelogBatch>> {
    let mut batches: Vec<ChangelogBatch> = Vec::new();
    let mut current: Vec<PathBuf> = Vec::new();
    let mut current_bytes = 0u64;

    for file in files {
        let size = fs::metadata(&file)
            .map(|md| md.len())
            .wrap_err_with(|| format!("failed to stat changelog {}", file.display()))?;
        if !current.is_empty() && current_bytes + size > max_bytes {
            batches.push(seal_batch(std::mem::take(&mut current))?);
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(file);
    }
    if !current.is_empty() {
        batches.push(seal_batch(current)?);
    }
    Ok(batches)
}

fn seal_batch(files: Vec<PathBuf>) -> Result<ChangelogBatch> {
    let end_ts = files
        .iter()
        .filter_map(|f| changelog_ts(f))
        .max()
        .ok_or_else(|| eyre!("changelog batch has no parseable rollover timestamp"))?;
    Ok(ChangelogBatch { files, end_ts })
}
