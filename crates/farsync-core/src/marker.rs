//! Progress markers: the xtime/stime watermark protocol.
//!
//! A marker is a `(sec, nsec)` pair persisted as an extended attribute on a
//! directory, keyed by session. The primary side carries `xtime` (logical
//! modification watermark), the secondary carries `stime` ("synced up to")
//! and, in changelog modes, `entry_stime`. The crawler's whole job is to
//! drive stime up to xtime; for any synced path `stime <= xtime` holds.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::errors::errno_of;

/// Session identifier: the replication-session uuid marks are keyed by.
pub type SessionId = Uuid;

/// A watermark value. Total order is lexicographic on `(sec, nsec)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkTime {
    pub sec: i64,
    pub nsec: i64,
}

/// "Never synced" sentinel.
pub const URXTIME: MarkTime = MarkTime { sec: -1, nsec: 0 };

impl MarkTime {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time as a marker (microsecond granularity, the
    /// resolution the stamp is observed at).
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs() as i64,
            nsec: i64::from(elapsed.subsec_micros()),
        }
    }

    pub fn is_unsynced(&self) -> bool {
        *self == URXTIME
    }

    /// Wire form: two u32 big-endian words, sec then nsec.
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&(self.sec as u32).to_be_bytes());
        buf[4..].copy_from_slice(&(self.nsec as u32).to_be_bytes());
        buf
    }

    /// Decode the wire form. `(0xFFFF_FFFF, 0)` is the URXTIME sentinel.
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() != 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("marker xattr has {} bytes, expected 8", buf.len()),
            ));
        }
        let sec = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let nsec = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if sec == u32::MAX && nsec == 0 {
            return Ok(URXTIME);
        }
        Ok(Self {
            sec: i64::from(sec),
            nsec: i64::from(nsec),
        })
    }
}

impl std::fmt::Display for MarkTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.sec, self.nsec)
    }
}

/// Strict comparison deciding "does this path need syncing". A tie means
/// already synced: no recursion into that subtree.
pub fn needs_sync(candidate: MarkTime, reference: MarkTime) -> bool {
    candidate > reference
}

/// Primary-side xtime creation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XtimeCreation {
    /// Stamp a fresh xtime when missing or older than the volume-mark epoch.
    Create,
    /// Never create; a missing xtime reads as URXTIME (partial-info mode).
    ReadOnly,
}

/// What to do when the secondary's stime is strictly ahead of the primary's
/// xtime for the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversionPolicy {
    /// Treat as clock/consistency corruption: fatal.
    Fatal,
    /// Tolerate (partial-info operating mode).
    Ignore,
}

/// Marker read/write engine for one replication session.
///
/// All cross-process marker state goes through here; nothing else in the
/// worker touches the mark xattrs directly.
pub struct MarkerEngine {
    session: SessionId,
    creation: XtimeCreation,
    reversion: ReversionPolicy,
    /// Volume-mark epoch: xtimes stamped before this are stale and eligible
    /// for re-creation.
    epoch: MarkTime,
}

impl MarkerEngine {
    pub fn new(
        session: SessionId,
        creation: XtimeCreation,
        reversion: ReversionPolicy,
        epoch: MarkTime,
    ) -> Self {
        Self {
            session,
            creation,
            reversion,
            epoch,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Primary-side xtime for `path`, stamping a fresh value when the policy
    /// allows and the stored value is missing or predates the epoch.
    pub fn xtime(
        &self,
        ep: &dyn Endpoint,
        path: &std::path::Path,
    ) -> io::Result<MarkTime> {
        match ep.xtime(path, &self.session) {
            Ok(mark) => {
                if self.creation == XtimeCreation::Create && mark < self.epoch {
                    let fresh = MarkTime::now();
                    ep.set_xtime(path, &self.session, fresh)?;
                    return Ok(fresh);
                }
                Ok(mark)
            }
            Err(err) if errno_of(&err) == libc::ENODATA => match self.creation {
                XtimeCreation::Create => {
                    let fresh = MarkTime::now();
                    ep.set_xtime(path, &self.session, fresh)?;
                    Ok(fresh)
                }
                XtimeCreation::ReadOnly => Ok(URXTIME),
            },
            Err(err) => Err(err),
        }
    }

    /// Secondary-side stime for `path`. A missing stime falls back to the
    /// secondary's own xtime and seeds stime from it (migration path for
    /// sessions that predate the split watermark); if that is missing too the
    /// path has never been synced.
    pub fn stime(
        &self,
        ep: &dyn Endpoint,
        path: &std::path::Path,
    ) -> io::Result<MarkTime> {
        match ep.stime(path, &self.session) {
            Ok(mark) => Ok(mark),
            Err(err) if errno_of(&err) == libc::ENODATA => {
                match ep.xtime(path, &self.session) {
                    Ok(seed) => {
                        ep.set_stime(path, &self.session, seed)?;
                        Ok(seed)
                    }
                    Err(err) if errno_of(&err) == libc::ENODATA => Ok(URXTIME),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub fn entry_stime(
        &self,
        ep: &dyn Endpoint,
        path: &std::path::Path,
    ) -> io::Result<MarkTime> {
        match ep.entry_stime(path, &self.session) {
            Ok(mark) => Ok(mark),
            Err(err) if errno_of(&err) == libc::ENODATA => Ok(URXTIME),
            Err(err) => Err(err),
        }
    }

    /// Persist a new stime. A write of URXTIME is refused: the watermark
    /// never moves backwards to "never synced".
    pub fn set_stime(
        &self,
        ep: &dyn Endpoint,
        path: &std::path::Path,
        mark: MarkTime,
    ) -> io::Result<()> {
        if mark.is_unsynced() {
            warn!(
                "refusing stime reset to the unsynced sentinel on {}",
                path.display()
            );
            return Ok(());
        }
        ep.set_stime(path, &self.session, mark)
    }

    pub fn set_entry_stime(
        &self,
        ep: &dyn Endpoint,
        path: &std::path::Path,
        mark: MarkTime,
    ) -> io::Result<()> {
        if mark.is_unsynced() {
            return Ok(());
        }
        ep.set_entry_stime(path, &self.session, mark)
    }

    /// Reversion check: the secondary claiming to be ahead of the primary is
    /// corruption unless the policy relaxes it.
    pub fn check_reversion(
        &self,
        path: &std::path::Path,
        primary_xtime: MarkTime,
        secondary_stime: MarkTime,
    ) -> eyre::Result<()> {
        if secondary_stime > primary_xtime && !secondary_stime.is_unsynced() {
            match self.reversion {
                ReversionPolicy::Fatal => {
                    return Err(eyre::eyre!(
                        "marker reversion on {}: secondary stime {} is ahead of primary xtime {}",
                        path.display(),
                        secondary_stime,
                        primary_xtime
                    ));
                }
                ReversionPolicy::Ignore => {
                    warn!(
                        "tolerating marker reversion on {} (stime {} > xtime {})",
                        path.display(),
                        secondary_stime,
                        primary_xtime
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_greater_comparison() {
        let base = MarkTime::new(100, 0);
        assert!(!needs_sync(base, base));
        assert!(needs_sync(MarkTime::new(100, 1), base));
        assert!(needs_sync(MarkTime::new(101, 0), base));
        assert!(!needs_sync(MarkTime::new(99, 999_999), base));
    }

    #[test]
    fn nsec_breaks_ties() {
        assert!(MarkTime::new(5, 10) > MarkTime::new(5, 9));
        assert!(MarkTime::new(5, 10) < MarkTime::new(6, 0));
    }

    #[test]
    fn urxtime_sorts_before_everything() {
        assert!(URXTIME < MarkTime::new(0, 0));
        assert!(needs_sync(MarkTime::new(0, 0), URXTIME));
    }

    #[test]
    fn codec_roundtrip() {
        let mark = MarkTime::new(1_700_000_000, 123_456);
        let decoded = MarkTime::decode(&mark.encode()).unwrap();
        assert_eq!(decoded, mark);
    }

    #[test]
    fn codec_urxtime_sentinel() {
        let decoded = MarkTime::decode(&URXTIME.encode()).unwrap();
        assert_eq!(decoded, URXTIME);
        assert!(decoded.is_unsynced());
    }

    #[test]
    fn codec_rejects_short_buffer() {
        assert!(MarkTime::decode(&[0u8; 7]).is_err());
    }
}
