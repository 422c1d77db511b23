//! Volume marks: session identity exchanged over keep-alive.
//!
//! A native mark is the locally authoritative description of the replication
//! session; a foreign mark arrives via keep-alive from an upstream primary
//! and indicates a cascading setup. At most one foreign mark may be valid
//! (unexpired) at a time — more than one means two primaries both believe
//! they own this secondary, which is a fatal configuration error.

use eyre::{bail, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::marker::MarkTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMark {
    pub uuid: Uuid,
    pub version: (u32, u32),
    pub retval: i32,
    pub volume_mark_sec: i64,
    pub volume_mark_nsec: i64,
    /// Validity window in seconds; 0 marks a native (non-expiring) record.
    pub timeout: i64,
}

impl VolumeMark {
    pub fn native(uuid: Uuid, epoch: MarkTime) -> Self {
        Self {
            uuid,
            version: (1, 0),
            retval: 0,
            volume_mark_sec: epoch.sec,
            volume_mark_nsec: epoch.nsec,
            timeout: 0,
        }
    }

    pub fn foreign(uuid: Uuid, epoch: MarkTime, expires_at: i64) -> Self {
        Self {
            uuid,
            version: (1, 0),
            retval: 0,
            volume_mark_sec: epoch.sec,
            volume_mark_nsec: epoch.nsec,
            timeout: expires_at,
        }
    }

    pub fn epoch(&self) -> MarkTime {
        MarkTime::new(self.volume_mark_sec, self.volume_mark_nsec)
    }

    pub fn is_native(&self) -> bool {
        self.timeout == 0
    }

    /// A foreign mark is valid while its expiry lies in the future.
    pub fn is_valid(&self, now_sec: i64) -> bool {
        self.is_native() || self.timeout >= now_sec
    }

    /// Extend a foreign mark's validity from a fresh keep-alive.
    pub fn refresh(&mut self, now_sec: i64, window: i64) {
        if !self.is_native() {
            self.timeout = now_sec + window;
        }
    }
}

/// The volume mark the worker operates under: its own, or the single valid
/// foreign one in a cascading chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolMarkSource {
    Native(VolumeMark),
    Foreign(VolumeMark),
}

impl VolMarkSource {
    pub fn mark(&self) -> &VolumeMark {
        match self {
            VolMarkSource::Native(m) | VolMarkSource::Foreign(m) => m,
        }
    }
}

/// Select the operative volume mark. Expired foreign marks are ignored;
/// two or more still-valid foreign marks are a fatal configuration error.
pub fn select_volume_mark(
    native: Option<VolumeMark>,
    foreign: &[VolumeMark],
    now_sec: i64,
) -> Result<Option<VolMarkSource>> {
    let valid: Vec<&VolumeMark> = foreign.iter().filter(|m| m.is_valid(now_sec)).collect();
    match valid.len() {
        0 => Ok(native.map(VolMarkSource::Native)),
        1 => Ok(Some(VolMarkSource::Foreign(valid[0].clone()))),
        n => bail!("{n} simultaneous valid foreign volume marks (cascading misconfiguration)"),
    }
}
