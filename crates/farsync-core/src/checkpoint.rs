//! Operator checkpoints: an xtime target the secondary must reach, plus the
//! little unix-socket service that answers "is it there yet".

use std::io::{self, Write};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;

use crate::config::CheckpointSpec;
use crate::marker::MarkTime;

pub struct CheckpointState {
    label: String,
    target: MarkTime,
    completed: Mutex<Option<DateTime<Utc>>>,
}

impl CheckpointState {
    pub fn new(spec: &CheckpointSpec) -> Self {
        Self {
            label: spec.label.clone(),
            target: MarkTime::new(spec.target_sec, spec.target_nsec),
            completed: Mutex::new(None),
        }
    }

    /// Feed the latest root stime; records completion the first time the
    /// target is reached.
    pub fn observe(&self, stime: MarkTime) -> Option<DateTime<Utc>> {
        if stime.is_unsynced() || stime < self.target {
            return *self.completed.lock();
        }
        let mut completed = self.completed.lock();
        if completed.is_none() {
            let now = Utc::now();
            *completed = Some(now);
            info!("checkpoint '{}' completed at {now}", self.label);
        }
        *completed
    }

    /// The one-line, NUL-terminated human-readable answer.
    pub fn describe(&self) -> String {
        match *self.completed.lock() {
            Some(at) => format!(
                "checkpoint {} completed at {}",
                self.label,
                at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => format!("checkpoint {} not reached yet", self.label),
        }
    }
}

/// Serve checkpoint status on a unix socket: one connection, one line,
/// NUL-terminated. Runs until the process exits.
pub fn serve(state: Arc<CheckpointState>, socket: &Path) -> io::Result<thread::JoinHandle<()>> {
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket)?;
    thread::Builder::new()
        .name("checkpoint-svc".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(mut stream) => {
                        let mut line = state.describe().into_bytes();
                        line.push(0);
                        if let Err(err) = stream.write_all(&line) {
                            warn!("checkpoint status write failed: {err}");
                        }
                    }
                    Err(err) => {
                        warn!("checkpoint socket accept failed: {err}");
                        break;
                    }
                }
            }
        })
}
