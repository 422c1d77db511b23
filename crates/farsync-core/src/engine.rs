//! External bulk-copy engines.
//!
//! File content moves through an external tool invoked once per claimed
//! batch: rsync against the secondary root, or a tar stream piped into an
//! extraction command (optionally across a remote shell). The engine reports
//! a raw exit code; classification into clean / resilient / fatal is the
//! caller's job so the resilient set stays a tunable.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use log::debug;

/// Classified engine exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Clean,
    /// Partial/acceptable failure: the batch retries.
    Resilient(i32),
    /// Unrecoverable for the worker process.
    Fatal(i32),
}

pub fn classify_exit(code: i32, resilient: &[i32]) -> ExitClass {
    if code == 0 {
        ExitClass::Clean
    } else if resilient.contains(&code) {
        ExitClass::Resilient(code)
    } else {
        ExitClass::Fatal(code)
    }
}

/// One finished engine run, with enough captured state to diagnose a fatal
/// exit: the rendered command line and the stderr tail.
#[derive(Debug, Clone)]
pub struct EngineRun {
    pub command: String,
    pub code: i32,
    pub stderr_tail: Vec<String>,
}

/// Bounded ring of captured stderr lines.
#[derive(Debug)]
pub struct StderrRing {
    cap: usize,
    lines: VecDeque<String>,
}

impl StderrRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// A bulk-copy engine: ships a batch of brick-relative paths from the
/// primary root to the configured destination.
pub trait BulkCopy: Send + Sync {
    fn name(&self) -> &'static str;
    fn sync(&self, source_root: &Path, files: &[PathBuf]) -> Result<EngineRun>;
}

/// rsync invocation: relative-path mode, in-place writes so gfid hardlinks
/// keep their inode, file list over stdin NUL-separated.
pub struct RsyncEngine {
    pub program: String,
    pub extra_args: Vec<String>,
    /// rsync destination spec: a local path or `host:/path`.
    pub dest: String,
    pub ring_lines: usize,
}

impl BulkCopy for RsyncEngine {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn sync(&self, source_root: &Path, files: &[PathBuf]) -> Result<EngineRun> {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "-aR0",
            "--inplace",
            "--files-from=-",
            "--super",
            "--stats",
            "--numeric-ids",
            "--no-implied-dirs",
        ]);
        cmd.args(&self.extra_args);
        cmd.arg(".").arg(format!("{}/", self.dest));
        cmd.current_dir(source_root);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let command = render_command(&cmd);
        debug!("engine invoke: {command}");

        let mut child = cmd
            .spawn()
            .wrap_err_with(|| format!("failed to spawn {}", self.program))?;

        let mut list = Vec::new();
        for file in files {
            list.extend_from_slice(b"./");
            list.extend_from_slice(file.to_string_lossy().as_bytes());
            list.push(0);
        }
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let ring_lines = self.ring_lines;
        let (code, stderr_tail) = std::thread::scope(|scope| -> Result<(i32, Vec<String>)> {
            let drain = scope.spawn(move || {
                let mut ring = StderrRing::new(ring_lines);
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    ring.push(line);
                }
                ring.into_lines()
            });
            // A dead child surfaces as EPIPE here; the exit code carries the
            // real story.
            let _ = stdin.write_all(&list);
            drop(stdin);
            let status = child.wait().wrap_err("failed to wait for rsync")?;
            let tail = drain.join().unwrap_or_default();
            Ok((status.code().unwrap_or(-1), tail))
        })?;

        Ok(EngineRun {
            command,
            code,
            stderr_tail,
        })
    }
}

/// Tar pipe: an in-process tar stream fed into an extraction command,
/// locally or across a remote shell.
pub struct TarPipeEngine {
    /// Remote shell prefix (e.g. `ssh replica-host`); empty extracts locally.
    pub remote_shell: Vec<String>,
    /// Secondary root the archive is extracted into.
    pub dest: String,
    pub ring_lines: usize,
}

impl BulkCopy for TarPipeEngine {
    fn name(&self) -> &'static str {
        "tar-pipe"
    }

    fn sync(&self, source_root: &Path, files: &[PathBuf]) -> Result<EngineRun> {
        let mut cmd = if self.remote_shell.is_empty() {
            Command::new("tar")
        } else {
            let mut cmd = Command::new(&self.remote_shell[0]);
            cmd.args(&self.remote_shell[1..]);
            cmd.arg("tar");
            cmd
        };
        cmd.args(["-xf", "-", "--overwrite", "-C", &self.dest]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let command = render_command(&cmd);
        debug!("engine invoke: {command}");

        let mut child = cmd.spawn().wrap_err("failed to spawn tar extraction")?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let ring_lines = self.ring_lines;
        let (code, stderr_tail) = std::thread::scope(|scope| -> Result<(i32, Vec<String>)> {
            let drain = scope.spawn(move || {
                let mut ring = StderrRing::new(ring_lines);
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    ring.push(line);
                }
                ring.into_lines()
            });
            let mut archive = tar::Builder::new(stdin);
            archive.follow_symlinks(false);
            for file in files {
                let abs = source_root.join(file);
                // Vanished sources are the changelog's business, not tar's.
                if abs.symlink_metadata().is_ok() {
                    let _ = archive.append_path_with_name(&abs, file);
                }
            }
            let _ = archive.finish();
            drop(archive);
            let status = child.wait().wrap_err("failed to wait for tar")?;
            let tail = drain.join().unwrap_or_default();
            Ok((status.code().unwrap_or(-1), tail))
        })?;

        Ok(EngineRun {
            command,
            code,
            stderr_tail,
        })
    }
}

/// Build the configured engine.
pub fn build_engine(
    choice: &crate::config::EngineChoice,
    dest: String,
    ring_lines: usize,
) -> Box<dyn BulkCopy> {
    match choice {
        crate::config::EngineChoice::Rsync {
            program,
            extra_args,
        } => Box::new(RsyncEngine {
            program: program.clone(),
            extra_args: extra_args.clone(),
            dest,
            ring_lines,
        }),
        crate::config::EngineChoice::TarPipe { remote_shell } => Box::new(TarPipeEngine {
            remote_shell: remote_shell.clone(),
            dest,
            ring_lines,
        }),
    }
}

fn render_command(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}
