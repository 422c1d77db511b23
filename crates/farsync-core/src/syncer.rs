//! The sync-job dispatcher: batches pending transfer requests behind a
//! fixed pool of worker threads driving the external bulk-copy engine.
//!
//! Producers append one path at a time to the currently-open PostBox and
//! get the box back as a wait handle. A worker claims work by atomically
//! swapping the shared open box for a fresh empty one (the swap mutex is
//! distinct from the box's own lock, so appenders never wait out an engine
//! run), closes what it claimed, runs the engine once for the whole batch,
//! and wakes every waiter with the classified result.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, warn};
use parking_lot::{Condvar, Mutex};

use crate::engine::{classify_exit, BulkCopy, EngineRun, ExitClass};

/// Classified batch outcome delivered to every waiter: `(success, code)`.
pub type BatchResult = (bool, i32);

#[derive(Default)]
struct BoxState {
    open: bool,
    items: Vec<PathBuf>,
    result: Option<BatchResult>,
}

/// A closeable collection of pending transfer requests. Ownership moves
/// producer → worker exactly once, at the swap.
pub struct PostBox {
    state: Mutex<BoxState>,
    cond: Condvar,
}

impl PostBox {
    fn new() -> Self {
        Self {
            state: Mutex::new(BoxState {
                open: true,
                items: Vec::new(),
                result: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append unless the box has already been claimed and closed.
    fn try_append(&self, item: PathBuf) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.items.push(item);
        true
    }

    /// Close the box and take its contents; no further appends land.
    fn close_and_take(&self) -> Vec<PathBuf> {
        let mut state = self.state.lock();
        state.open = false;
        std::mem::take(&mut state.items)
    }

    fn post(&self, result: BatchResult) {
        let mut state = self.state.lock();
        state.result = Some(result);
        self.cond.notify_all();
    }

    /// Block until the owning worker posts the batch result.
    pub fn wait(&self) -> BatchResult {
        let mut state = self.state.lock();
        while state.result.is_none() {
            self.cond.wait(&mut state);
        }
        state.result.expect("result was just observed")
    }
}

/// Invoked on a fatal (non-resilient) engine exit, after diagnostics are
/// logged. The default terminates the worker process; tests inject a probe.
pub type FatalHook = Arc<dyn Fn(&EngineRun) + Send + Sync>;

pub fn exit_process_hook() -> FatalHook {
    Arc::new(|run: &EngineRun| {
        std::process::exit(if run.code > 0 { run.code } else { 1 });
    })
}

pub struct Syncer {
    slot: Arc<Mutex<Arc<PostBox>>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

const IDLE_SLEEP: Duration = Duration::from_millis(500);

impl Syncer {
    pub fn new(
        engine: Arc<dyn BulkCopy>,
        source_root: PathBuf,
        jobs: usize,
        resilient: Vec<i32>,
        fatal_hook: FatalHook,
    ) -> Self {
        let slot = Arc::new(Mutex::new(Arc::new(PostBox::new())));
        let shutdown = Arc::new(AtomicBool::new(false));
        let resilient = Arc::new(resilient);

        let mut workers = Vec::with_capacity(jobs.max(1));
        for idx in 0..jobs.max(1) {
            let slot = Arc::clone(&slot);
            let shutdown = Arc::clone(&shutdown);
            let engine = Arc::clone(&engine);
            let resilient = Arc::clone(&resilient);
            let fatal_hook = Arc::clone(&fatal_hook);
            let source_root = source_root.clone();
            let handle = thread::Builder::new()
                .name(format!("syncjob-{idx}"))
                .spawn(move || {
                    worker_loop(slot, shutdown, engine, source_root, resilient, fatal_hook)
                })
                .expect("failed to spawn syncer worker");
            workers.push(handle);
        }

        Self {
            slot,
            shutdown,
            workers,
        }
    }

    /// Queue one path for transfer. The returned box is the wait handle for
    /// whichever batch ends up carrying the item.
    pub fn add(&self, item: PathBuf) -> Arc<PostBox> {
        loop {
            let current = Arc::clone(&self.slot.lock());
            if current.try_append(item.clone()) {
                return current;
            }
            // The box was claimed between the clone and the append; a fresh
            // open box is (or is about to be) in the slot. Go again.
            thread::yield_now();
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    slot: Arc<Mutex<Arc<PostBox>>>,
    shutdown: Arc<AtomicBool>,
    engine: Arc<dyn BulkCopy>,
    source_root: PathBuf,
    resilient: Arc<Vec<i32>>,
    fatal_hook: FatalHook,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let claimed = {
            let mut slot = slot.lock();
            let old = Arc::clone(&slot);
            *slot = Arc::new(PostBox::new());
            old
        };
        let items = claimed.close_and_take();
        if items.is_empty() {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let run = match engine.sync(&source_root, &items) {
            Ok(run) => run,
            Err(err) => {
                // Spawn failure: nothing ran, nothing transferred.
                error!("failed to invoke {} engine: {err:#}", engine.name());
                claimed.post((false, -1));
                continue;
            }
        };

        match classify_exit(run.code, &resilient) {
            ExitClass::Clean => claimed.post((true, 0)),
            ExitClass::Resilient(code) => {
                warn!(
                    "{} exited {code} ({} files); batch marked failed for retry",
                    engine.name(),
                    items.len()
                );
                claimed.post((false, code));
            }
            ExitClass::Fatal(code) => {
                error!(
                    "{} exited {code}: unrecoverable; command: {}",
                    engine.name(),
                    run.command
                );
                for line in &run.stderr_tail {
                    error!("{}! {line}", engine.name());
                }
                fatal_hook(&run);
                // Only reached when the hook does not terminate (tests).
                claimed.post((false, code));
            }
        }
    }
}

/// Wait for every distinct box in `handles`; true when all batches
/// succeeded.
pub fn wait_all(handles: &[Arc<PostBox>]) -> bool {
    let mut seen: Vec<*const PostBox> = Vec::new();
    let mut ok = true;
    for handle in handles {
        let ptr = Arc::as_ptr(handle);
        if seen.contains(&ptr) {
            continue;
        }
        seen.push(ptr);
        let (success, _code) = handle.wait();
        ok &= success;
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use parking_lot::Mutex as PlMutex;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    /// Scripted engine: returns exit codes in sequence and records every
    /// batch it was handed.
    struct ScriptedEngine {
        codes: Vec<i32>,
        calls: AtomicUsize,
        batches: PlMutex<Vec<Vec<PathBuf>>>,
    }

    impl ScriptedEngine {
        fn new(codes: Vec<i32>) -> Arc<Self> {
            Arc::new(Self {
                codes,
                calls: AtomicUsize::new(0),
                batches: PlMutex::new(Vec::new()),
            })
        }
    }

    impl BulkCopy for ScriptedEngine {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn sync(&self, _root: &Path, files: &[PathBuf]) -> Result<EngineRun> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(files.to_vec());
            let code = self.codes.get(call).copied().unwrap_or(0);
            Ok(EngineRun {
                command: "scripted".into(),
                code,
                stderr_tail: vec![],
            })
        }
    }

    fn noop_hook() -> FatalHook {
        Arc::new(|_run| {})
    }

    #[test]
    fn every_item_is_claimed_exactly_once() {
        let engine = ScriptedEngine::new(vec![]);
        let mut syncer = Syncer::new(
            engine.clone(),
            PathBuf::from("."),
            2,
            vec![23, 24],
            noop_hook(),
        );

        let mut handles = Vec::new();
        for i in 0..40 {
            handles.push(syncer.add(PathBuf::from(format!("f{i}"))));
        }
        assert!(wait_all(&handles));
        syncer.stop();

        let batches = engine.batches.lock();
        let mut all: Vec<_> = batches.iter().flatten().cloned().collect();
        all.sort();
        let mut expected: Vec<_> = (0..40).map(|i| PathBuf::from(format!("f{i}"))).collect();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn waiters_of_one_box_share_the_result() {
        let engine = ScriptedEngine::new(vec![23]);
        let mut syncer = Syncer::new(
            engine,
            PathBuf::from("."),
            1,
            vec![23, 24],
            noop_hook(),
        );
        let a = syncer.add(PathBuf::from("x"));
        let b = syncer.add(PathBuf::from("y"));
        if Arc::ptr_eq(&a, &b) {
            // Same batch: both waits see the same classification.
            assert_eq!(a.wait(), (false, 23));
            assert_eq!(b.wait(), (false, 23));
        } else {
            // The worker split them across two batches; the first saw 23.
            let (ra, rb) = (a.wait(), b.wait());
            assert!(!ra.0 || !rb.0);
        }
        syncer.stop();
    }

    #[test]
    fn resilient_exit_does_not_fire_fatal_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook: FatalHook = {
            let fired = Arc::clone(&fired);
            Arc::new(move |_run| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let engine = ScriptedEngine::new(vec![24, 0]);
        let mut syncer = Syncer::new(engine, PathBuf::from("."), 1, vec![23, 24], hook);

        let handle = syncer.add(PathBuf::from("x"));
        assert_eq!(handle.wait(), (false, 24));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        syncer.stop();
    }

    #[test]
    fn fatal_exit_fires_hook_with_diagnostics() {
        let fired = Arc::new(PlMutex::new(None::<i32>));
        let hook: FatalHook = {
            let fired = Arc::clone(&fired);
            Arc::new(move |run| {
                *fired.lock() = Some(run.code);
            })
        };
        let engine = ScriptedEngine::new(vec![12]);
        let mut syncer = Syncer::new(engine, PathBuf::from("."), 1, vec![23, 24], hook);

        let handle = syncer.add(PathBuf::from("x"));
        assert_eq!(handle.wait(), (false, 12));
        assert_eq!(*fired.lock(), Some(12));
        syncer.stop();
    }
}
