mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use log::{info, warn};

use farsync_core::checkpoint::{self, CheckpointState};
use farsync_core::endpoint::{Endpoint, EndpointOptions, LocalEndpoint};
use farsync_core::engine::{build_engine, BulkCopy};
use farsync_core::marker::{MarkTime, MarkerEngine};
use farsync_core::orchestrator::{RoleSource, Worker};
use farsync_core::status::StatusFile;
use farsync_core::syncer::{exit_process_hook, Syncer};

use config::{load_runtime, WorkerArgs};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    install_signal_handlers();

    let args = WorkerArgs::parse();
    let runtime = load_runtime(&args)?;
    for warning in &runtime.warnings {
        warn!("{warning}");
    }

    std::fs::create_dir_all(&runtime.session.working_dir).with_context(|| {
        format!(
            "failed to create working directory {}",
            runtime.session.working_dir.display()
        )
    })?;

    let primary = LocalEndpoint::new(
        &runtime.primary_root,
        EndpointOptions {
            xattr_namespace: runtime.session.xattr_namespace.clone(),
            working_dir: runtime.session.working_dir.clone(),
            changelog_dir: runtime.primary_changelog_dir.clone(),
            authoritative: true,
            node_ids: runtime.primary_nodes.clone(),
            rollover_secs: runtime.session.rollover_secs,
        },
    )
    .wrap_err("failed to open the primary brick")?;

    let secondary = LocalEndpoint::new(
        &runtime.secondary_root,
        EndpointOptions {
            xattr_namespace: runtime.session.xattr_namespace.clone(),
            working_dir: runtime.session.working_dir.join("secondary"),
            authoritative: false,
            ..Default::default()
        },
    )
    .wrap_err("failed to open the secondary brick")?;

    let engine: Arc<dyn BulkCopy> = Arc::from(build_engine(
        &runtime.session.engine,
        runtime.engine_dest.clone(),
        runtime.session.stderr_ring_lines,
    ));
    let syncer = Syncer::new(
        engine,
        primary.root().to_path_buf(),
        runtime.session.sync_jobs,
        runtime.session.resilient_exit_codes.clone(),
        exit_process_hook(),
    );

    let markers = MarkerEngine::new(
        runtime.session.session_id,
        runtime.session.xtime_creation,
        runtime.session.reversion,
        MarkTime::new(0, 0),
    );

    let status = StatusFile::load(runtime.session.status_file());

    let checkpoint_state = runtime
        .session
        .checkpoint
        .as_ref()
        .map(|spec| Arc::new(CheckpointState::new(spec)));
    let _checkpoint_service = match &checkpoint_state {
        Some(state) => Some(
            checkpoint::serve(Arc::clone(state), &runtime.session.checkpoint_socket())
                .wrap_err("failed to start the checkpoint status service")?,
        ),
        None => None,
    };

    let role_source = if runtime.force_passive {
        RoleSource::Static(false)
    } else if runtime.primary_nodes.is_empty() {
        RoleSource::Static(true)
    } else {
        RoleSource::NodeMembership {
            node_id: runtime.node_id,
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        // Bridge the async-signal flag into the worker's shutdown flag.
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("signal-watch".to_string())
            .spawn(move || loop {
                if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(200));
            })
            .wrap_err("failed to spawn signal watcher")?;
    }

    info!(
        "replication worker starting: session {} primary {} secondary {}",
        runtime.session.session_id,
        runtime.primary_root.display(),
        runtime.secondary_root.display()
    );

    let worker = Worker {
        primary: &primary,
        secondary: &secondary,
        markers: &markers,
        syncer: &syncer,
        config: &runtime.session,
        status: &status,
        role_source,
        checkpoint: checkpoint_state,
        shutdown,
    };
    worker.run()?;

    info!("replication worker stopped");
    Ok(())
}
