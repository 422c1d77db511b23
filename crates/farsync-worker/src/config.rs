//! Worker configuration: a TOML file with CLI overrides, validated into a
//! runtime description before anything touches a brick.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{eyre, Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use farsync_core::config::{CheckpointSpec, CrawlMode, EngineChoice, PurgeMode, SessionConfig};
use farsync_core::marker::{ReversionPolicy, XtimeCreation};

#[derive(Parser, Debug)]
#[command(name = "farsync-worker", about = "Geo-replication worker for one brick")]
pub struct WorkerArgs {
    /// Path to the worker configuration file (TOML). Defaults to
    /// /etc/farsync/worker.toml when present.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Primary brick root (overrides config file)
    #[arg(long)]
    pub primary: Option<PathBuf>,
    /// Secondary brick root (overrides config file)
    #[arg(long)]
    pub secondary: Option<PathBuf>,
    /// Working directory for staged changelogs and status
    #[arg(long)]
    pub working_dir: Option<PathBuf>,
    /// Replication-session uuid (overrides config file)
    #[arg(long)]
    pub session: Option<Uuid>,
    /// Syncer worker pool size
    #[arg(long)]
    pub sync_jobs: Option<usize>,
    /// Force this worker passive regardless of node membership
    #[arg(long)]
    pub passive: bool,
    /// Skip changelog modes entirely and run full-tree crawls
    #[arg(long)]
    pub xsync_only: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    session: RawSession,
    #[serde(default)]
    primary: RawPrimary,
    #[serde(default)]
    secondary: RawSecondary,
    engine: Option<EngineChoice>,
    checkpoint: Option<CheckpointSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSession {
    id: Option<Uuid>,
    xattr_namespace: Option<String>,
    working_dir: Option<PathBuf>,
    sync_jobs: Option<usize>,
    batch_max_bytes: Option<u64>,
    batch_retries: Option<u32>,
    skip_failed_batches: Option<bool>,
    repair_gfid_conflicts: Option<bool>,
    ignore_deletes: Option<bool>,
    sync_xattrs: Option<bool>,
    partial_info: Option<bool>,
    resilient_exit_codes: Option<Vec<i32>>,
    scan_interval_secs: Option<u64>,
    passive_interval_secs: Option<u64>,
    keepalive_timeout_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPrimary {
    root: Option<PathBuf>,
    changelog_dir: Option<PathBuf>,
    #[serde(default)]
    node_ids: Vec<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSecondary {
    root: Option<PathBuf>,
    /// Engine destination when it differs from the root (e.g. `host:/path`
    /// for rsync over ssh).
    dest: Option<String>,
}

#[derive(Debug)]
pub struct WorkerRuntime {
    pub session: SessionConfig,
    pub primary_root: PathBuf,
    pub primary_changelog_dir: Option<PathBuf>,
    pub primary_nodes: Vec<Uuid>,
    pub secondary_root: PathBuf,
    pub engine_dest: String,
    pub node_id: Uuid,
    pub force_passive: bool,
    pub warnings: Vec<String>,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/farsync/worker.toml")
}

/// This node's stable identity, derived from its hostname.
pub fn local_node_id() -> Uuid {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes())
}

pub fn load_runtime(args: &WorkerArgs) -> Result<WorkerRuntime> {
    let mut warnings = Vec::new();

    let config_path = if let Some(path) = &args.config {
        Some(path.clone())
    } else {
        let candidate = default_config_path();
        candidate.exists().then_some(candidate)
    };

    let raw = if let Some(ref path) = config_path {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str::<RawConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?
    } else {
        RawConfig::default()
    };

    let primary_root = args
        .primary
        .clone()
        .or(raw.primary.root)
        .ok_or_else(|| eyre!("no primary brick root configured (--primary or [primary].root)"))?;
    let primary_root = fs::canonicalize(&primary_root)
        .with_context(|| format!("failed to resolve primary root {}", primary_root.display()))?;

    let secondary_root = args
        .secondary
        .clone()
        .or(raw.secondary.root)
        .ok_or_else(|| {
            eyre!("no secondary brick root configured (--secondary or [secondary].root)")
        })?;
    let secondary_root = fs::canonicalize(&secondary_root).with_context(|| {
        format!("failed to resolve secondary root {}", secondary_root.display())
    })?;

    let session_id = args.session.or(raw.session.id).unwrap_or_else(|| {
        let id = Uuid::new_v4();
        warnings.push(format!(
            "no session id configured; generated {id} (marks will not match an existing session)"
        ));
        id
    });

    let working_dir = args
        .working_dir
        .clone()
        .or(raw.session.working_dir)
        .unwrap_or_else(|| primary_root.join(".farsync-work"));

    let mut session = SessionConfig::new(session_id, working_dir);
    if let Some(ns) = raw.session.xattr_namespace {
        session.xattr_namespace = ns;
    }
    if let Some(jobs) = args.sync_jobs.or(raw.session.sync_jobs) {
        session.sync_jobs = jobs.max(1);
    }
    if let Some(bytes) = raw.session.batch_max_bytes {
        session.batch_max_bytes = bytes;
    }
    if let Some(retries) = raw.session.batch_retries {
        session.batch_retries = retries;
    }
    if let Some(skip) = raw.session.skip_failed_batches {
        session.skip_failed_batches = skip;
    }
    if let Some(repair) = raw.session.repair_gfid_conflicts {
        session.repair_gfid_conflicts = repair;
    }
    if raw.session.ignore_deletes.unwrap_or(false) {
        session.purge_mode = PurgeMode::Ignore;
    }
    if let Some(sync_xattrs) = raw.session.sync_xattrs {
        session.sync_xattrs = sync_xattrs;
    }
    if raw.session.partial_info.unwrap_or(false) {
        // Partial-info mode: never stamp fresh xtimes, tolerate reversion.
        session.xtime_creation = XtimeCreation::ReadOnly;
        session.reversion = ReversionPolicy::Ignore;
    }
    if let Some(secs) = raw.session.scan_interval_secs {
        session.scan_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = raw.session.passive_interval_secs {
        session.passive_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = raw.session.keepalive_timeout_secs {
        session.keepalive_timeout = secs;
    }
    if args.xsync_only || raw.primary.changelog_dir.is_none() {
        if !args.xsync_only {
            warnings.push(
                "no changelog directory configured; falling back to full-tree crawls".to_string(),
            );
        }
        session.crawl_mode = CrawlMode::XsyncOnly;
    }
    if let Some(engine) = raw.engine {
        session.resilient_exit_codes = raw
            .session
            .resilient_exit_codes
            .unwrap_or_else(|| engine.default_resilient_codes());
        session.engine = engine;
    } else if let Some(codes) = raw.session.resilient_exit_codes {
        session.resilient_exit_codes = codes;
    }
    session.checkpoint = raw.checkpoint;

    let engine_dest = raw
        .secondary
        .dest
        .unwrap_or_else(|| secondary_root.to_string_lossy().into_owned());

    Ok(WorkerRuntime {
        session,
        primary_root,
        primary_changelog_dir: raw.primary.changelog_dir,
        primary_nodes: raw.primary.node_ids,
        secondary_root,
        engine_dest,
        node_id: local_node_id(),
        force_passive: args.passive,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(primary: &std::path::Path, secondary: &std::path::Path) -> WorkerArgs {
        WorkerArgs {
            config: None,
            primary: Some(primary.to_path_buf()),
            secondary: Some(secondary.to_path_buf()),
            working_dir: None,
            session: Some(Uuid::from_u128(7)),
            sync_jobs: None,
            passive: false,
            xsync_only: false,
        }
    }

    #[test]
    fn minimal_cli_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("p");
        let secondary = dir.path().join("s");
        fs::create_dir_all(&primary).unwrap();
        fs::create_dir_all(&secondary).unwrap();

        let runtime = load_runtime(&base_args(&primary, &secondary)).unwrap();
        assert_eq!(runtime.session.session_id, Uuid::from_u128(7));
        // No changelog dir configured: full-tree mode with a warning.
        assert_eq!(runtime.session.crawl_mode, CrawlMode::XsyncOnly);
        assert!(!runtime.warnings.is_empty());
        assert!(runtime.engine_dest.ends_with("s"));
    }

    #[test]
    fn toml_layering_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("p");
        let secondary = dir.path().join("s");
        let logs = dir.path().join("logs");
        for d in [&primary, &secondary, &logs] {
            fs::create_dir_all(d).unwrap();
        }
        let config_path = dir.path().join("worker.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[session]
sync_jobs = 3
ignore_deletes = true
partial_info = true
keepalive_timeout_secs = 30

[primary]
root = "{}"
changelog_dir = "{}"

[secondary]
root = "{}"
dest = "replica:/bricks/b0"

[engine]
kind = "rsync"
extra_args = ["--bwlimit=4096"]

[checkpoint]
label = "cutover"
target_sec = 1234
target_nsec = 0
"#,
                primary.display(),
                logs.display(),
                secondary.display()
            ),
        )
        .unwrap();

        let mut args = base_args(&primary, &secondary);
        args.config = Some(config_path);
        args.sync_jobs = Some(5); // CLI beats TOML

        let runtime = load_runtime(&args).unwrap();
        assert_eq!(runtime.session.sync_jobs, 5);
        assert_eq!(runtime.session.purge_mode, PurgeMode::Ignore);
        assert_eq!(runtime.session.xtime_creation, XtimeCreation::ReadOnly);
        assert_eq!(runtime.session.keepalive_timeout, 30);
        assert_eq!(runtime.session.crawl_mode, CrawlMode::Auto);
        assert_eq!(runtime.engine_dest, "replica:/bricks/b0");
        assert_eq!(runtime.session.resilient_exit_codes, vec![23, 24]);
        assert_eq!(
            runtime.session.checkpoint.as_ref().unwrap().label,
            "cutover"
        );
        match &runtime.session.engine {
            EngineChoice::Rsync { extra_args, .. } => {
                assert_eq!(extra_args, &vec!["--bwlimit=4096".to_string()]);
            }
            other => panic!("unexpected engine {other:?}"),
        }
    }

    #[test]
    fn node_id_is_stable() {
        assert_eq!(local_node_id(), local_node_id());
    }
}
