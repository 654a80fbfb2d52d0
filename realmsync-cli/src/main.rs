//! realmsync: reconciles identity realms from declarative JSON documents.
//!
//! Reads the server snapshot from a state file, applies every document in
//! order through the engine, and writes the resulting snapshot back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realmsync_engine::{
    Category, FingerprintMode, ImportConfig, ManagedPolicy, MemoryAdmin, MismatchBehavior,
    RealmDocument, RealmOrchestrator, ReconciliationOutcome, RetryHandler, RetryPolicy,
    TokioSleeper,
};

mod state;

use state::{load_document, StateFile};

/// realmsync
#[derive(Parser, Debug)]
#[command(name = "realmsync", version, about)]
struct Args {
    /// Desired-state documents, applied in order
    #[arg(required = true)]
    documents: Vec<PathBuf>,

    /// Server state snapshot (created if missing)
    #[arg(long, default_value = "realmsync-state.json")]
    state: PathBuf,

    /// Import configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fingerprint keying: whole-document or per-resource
    #[arg(long, value_parser = parse_kebab::<FingerprintMode>)]
    fingerprint_mode: Option<FingerprintMode>,

    /// Behavior when a stored fingerprint differs: continue or fail
    #[arg(long, value_parser = parse_kebab::<MismatchBehavior>)]
    on_mismatch: Option<MismatchBehavior>,

    /// Apply documents even when their fingerprint is unchanged
    #[arg(long)]
    force: bool,

    /// Attempts for eventual-consistency waits
    #[arg(long)]
    retry_attempts: Option<u32>,

    /// Delay between attempts in milliseconds
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Managed policy override, e.g. `group=no-delete` (repeatable)
    #[arg(long = "managed", value_parser = parse_managed)]
    managed: Vec<(Category, ManagedPolicy)>,

    /// Trigger a federation sync after user-storage components change
    #[arg(long)]
    sync_user_federation: bool,
}

fn parse_kebab<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("invalid value '{}'", s))
}

fn parse_managed(s: &str) -> Result<(Category, ManagedPolicy), String> {
    let (category, policy) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CATEGORY=POLICY, got '{}'", s))?;
    Ok((category.trim().parse()?, policy.trim().parse()?))
}

/// Config file (or defaults) with command-line overrides applied.
fn build_config(args: &Args) -> Result<ImportConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            ImportConfig::from_json(&data)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ImportConfig::default(),
    };

    if let Some(mode) = args.fingerprint_mode {
        config.fingerprint.mode = mode;
    }
    if let Some(on_mismatch) = args.on_mismatch {
        config.fingerprint.on_mismatch = on_mismatch;
    }
    if args.force {
        config.fingerprint.enabled = false;
    }
    if let Some(attempts) = args.retry_attempts {
        config.retry.max_attempts = attempts;
    }
    if let Some(delay) = args.retry_delay_ms {
        config.retry.delay_ms = delay;
    }
    if args.sync_user_federation {
        config.sync_user_federation = true;
    }
    config.managed.extend(args.managed.iter().copied());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realmsync=info,realmsync_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let state = StateFile::new(args.state.clone());
    let admin = Arc::new(MemoryAdmin::from_state(state.load()?));

    let mut failed = 0;
    let mut docs: Vec<RealmDocument> = Vec::with_capacity(args.documents.len());
    for path in &args.documents {
        match load_document(path) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                error!("Skipping {}: {:#}", path.display(), e);
                failed += 1;
            }
        }
    }

    // Ctrl-C cancels pending retry waits; the affected realm then fails.
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, cancelling pending waits");
            let _ = cancel_tx.send(true);
        }
    });

    let retry = RetryHandler::new(
        RetryPolicy::from(&config.retry),
        Arc::new(TokioSleeper::new(cancel_rx)),
    );
    let orchestrator = RealmOrchestrator::new(admin.clone(), config, retry);

    info!(
        "Reconciling {} document(s) against {}",
        docs.len(),
        state.path().display()
    );
    for (source, outcome) in orchestrator.reconcile_batch(&docs).await {
        match &outcome {
            ReconciliationOutcome::Skipped => info!("{}: unchanged", source),
            ReconciliationOutcome::Applied(_) => info!("{}: applied ({})", source, outcome.total()),
            ReconciliationOutcome::Failed(e) => {
                error!("{}: {}", source, e);
                failed += 1;
            }
        }
    }

    state.save(&admin.snapshot().await)?;

    if failed > 0 {
        bail!("{} of {} document(s) failed", failed, args.documents.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_args(extra: &[&str]) -> Args {
        let mut argv = vec!["realmsync"];
        argv.extend_from_slice(extra);
        argv.push("realm.json");
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = make_args(&[
            "--fingerprint-mode",
            "per-resource",
            "--on-mismatch",
            "fail",
            "--retry-attempts",
            "9",
            "--managed",
            "group=no-delete",
            "--managed",
            "client-scope=unmanaged",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.fingerprint.mode, FingerprintMode::PerResource);
        assert_eq!(config.fingerprint.on_mismatch, MismatchBehavior::Fail);
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.policy(Category::Group), ManagedPolicy::NoDelete);
        assert_eq!(config.policy(Category::ClientScope), ManagedPolicy::Unmanaged);
        assert_eq!(config.policy(Category::Role), ManagedPolicy::Full);
    }

    #[test]
    fn test_force_disables_fingerprint() {
        let config = build_config(&make_args(&["--force"])).unwrap();
        assert!(!config.fingerprint.enabled);
    }

    #[test]
    fn test_flags_win_over_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"retry": {"max_attempts": 2, "delay_ms": 50}, "managed": {"role": "no-delete"}}"#,
        )
        .unwrap();
        let path = path.display().to_string();
        let config =
            build_config(&make_args(&["--config", &path, "--retry-delay-ms", "75"])).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.delay_ms, 75);
        assert_eq!(config.policy(Category::Role), ManagedPolicy::NoDelete);
    }

    #[test]
    fn test_bad_managed_override_is_rejected() {
        let argv = ["realmsync", "--managed", "group", "realm.json"];
        assert!(Args::try_parse_from(argv).is_err());
        let argv = ["realmsync", "--managed", "widgets=full", "realm.json"];
        assert!(Args::try_parse_from(argv).is_err());
    }
}
