//! Unattended governance steward CLI.
//!
//! Operates on a store directory (default `.steward`) holding config,
//! signer key, feed drop point, checkpoints, and attestation artifacts.
//! The run command drives one full agent run for a source key; status
//! reports checkpoint and counter state without side effects.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use primitive_types::{H160, H256, U256};

use attest::counter::LedgerCounter;
use attest::ledger::InMemoryLedger;
use attest::signer::AttestationSigner;
use attest::typed_data::Eip712Domain;

use steward::attestor::Attestor;
use steward::config::{StewardConfig, load_config, write_config};
use steward::exit_codes;
use steward::io::checkpoint_store::CheckpointStore;
use steward::io::engine::CommandEngine;
use steward::io::feed::FileFeed;
use steward::io::surface::CommandSurface;
use steward::run::{CoordinatorConfig, RunCoordinator, RunOptions};
use steward::shutdown::{ShutdownCoordinator, install_signal_flag};

#[derive(Parser)]
#[command(name = "steward", version, about = "Unattended governance steward")]
struct Cli {
    /// Store directory holding config, keys, and durable state.
    #[arg(long, global = true, default_value = ".steward")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the store layout and a default config if missing.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute one agent run for a source key.
    Run {
        /// Source key (named collection of items to evaluate).
        #[arg(long)]
        space: String,
        /// Decide and classify without submitting or attesting.
        #[arg(long)]
        dry_run: bool,
    },
    /// Report checkpoint and counter state for a source key.
    Status {
        #[arg(long)]
        space: String,
    },
}

fn main() {
    steward::logging::init();
    let cli = Cli::parse();
    let code = match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Init { force } => cmd_init(&cli.store, *force),
        Command::Run { space, dry_run } => cmd_run(&cli.store, space, *dry_run),
        Command::Status { space } => cmd_status(&cli.store, space),
    }
}

fn cmd_init(store: &Path, force: bool) -> Result<i32> {
    for dir in ["feed", "checkpoints", "attestations", "engine"] {
        let path = store.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("create directory {}", path.display()))?;
    }
    let config_path = store.join("config.toml");
    if force || !config_path.exists() {
        write_config(&config_path, &StewardConfig::default())?;
        println!("init: wrote {}", config_path.display());
    } else {
        println!("init: kept existing {}", config_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(store: &Path, space: &str, dry_run: bool) -> Result<i32> {
    let config = load_config(&store.join("config.toml"))?;
    let flag = install_signal_flag()?;

    let coordinator = build_coordinator(store, &config, dry_run)?;
    let coordinator = coordinator.with_quiesce_flag(flag.clone());

    let mut shutdown = ShutdownCoordinator::new(
        coordinator.gauge(),
        Duration::from_secs(config.shutdown_grace_secs),
    );
    shutdown.register(Box::new(coordinator.participant()));

    let summary = coordinator.run(space, &RunOptions { dry_run })?;

    if flag.load(Ordering::SeqCst) {
        shutdown.run();
    }

    println!(
        "run: space={} decided={} submitted={} skipped={} simulated={} errors={}",
        summary.source_key,
        summary.decided,
        summary.submitted,
        summary.skipped,
        summary.simulated,
        summary.errors.len()
    );
    for failure in &summary.errors {
        println!(
            "error: item={} phase={} reason={}",
            failure.item_id, failure.phase, failure.reason
        );
    }

    if summary.has_errors() {
        Ok(exit_codes::ITEM_ERRORS)
    } else {
        Ok(exit_codes::OK)
    }
}

fn cmd_status(store: &Path, space: &str) -> Result<i32> {
    let checkpoints = CheckpointStore::open(store.join("checkpoints"))?;
    let checkpoint = checkpoints.load(space)?;
    println!(
        "status: space={} in_flight={} completed={} pending_attestations={}",
        space,
        checkpoint.in_flight.len(),
        checkpoint.completed.len(),
        checkpoint.pending_attestations.len()
    );
    if checkpoint.unclean_shutdown() {
        println!("status: previous run ended uncleanly; recovery will run on next start");
    }
    for item_id in &checkpoint.in_flight {
        println!("status: in_flight item={item_id}");
    }

    let counter_path = store.join("counter.json");
    if counter_path.exists() {
        let contents = fs::read_to_string(&counter_path)
            .with_context(|| format!("read {}", counter_path.display()))?;
        let words: BTreeMap<H160, U256> = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", counter_path.display()))?;
        for (signer, word) in &words {
            let (active, count) = attest::counter::unpack(*word);
            println!("status: signer={signer:?} attestations={count} active={active}");
        }
    }
    Ok(exit_codes::OK)
}

type CliCoordinator =
    RunCoordinator<FileFeed, CommandEngine, CommandSurface, InMemoryLedger>;

fn build_coordinator(store: &Path, config: &StewardConfig, dry_run: bool) -> Result<CliCoordinator> {
    let feed = FileFeed::new(store.join("feed"));
    let engine = CommandEngine::new(
        config.engine.command.clone(),
        Duration::from_secs(config.engine.timeout_secs),
        config.engine.output_limit_bytes,
        store.join("engine"),
    );
    let surface = CommandSurface::new(
        config.surface.submit_command.clone(),
        config.surface.query_command.clone(),
        Duration::from_secs(config.surface.timeout_secs),
        config.surface.output_limit_bytes,
    );
    let checkpoints = CheckpointStore::open(store.join("checkpoints"))?;

    let domain = Eip712Domain {
        name: config.attestation.domain_name.clone(),
        version: config.attestation.domain_version.clone(),
        chain_id: config.attestation.chain_id,
        verifying_contract: config.verifying_contract()?,
    };
    let signer = load_signer(store, config, &domain)?;

    // Dry runs never attest, so a missing schema UID only blocks live mode.
    let schema_uid = if dry_run && config.attestation.schema_uid.is_empty() {
        H256::zero()
    } else {
        config.schema_uid()?
    };

    let ledger = InMemoryLedger::new(domain, [schema_uid]);
    let mut counter = LedgerCounter::new(
        ledger,
        config.verifying_contract()?,
        signer.address(),
    )
    .map_err(|err| anyhow!("construct ledger counter: {err}"))?;

    let counter_path = store.join("counter.json");
    if counter_path.exists() {
        let contents = fs::read_to_string(&counter_path)
            .with_context(|| format!("read {}", counter_path.display()))?;
        let words: BTreeMap<H160, U256> = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", counter_path.display()))?;
        counter.restore(words);
    }

    let attestor = Attestor::new(
        signer,
        counter,
        schema_uid,
        config.attestation.deadline_secs,
    )
    .with_store(store.join("attestations"), counter_path);

    let coordinator_config = CoordinatorConfig {
        confidence_threshold: config.confidence_threshold,
        max_items_per_run: config.max_items_per_run,
        retry: config.retry.clone(),
        policy: config.origin_policy()?,
    };

    Ok(RunCoordinator::new(
        feed,
        engine,
        surface,
        checkpoints,
        attestor,
        coordinator_config,
    ))
}

fn load_signer(
    store: &Path,
    config: &StewardConfig,
    domain: &Eip712Domain,
) -> Result<AttestationSigner> {
    let key_path = store.join(&config.attestation.key_file);
    let contents = fs::read_to_string(&key_path)
        .with_context(|| format!("read signing key {}", key_path.display()))?;
    let stripped = contents.trim().strip_prefix("0x").unwrap_or(contents.trim());
    let bytes = hex::decode(stripped)
        .with_context(|| format!("decode signing key {}", key_path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "signing key {} must be 32 bytes",
            key_path.display()
        ));
    }
    AttestationSigner::new(H256::from_slice(&bytes), domain.clone())
        .map_err(|err| anyhow!("load signing key: {err}"))
}
