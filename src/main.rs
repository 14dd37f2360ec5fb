//! ez-rewrap - Zone re-encryption simulator
//!
//! Entry point for the CLI application. Builds a synthetic encrypted
//! namespace, rolls the zone key, and drives a full re-encryption through
//! the real coordinator/updater pipeline.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ez_rewrap::config::CliArgs;
use ez_rewrap::kms::{KmsClient, LocalKeyProvider};
use ez_rewrap::namespace::inode::{FileEncryptionInfo, FsTree, ZoneId};
use ez_rewrap::namespace::Namespace;
use ez_rewrap::progress::{print_header, print_summary, ProgressReporter};
use ez_rewrap::reencrypt::{ReencryptionHandler, ZoneState};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::error;
use tracing_subscriber::EnvFilter;

const ZONE_PATH: &str = "/warehouse";
const ZONE_KEY: &str = "warehouse-key";

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;

    let config = args.to_config().context("Invalid configuration")?;

    // build the synthetic zone, then roll its key so every file is stale
    let kms = Arc::new(LocalKeyProvider::new());
    kms.create_key(ZONE_KEY);
    if args.fail_every > 0 {
        kms.fail_every_nth_call(args.fail_every);
    }
    let (namespace, zone_id) =
        build_namespace(&kms, args.files, args.dirs).context("Failed to build namespace")?;
    // a warm provider-side cache still holds old-version keys; submission
    // drains it
    kms.warm_edek_cache(ZONE_KEY, 128)?;
    let target_version = kms
        .roll_new_version(ZONE_KEY)
        .context("Failed to roll zone key")?;

    if !args.quiet {
        print_header(ZONE_PATH, &target_version, config.edek_threads, config.batch_size);
    }

    let handler = Arc::new(ReencryptionHandler::new(
        Arc::clone(&namespace),
        Arc::clone(&kms) as Arc<dyn KmsClient>,
        config,
    )?);
    let threads = handler.start()?;

    let started = Instant::now();
    handler.submit_zone(zone_id, &target_version)?;

    let reporter = if args.quiet {
        None
    } else {
        Some(ProgressReporter::new())
    };

    // poll until the zone reaches a terminal state
    let final_status = loop {
        let status = handler
            .list_status()
            .into_iter()
            .find(|z| z.zone_id == zone_id)
            .context("Zone status disappeared")?;
        if !status.is_active() {
            break status;
        }
        if let Some(reporter) = &reporter {
            reporter.update(&handler.progress(), started.elapsed());
        }
        thread::sleep(Duration::from_millis(100));
    };
    let elapsed = started.elapsed();

    if let Some(reporter) = &reporter {
        reporter.finish_and_clear();
    }

    handler.stop_threads();
    threads.join();

    if !args.quiet {
        print_summary(
            &format!("{:?}", final_status.state),
            final_status.files_reencrypted,
            final_status.num_failures,
            elapsed,
        );
    }

    if final_status.state == ZoneState::Failed {
        bail!("re-encryption failed on zone {}", ZONE_PATH);
    }
    Ok(())
}

/// Create a zone with `files` encrypted files spread across `dirs`
/// subdirectories, every EDEK wrapped by the current (pre-roll) key version
fn build_namespace(kms: &LocalKeyProvider, files: u64, dirs: u64) -> Result<(Arc<Namespace>, ZoneId)> {
    let mut tree = FsTree::new();
    let zone_id = tree.create_zone(ZONE_PATH, ZONE_KEY)?;

    let dirs = dirs.max(1);
    for d in 0..dirs {
        tree.mkdir(&format!("{}/d{:04}", ZONE_PATH, d))?;
    }
    for f in 0..files {
        let dir = f % dirs;
        let edek = kms.generate_encrypted_key(ZONE_KEY)?;
        tree.create_file(
            &format!("{}/d{:04}/f{:07}", ZONE_PATH, dir, f),
            Some(FileEncryptionInfo::new(edek)),
        )?;
    }

    Ok((Arc::new(Namespace::new(tree)), zone_id))
}

/// Setup logging to stderr with the given verbosity
fn setup_logging(verbose: bool) -> Result<()> {
    let default_filter = if verbose { "ez_rewrap=debug" } else { "ez_rewrap=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
