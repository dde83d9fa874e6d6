//! authorid Rabbit runner
//!
//! Runs one reconciliation batch over a JSON snapshot of record metadata and
//! identity state, writes the updated state back and prints the change log.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authorid::atomic_file::write_atomically;
use authorid::storage::{IdentitySnapshot, InMemoryIdentityStore, InMemoryMetadataSource, RecordMetadata};
use authorid::{AuthorIdError, BatchControl, Rabbit, RabbitConfig, RecordId};

/// Runner arguments
struct Args {
    /// Snapshot to read
    snapshot: PathBuf,
    /// Optional engine configuration
    config: Option<PathBuf>,
    /// Where to write the updated snapshot; defaults to `snapshot`
    output: Option<PathBuf>,
}

/// On-disk snapshot consumed and produced by the runner.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    /// Live records.
    #[serde(default)]
    records: BTreeMap<RecordId, RecordMetadata>,
    /// Records deleted upstream since the last run.
    #[serde(default)]
    deleted: BTreeSet<RecordId>,
    /// Records to reconcile; every live record if absent.
    #[serde(default)]
    batch: Option<Vec<RecordId>>,
    /// Identity state.
    #[serde(default)]
    identities: IdentitySnapshot,
}

fn usage() {
    println!("authorid-rabbit - reconcile author identities");
    println!();
    println!("USAGE:");
    println!("    authorid-rabbit --snapshot <FILE> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -s, --snapshot <FILE>     Snapshot with records and identity state");
    println!("    -c, --config <FILE>       JSON engine configuration");
    println!("    -o, --output <FILE>       Where to write the updated snapshot [default: --snapshot]");
    println!("    -h, --help                Print help information");
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut snapshot = None;
    let mut config = None;
    let mut output = None;

    let mut i = 1;
    while i < args.len() {
        let target = match args[i].as_str() {
            "--snapshot" | "-s" => &mut snapshot,
            "--config" | "-c" => &mut config,
            "--output" | "-o" => &mut output,
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        };
        let Some(value) = args.get(i + 1) else {
            eprintln!("error: {} requires a value", args[i]);
            std::process::exit(1);
        };
        *target = Some(PathBuf::from(value));
        i += 2;
    }

    let Some(snapshot) = snapshot else {
        eprintln!("error: --snapshot is required");
        usage();
        std::process::exit(1);
    };
    Args {
        snapshot,
        config,
        output,
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, AuthorIdError> {
    let json = fs::read_to_string(path)
        .map_err(|e| AuthorIdError::internal(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&json)
        .map_err(|e| AuthorIdError::internal(format!("malformed snapshot {}: {e}", path.display())))
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), AuthorIdError> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| AuthorIdError::internal(format!("cannot encode snapshot: {e}")))?;
    write_atomically(path, json.as_bytes())
        .map_err(|e| AuthorIdError::internal(format!("cannot write {}: {e}", path.display())))
}

fn run(args: &Args) -> Result<(), AuthorIdError> {
    let config = match &args.config {
        Some(path) => RabbitConfig::load(path)?,
        None => RabbitConfig::default(),
    };
    let snapshot = read_snapshot(&args.snapshot)?;
    info!(
        records = snapshot.records.len(),
        deleted = snapshot.deleted.len(),
        identities = snapshot.identities.identities.len(),
        "snapshot loaded"
    );

    let metadata = Arc::new(InMemoryMetadataSource::new());
    for (record, fields) in &snapshot.records {
        metadata.upsert_record(*record, fields.clone())?;
    }
    for record in &snapshot.deleted {
        // Only flagged records are reported as deleted.
        metadata.upsert_record(*record, RecordMetadata::default())?;
        metadata.delete_record(*record)?;
    }
    let identities = Arc::new(InMemoryIdentityStore::from_snapshot(snapshot.identities)?);

    let rabbit = Rabbit::new(config, metadata.clone(), identities.clone())?;
    let batch = snapshot
        .batch
        .unwrap_or_else(|| snapshot.records.keys().copied().collect());
    let log = rabbit.run_batch(batch, &BatchControl::new())?;

    let updated = Snapshot {
        records: snapshot.records,
        deleted: BTreeSet::new(),
        batch: None,
        identities: identities.snapshot()?,
    };
    let output = args.output.as_deref().unwrap_or(&args.snapshot);
    write_snapshot(output, &updated)?;
    info!(path = %output.display(), "snapshot written");

    let json = serde_json::to_string_pretty(&log)
        .map_err(|e| AuthorIdError::internal(format!("cannot encode change log: {e}")))?;
    println!("{json}");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "authorid=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "rabbit run failed");
            ExitCode::FAILURE
        }
    }
}
