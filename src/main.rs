//! ecshard - consistency check CLI
//!
//! Thin wrapper over [`ecshard::consistency::ConsistencyChecker`]: checks
//! erasure-coded shard files in a directory store against freshly
//! regenerated parity and hash records.
//!
//! Exit codes: 0 everything matches, 1 at least one mismatch, 2 error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use ecshard::consistency::ConsistencyChecker;
use ecshard::store::DirStore;
use ecshard::{codec_from_profile, CodecProfile, ObjectId, StripeInfo};

#[derive(Parser)]
#[command(
    name = "ecshard",
    about = "Erasure-coded shard tooling",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify that stored parity and hash records match the data shards.
    Check {
        /// Directory holding the shard files (one file per object.shard).
        #[arg(long, env = "ECSHARD_STORE")]
        store: String,

        /// Codec profile, e.g. "plugin=reed_solomon,k=2,m=1".
        #[arg(long, default_value = "plugin=reed_solomon,k=2,m=1")]
        profile: String,

        /// Per-shard chunk size in bytes.
        #[arg(long, default_value_t = 4096)]
        chunk_size: u64,

        /// Check a single object instead of every object in the store.
        #[arg(long)]
        oid: Option<String>,

        /// Emit the reports as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::from(0),
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Command::Check {
            store,
            profile,
            chunk_size,
            oid,
            json,
        } => {
            let profile = CodecProfile::parse(&profile).context("parsing codec profile")?;
            let codec = codec_from_profile(&profile).context("instantiating codec")?;
            let sinfo = Arc::new(
                StripeInfo::from_codec(&*codec, chunk_size * codec.data_chunk_count() as u64)
                    .context("building stripe geometry")?,
            );
            let store = Arc::new(DirStore::open(&store).context("opening store directory")?);
            let checker = ConsistencyChecker::new(sinfo, codec, store);

            let reports = match oid {
                Some(name) => vec![checker.check_object(&ObjectId::new(name))?],
                None => checker.check_all()?,
            };

            let mut all_ok = true;
            for report in &reports {
                if json {
                    println!("{}", serde_json::to_string(report)?);
                } else if report.consistent() {
                    println!("{}: OK", report.oid);
                } else {
                    println!("{}: MISMATCH {}", report.oid, report.notes.join("; "));
                }
                all_ok &= report.consistent();
            }
            Ok(all_ok)
        }
    }
}
