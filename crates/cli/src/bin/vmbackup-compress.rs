use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vmbackup_storage::compress::DEFAULT_LEVEL;
use vmbackup_storage::compress_backup_dir;

/// Compresses backup entries marked success_compress.
#[derive(Debug, Parser)]
#[command(name = "vmbackup-compress", version)]
struct Args {
    /// backup_dir holding one directory per VM
    backup_dir: PathBuf,

    /// zstd level
    #[arg(long, default_value_t = DEFAULT_LEVEL)]
    level: i32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let report = compress_backup_dir(&args.backup_dir, args.level)
        .with_context(|| format!("compressing {:?}", args.backup_dir))?;
    info!(
        entries = report.entries.len(),
        files = report.files,
        bytes_in = report.bytes_in,
        bytes_out = report.bytes_out,
        "compression sweep done"
    );
    Ok(())
}
