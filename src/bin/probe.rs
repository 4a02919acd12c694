//! opfs-probe
//!
//! Installs the bridge over a directory, runs the sanity scenario and a small
//! SQL workload through the VFS, then prints the collected metrics.

use anyhow::{bail, Context, Result};
use clap::Parser;
use opfs_bridge::{BridgeBuilder, BridgeOptions};
use rusqlite::{params, Connection, OpenFlags};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "opfs-probe")]
#[command(about = "Exercise the async storage VFS bridge against a directory")]
struct Args {
    /// Storage root directory
    #[arg(short = 'r', long, default_value = "opfs")]
    root: PathBuf,

    /// TOML options file; command-line flags override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Name to register the VFS under
    #[arg(long)]
    vfs_name: Option<String>,

    /// Bridge verbosity (0-3)
    #[arg(short = 'v', long)]
    verbosity: Option<u8>,

    /// Rows inserted by the workload
    #[arg(short = 'n', long, default_value = "1000")]
    rows: u32,

    /// Skip the sanity scenario
    #[arg(long)]
    no_sanity: bool,

    /// Delete a sanity file left behind by an interrupted run
    #[arg(long)]
    clear_sanity_leftover: bool,

    /// Release implicit locks after every operation
    #[arg(long)]
    unlock_asap: bool,

    /// Print metrics as JSON
    #[arg(long)]
    json: bool,

    /// Remove the workload database afterwards
    #[arg(long)]
    cleanup: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut options = match &args.config {
        Some(path) => BridgeOptions::load(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => BridgeOptions::default(),
    };
    options.root = args.root.clone();
    if let Some(name) = &args.vfs_name {
        options.vfs_name = name.clone();
    }
    if let Some(level) = args.verbosity {
        options.verbosity = level;
    }
    options.sanity_check = !args.no_sanity;
    options.sanity_clear_leftover |= args.clear_sanity_leftover;
    options.unlock_asap |= args.unlock_asap;

    info!("Storage root: {:?}", options.root);
    let started = Instant::now();
    let bridge = BridgeBuilder::from_options(options)
        .install()
        .context("installing the bridge")?;
    info!("Bridge installed in {:?}", started.elapsed());

    run_workload(bridge.name(), args.rows)?;

    if args.cleanup && !bridge.util().unlink("probe.db", false)? {
        bail!("could not remove probe.db");
    }

    let client = bridge.client_metrics();
    let worker = bridge.worker_metrics(false)?;
    if args.json {
        println!("{}", client.to_json()?);
        println!("{}", worker.to_json()?);
    } else {
        println!("{:<16} {:>8} {:>12} {:>12}", "op", "calls", "client us", "worker us");
        for (name, op) in &client.ops {
            let worker_us = worker.ops.get(name).map(|w| w.time_us).unwrap_or(0);
            println!(
                "{:<16} {:>8} {:>12} {:>12}",
                name, op.count, op.wait_us, worker_us
            );
        }
        println!("total calls: {}", client.total_calls());
    }

    println!("{}", serde_json::to_string_pretty(&bridge.util().tree_list()?)?);
    Ok(())
}

fn run_workload(vfs: &str, rows: u32) -> Result<()> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI;
    let mut conn = Connection::open_with_flags_and_vfs("probe.db", flags, vfs)
        .context("opening probe.db through the bridge")?;

    let started = Instant::now();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS samples(id INTEGER PRIMARY KEY, label TEXT, value REAL);
         DELETE FROM samples;",
    )?;
    let tx = conn.transaction()?;
    {
        let mut insert = tx.prepare("INSERT INTO samples(label, value) VALUES (?1, ?2)")?;
        for i in 0..rows {
            insert.execute(params![format!("sample-{}", i), i as f64 * 0.5])?;
        }
    }
    tx.commit()?;

    let (count, sum): (u32, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(value), 0) FROM samples",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if count != rows {
        bail!("expected {} rows, found {}", rows, count);
    }
    info!(
        "Workload: {} rows (sum {}) in {:?}",
        count,
        sum,
        started.elapsed()
    );
    Ok(())
}
