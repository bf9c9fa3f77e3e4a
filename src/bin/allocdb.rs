//! AllocDB command-line tool
//!
//! Inspect and poke at an allocator directory:
//! - Size class table
//! - Per-bucket statistics
//! - Root value get/set
//! - Allocate, free and size single blocks
//!
//! # Examples
//!
//! ```bash
//! # Show size classes
//! allocdb classes
//!
//! # Statistics as JSON
//! allocdb --data-dir data/allocdb stats --json
//!
//! # Set the root value
//! allocdb root --set 0x1a05
//! ```

use allocdb::storage::slab::{iter_classes, ROOT_UNSET};
use allocdb::{AllocDb, AllocatorConfig, SlotId};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// AllocDB - persistent block allocator
#[derive(Parser, Debug)]
#[command(name = "allocdb")]
#[command(version = allocdb::VERSION)]
#[command(about = "Inspect and manage an AllocDB directory", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Allocator directory (overrides the config file)
    #[arg(long, global = true, env = "ALLOCDB_PATH")]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "ALLOCDB_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the size class table
    Classes,

    /// Show per-bucket statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or set the root value
    Root {
        /// New root value (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_u64)]
        set: Option<u64>,
    },

    /// Allocate a block (new blocks read as zeros)
    Alloc {
        /// Requested size in bytes
        size: u64,
    },

    /// Free a block, checking it lies inside its bucket file
    Free {
        /// Block handle (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_u64)]
        pointer: u64,
    },

    /// Show the block size behind a handle
    SizeOf {
        /// Block handle (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_u64)]
        pointer: u64,
    },
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    match cli.command {
        Commands::Classes => {
            classes_command();
            Ok(())
        }
        Commands::SizeOf { pointer } => {
            let slot = SlotId::from_raw(pointer);
            println!("{} -> {} bytes", slot, AllocDb::size_of(slot));
            Ok(())
        }
        ref command => {
            let config = load_config(&cli)?;
            let db = AllocDb::with_config(config)?;
            run_command(&db, command)?;
            db.close()?;
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "allocdb.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AllocatorConfig> {
    let mut config = AllocatorConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.path = dir.clone();
    }
    info!(path = ?config.path, "Using allocator directory");
    Ok(config)
}

fn classes_command() {
    println!("{:>6}  {:>20}", "bucket", "block size");
    println!("───────────────────────────────");
    for (bucket, size) in iter_classes() {
        println!("{:>6}  {:>20}", bucket, size);
    }
}

fn run_command(db: &AllocDb, command: &Commands) -> anyhow::Result<()> {
    match *command {
        Commands::Stats { json } => {
            let stats = db.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            println!("Directory: {}", db.path().display());
            println!("Root:      {}", format_root(stats.root));
            println!(
                "{:>6}  {:>12}  {:>14}  {:>10}  {:>5}",
                "bucket", "block size", "file bytes", "free", "open"
            );
            println!("───────────────────────────────────────────────────────");
            for b in &stats.buckets {
                println!(
                    "{:>6}  {:>12}  {:>14}  {:>10}  {:>5}",
                    b.bucket, b.block_size, b.file_len, b.free_blocks, b.open
                );
            }
            println!(
                "Total: {} bytes on disk, {} bytes free",
                stats.total_bytes, stats.free_bytes
            );
        }
        Commands::Root { set: None } => {
            println!("{}", format_root(db.root()));
        }
        Commands::Root { set: Some(root) } => {
            db.set_root(root);
            db.flush()?;
            println!("Root set to {:#x}", root);
        }
        Commands::Alloc { size } => {
            let (slot, actual) = db.alloc(size)?;
            db.flush()?;
            println!("{:#x} ({}, {} bytes)", slot.to_raw(), slot, actual);
        }
        Commands::Free { pointer } => {
            let slot = SlotId::from_raw(pointer);
            db.free_checked(slot)
                .with_context(|| format!("{:#x} is not an allocated block", pointer))?;
            db.flush()?;
            println!("Freed {}", slot);
        }
        Commands::Classes | Commands::SizeOf { .. } => {}
    }
    Ok(())
}

fn format_root(root: u64) -> String {
    if root == ROOT_UNSET {
        "unset".to_string()
    } else {
        format!("{:#x}", root)
    }
}
