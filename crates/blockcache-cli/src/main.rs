//! blockcache command-line driver.
//!
//! Serves a local directory through the block cache so the engine can be
//! exercised by hand.
//!
//! # Usage
//!
//! ```bash
//! # Print a file through the cache
//! blockcache --root ./data cat movie.bin --offset 1048576 --length 4096
//!
//! # Stream a file several times and print cache counters
//! blockcache --root ./data --block-size 1048576 bench movie.bin --passes 3
//!
//! # Show the effective configuration
//! blockcache --config cache.toml config
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use blockcache_common::config::BlockCacheConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// blockcache command-line interface
#[derive(Parser, Debug)]
#[command(
    name = "blockcache",
    version,
    about = "Read files through the blockcache buffer engine",
    long_about = "Serves a local directory as if it were a remote object store, reading\n\
                  every byte through the block cache: fixed-size buffers, clock\n\
                  eviction and sequential read-ahead."
)]
struct Args {
    /// Directory standing in for the remote store
    #[arg(short = 'r', long, default_value = ".", env = "BLOCKCACHE_ROOT")]
    root: PathBuf,

    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "BLOCKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Block size in bytes
    #[arg(long)]
    block_size: Option<u64>,

    /// Memory budget in bytes
    #[arg(long)]
    memory: Option<u64>,

    /// Worker threads
    #[arg(short = 'w', long)]
    workers: Option<u32>,

    /// Read-ahead depth in blocks (0 disables read-ahead)
    #[arg(long)]
    prefetch: Option<u32>,

    /// Enable verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a byte range of a file to stdout
    Cat {
        /// Path relative to the root
        path: String,
        /// First byte to read
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to read (default: to the end of the file)
        #[arg(long)]
        length: Option<u64>,
        /// Size of each read call
        #[arg(long, default_value_t = 64 * 1024)]
        chunk: usize,
    },
    /// Read a file repeatedly and report throughput and cache counters
    Bench {
        /// Path relative to the root
        path: String,
        /// Number of full passes
        #[arg(long, default_value_t = 1)]
        passes: u32,
        /// Size of each read call
        #[arg(long, default_value_t = 128 * 1024)]
        chunk: usize,
        /// Read chunks at random offsets instead of streaming
        #[arg(long)]
        random: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = load_config(&args)?;

    match &args.command {
        Command::Cat {
            path,
            offset,
            length,
            chunk,
        } => commands::cat(&args.root, config, path, *offset, *length, *chunk),
        Command::Bench {
            path,
            passes,
            chunk,
            random,
        } => commands::bench(&args.root, config, path, *passes, *chunk, *random),
        Command::Config => commands::print_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("blockcache=debug,blockcache_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blockcache=warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<BlockCacheConfig> {
    let mut config = match &args.config {
        Some(path) => BlockCacheConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BlockCacheConfig::default(),
    };

    // Command line arguments win over the file.
    if let Some(bytes) = args.block_size {
        config = config.with_block_size(bytes);
    }
    if let Some(bytes) = args.memory {
        config = config.with_memory_budget(bytes);
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(prefetch) = args.prefetch {
        config = config.with_prefetch(prefetch);
    }

    config.validate()?;
    Ok(config)
}
