//! Blockstore operator CLI
//!
//! Save, read, delete and compact payloads in a block store described by a
//! TOML config. Results are printed as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use blockstore::{BlockConfig, BlockId, BlockManager};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "blockctl")]
#[command(about = "Inspect and maintain a block-structured image store")]
struct Args {
    /// Path to TOML config (defaults apply when omitted)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the configured storage directory
    #[arg(short = 'd', long)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a file and print its metadata
    Save { file: PathBuf },

    /// Fetch a payload by locator
    Read {
        block: String,
        offset: u64,
        size: u64,
        /// Write the payload here instead of stdout
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Delete a payload and print any relocations
    Delete { block: String, offset: u64, size: u64 },

    /// Compact a block file regardless of threshold
    Compact { block: String },

    /// Print cache and block file statistics
    Stats,

    /// Print a fresh random encryption key (hex)
    Keygen,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn keygen() -> Result<()> {
    let key = BlockManager::generate_encryption_key();
    let hex: String = key.iter().map(|b| format!("{:02x}", b)).collect();
    println!("{}", hex);
    Ok(())
}

fn load_config(args: &Args) -> Result<BlockConfig> {
    let mut config = match &args.config {
        Some(path) => BlockConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BlockConfig::default(),
    };
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Needs no store
    if let Command::Keygen = args.command {
        return keygen();
    }

    let config = load_config(&args)?;
    info!(storage_dir = %config.storage_dir.display(), "opening block store");
    let store = BlockManager::open(config).context("opening block store")?;

    match args.command {
        Command::Save { file } => {
            let raw = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let meta = store.save_image(&raw)?;
            store.sync()?;
            print_json(&meta)?;
        }
        Command::Read {
            block,
            offset,
            size,
            output,
        } => {
            let bytes = store.read(&block, offset, size)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &*bytes)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), bytes = bytes.len(), "wrote payload");
                }
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
        Command::Delete {
            block,
            offset,
            size,
        } => {
            let outcome = store.delete(&block, offset, size)?;
            store.sync()?;
            print_json(&outcome)?;
        }
        Command::Compact { block } => {
            let id: BlockId = block.parse()?;
            let relocations = store.compact(id)?;
            store.sync()?;
            print_json(&relocations)?;
        }
        Command::Stats => print_json(&store.stats())?,
        Command::Keygen => keygen()?,
    }

    Ok(())
}
