use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::archive::EntryCompression;
use crate::parallel::ParallelOptions;

pub mod commands;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log debug output (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Pack a directory into an archive (zip, tar, or another directory).
    #[command(alias = "p")]
    Pack {
        /// The directory to pack.
        #[arg(required = true)]
        input: PathBuf,

        /// The archive to create. `.tar` writes tar, a trailing `/` a directory, anything else zip.
        #[arg(short, long)]
        output: PathBuf,

        /// Number of compression threads for zip output. [0 = auto-detect based on CPU cores]
        #[arg(long, default_value_t = 0)]
        threads: usize,

        /// Let entries land in completion order instead of input order.
        #[arg(long)]
        unordered: bool,

        /// Store zip entries without compression.
        #[arg(long, conflicts_with = "zstd")]
        store: bool,

        /// Compress zip entries with Zstandard instead of Deflate.
        #[arg(long)]
        zstd: bool,

        /// Print where the writer spent its time.
        #[arg(long)]
        stats: bool,
    },

    /// List the entries of an archive.
    #[command(alias = "l")]
    List {
        /// The archive (or directory) to list.
        #[arg(required = true)]
        archive: PathBuf,
    },

    /// Extract every entry of an archive into a directory.
    #[command(alias = "x")]
    Extract {
        /// The archive to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory to extract into. Created if missing.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Copy every entry of one archive into another, choosing the format by suffix.
    #[command(alias = "cv")]
    Convert {
        /// The source archive or directory.
        source: PathBuf,

        /// The destination. Zip-to-zip copies are raw (no recompression).
        dest: PathBuf,
    },
}

impl Commands {
    /// Builds the parallel writer options for a `pack` command.
    pub fn parallel_options(&self) -> Option<ParallelOptions> {
        let Commands::Pack { threads, unordered, store, zstd, stats, .. } = self else {
            return None;
        };
        let compression = if *store {
            EntryCompression::Store
        } else if *zstd {
            EntryCompression::Zstd
        } else {
            EntryCompression::Deflate
        };
        let defaults = ParallelOptions::default();
        Some(ParallelOptions {
            threads: if *threads == 0 { defaults.threads } else { *threads },
            preserve_order: !*unordered,
            compression,
            track_blocking: *stats,
        })
    }
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Result<Args, Box<dyn std::error::Error>> {
    Ok(Args::parse())
}
