use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search a photo directory with a natural-language query
    Search {
        /// What to look for, e.g. "red car at night"
        query: String,

        /// Directory to search. Defaults to the current directory.
        #[clap(short, long)]
        dir: Option<PathBuf>,

        /// Maximum number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Confidence cutoff preset: loose, normal or strict
        #[clap(short, long)]
        strictness: Option<String>,

        /// Blend weight between judge confidence and embedding score (0..=1)
        #[clap(long)]
        alpha: Option<f32>,

        /// Skip visual verification, rank by embeddings only
        #[clap(long, default_value = "false")]
        no_verify: bool,

        /// Drop candidates that could not be verified instead of
        /// appending them at their embedding score
        #[clap(long, default_value = "false")]
        drop_unverified: bool,

        /// Print results as JSON instead of a table
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Precompute embeddings for a directory so later searches are fast
    Index {
        /// Directory to index. Defaults to the current directory.
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },

    /// Inspect or clear the on-disk caches
    Cache {
        #[clap(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Show cache locations and sizes
    Status {},

    /// Remove cached data
    Clear {
        /// Clear the embedding store
        #[clap(long, default_value = "false")]
        embeddings: bool,

        /// Clear cached verification verdicts
        #[clap(long, default_value = "false")]
        verdicts: bool,
    },
}
