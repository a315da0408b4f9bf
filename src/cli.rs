use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "On-device semantic photo search", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Encode every photo under a directory
    Index {
        /// Photo library root, each subdirectory is an album
        dir: PathBuf,

        /// Only encode these albums
        #[clap(short, long = "album")]
        albums: Vec<u64>,

        /// Encode on a single thread instead of the producer/consumer pipeline
        #[clap(long, default_value = "false")]
        sequential: bool,
    },

    /// Search indexed photos by text or by example image
    Search {
        /// What to look for
        #[clap(required_unless_present = "image")]
        text: Option<String>,

        /// Search by similarity to this image instead
        #[clap(short, long, conflicts_with = "text")]
        image: Option<PathBuf>,

        /// Restrict the search to these albums
        #[clap(short, long = "album")]
        albums: Vec<u64>,

        /// Minimum similarity, overrides the configured threshold
        #[clap(short, long)]
        threshold: Option<f32>,

        /// Maximum number of results, overrides the configured top_k
        #[clap(short, long)]
        limit: Option<usize>,

        /// Print results as JSON
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// List known albums and their index state
    Albums {
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Remove the embeddings of the given albums
    Forget {
        #[clap(required = true)]
        albums: Vec<u64>,
    },

    /// Show the state of the embedding store
    Status {},
}
