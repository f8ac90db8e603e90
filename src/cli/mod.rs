use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "quark")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to <config dir>/quark/config.toml)
    #[arg(long, global = true, env = "QUARK_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy an image to another registry and print the destination digest
    Sync {
        /// Source image, pinned by digest (e.g. ghcr.io/org/app:v1@sha256:...)
        source: String,

        /// Destination tag (e.g. registry.example.com/mirror/app:v1)
        destination: String,

        /// Platforms to carry over for multi-platform images (e.g., linux/amd64,linux/arm64)
        /// Can be specified multiple times or as a comma-separated list
        #[arg(long, value_delimiter = ',')]
        platform: Option<Vec<String>>,
    },

    /// Check whether an image exists; prints true or false
    Exists {
        /// Image reference
        image: String,
    },

    /// Print the digest an image reference resolves to
    Digest {
        /// Image reference
        image: String,
    },

    /// List the tags of a repository
    Tags {
        /// Repository (e.g. ghcr.io/org/app)
        repository: String,
    },

    /// Show version information
    Version,
}
