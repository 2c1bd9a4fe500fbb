use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vodpack")]
#[command(author, version, about = "VOD segment packager for fragmented MP4 and WebM")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Package the segment described by a job file
    Package {
        /// Job description (JSON)
        #[arg(long, required = true)]
        job: PathBuf,

        /// Output file
        #[arg(long, required_unless_present = "size_only")]
        out: Option<PathBuf>,

        /// Only compute the segment size
        #[arg(long)]
        size_only: bool,
    },

    /// Write the initialization segment for the tracks of a job file
    Init {
        /// Job description (JSON)
        #[arg(long, required = true)]
        job: PathBuf,

        /// Output file
        #[arg(long, required = true)]
        out: PathBuf,
    },

    /// Validate configuration file
    ValidateConfig,
}
