use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "dxsync", version, about = "Keep a mounted project in sync with its remote object store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v for verbose, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode: suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: <config dir>/dxsync/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Flush every dirty file of a running mount and wait for the uploads
    Sync(RemoteArgs),

    /// Show the sync counters of a running mount
    Stats(RemoteArgs),

    /// Compute the multipart part size for a file under given upload limits
    PartSize(PartSizeArgs),
}

/// Arguments for commands sent to a running mount.
#[derive(clap::Args, Debug)]
pub struct RemoteArgs {
    /// Command server address (default: `command_addr` from the config)
    #[arg(long)]
    pub addr: Option<String>,
}

/// Arguments for the `dxsync part-size` command.
///
/// Sizes accept plain byte counts or units, e.g. `5MiB`, `5 GiB`, `16MB`.
#[derive(clap::Args, Debug)]
pub struct PartSizeArgs {
    /// Size of the file to upload
    pub file_size: String,

    /// Smallest part the service accepts
    #[arg(long, default_value = "5MiB")]
    pub min_part_size: String,

    /// Largest part the service accepts
    #[arg(long, default_value = "5GiB")]
    pub max_part_size: String,

    /// Maximum number of parts per object
    #[arg(long, default_value = "10000")]
    pub max_parts: u64,

    /// Largest object the service accepts
    #[arg(long, default_value = "5TiB")]
    pub max_file_size: String,

    /// Whether an empty object must receive one empty part before closing
    #[arg(long)]
    pub empty_last_part: bool,
}
