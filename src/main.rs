use clap::Parser;
use tracing_subscriber::EnvFilter;

use dxsync::cli::args::{Cli, Commands, PartSizeArgs, RemoteArgs};
use dxsync::command::{send_command, Command, Reply};
use dxsync::config::{load_config, Verbosity};
use dxsync::error::SyncError;
use dxsync::store::UploadParameters;
use dxsync::transfer::part_size::{part_count, plan_part_size};

use bytesize::ByteSize;

fn main() {
    let cli = Cli::parse();

    let verbosity = Verbosity::from((cli.quiet, cli.verbose));

    // RUST_LOG env var overrides CLI flags
    let filter = verbosity.as_tracing_filter();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr) // Keep stdout clean for output
        .init();

    tracing::debug!("Verbosity level: {:?}", verbosity);

    if let Err(err) = run(cli) {
        display_error(&err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), SyncError> {
    match cli.command {
        Commands::Sync(args) => {
            let addr = resolve_addr(args, cli.config.as_deref())?;
            match send_command(&addr, Command::Sync)? {
                Reply::Synced(report) => {
                    if !cli.quiet {
                        eprintln!(
                            "Sync complete: {} dirty, {} updated, {} failed, {} rejected",
                            report.sweep.collected,
                            report.files_updated,
                            report.files_failed,
                            report.sweep.rejected,
                        );
                    }
                    Ok(())
                }
                other => Err(unexpected_reply(other)),
            }
        }
        Commands::Stats(args) => {
            let addr = resolve_addr(args, cli.config.as_deref())?;
            match send_command(&addr, Command::Stats)? {
                Reply::Stats(snapshot) => {
                    println!("{}", snapshot.summary());
                    Ok(())
                }
                other => Err(unexpected_reply(other)),
            }
        }
        Commands::PartSize(args) => {
            let file_size = parse_size(&args.file_size)?;
            let params = upload_parameters(&args)?;
            let part_size = plan_part_size(&params, file_size)?;
            println!(
                "{} ({} parts of {})",
                part_size,
                part_count(file_size, part_size),
                ByteSize(part_size)
            );
            Ok(())
        }
    }
}

fn resolve_addr(args: RemoteArgs, config: Option<&std::path::Path>) -> Result<String, SyncError> {
    match args.addr {
        Some(addr) => Ok(addr),
        None => Ok(load_config(config)?.command_addr),
    }
}

fn upload_parameters(args: &PartSizeArgs) -> Result<UploadParameters, SyncError> {
    Ok(UploadParameters {
        min_part_size: parse_size(&args.min_part_size)?,
        max_part_size: parse_size(&args.max_part_size)?,
        max_num_parts: args.max_parts,
        max_file_size: parse_size(&args.max_file_size)?,
        empty_last_part_allowed: args.empty_last_part,
    })
}

/// Parse a byte count such as `1048576`, `16MiB` or `5 GiB`.
fn parse_size(input: &str) -> Result<u64, SyncError> {
    let trimmed = input.trim();
    if let Ok(bytes) = trimmed.parse::<u64>() {
        return Ok(bytes);
    }
    trimmed
        .parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|e| SyncError::Config(format!("Invalid size '{}': {}", input, e)))
}

fn unexpected_reply(reply: Reply) -> SyncError {
    match reply {
        Reply::Error { message } => SyncError::Command(message),
        other => SyncError::Command(format!("unexpected reply: {:?}", other)),
    }
}

/// Display a SyncError with optional suggestion hint to stderr.
fn display_error(err: &SyncError) {
    eprintln!("error: {}", err);
    if let Some(suggestion) = err.suggestion() {
        eprintln!("  hint: {}", suggestion);
    }
}
