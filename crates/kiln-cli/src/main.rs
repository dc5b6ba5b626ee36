//! kiln - GPU compute-dispatch lifecycle runner
//!
//! Runs a pass-through image kernel on each backend variant and checks the
//! readback against the host reference.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "GPU compute-dispatch lifecycle runner")]
#[command(long_about = "
Acquires a device, uploads a synthetic image, compiles a kernel, dispatches
one invocation per pixel, reads the result back and validates it. Each
backend runs in its own isolated session and tears down in reverse
creation order.

Examples:
  kiln run                              # All backends, 8x8x4
  kiln run -b explicit -W 64 -H 32 -C 3
  kiln run --seed 42 --tolerance 0.001
  kiln probe                            # Show backend availability
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lifecycle on one or all backends
    #[command(visible_alias = "r")]
    Run(RunArgs),

    /// List backends and whether a capable device was found
    #[command(visible_alias = "p")]
    Probe,
}

#[derive(Args)]
struct RunArgs {
    /// Backend: all, stream, raster, explicit
    #[arg(short, long, default_value = "all")]
    backend: String,

    /// Image width
    #[arg(short = 'W', long)]
    width: Option<u32>,

    /// Image height
    #[arg(short = 'H', long)]
    height: Option<u32>,

    /// Channels per pixel (1-4)
    #[arg(short = 'C', long)]
    channels: Option<u32>,

    /// Seed for the synthetic image
    #[arg(long)]
    seed: Option<u64>,

    /// Kernel directory
    #[arg(short, long)]
    kernels: Option<PathBuf>,

    /// Completion wait limit in milliseconds
    #[arg(long)]
    fence_timeout_ms: Option<u64>,

    /// Per-sample tolerance (default depends on the sample type)
    #[arg(short, long)]
    tolerance: Option<f64>,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run(args) => commands::run::run(args, cli.verbose),
        Commands::Probe => commands::probe::run(cli.verbose),
    }
}
