//! tierq CLI - plan shared-memory queue layouts and run synthetic workloads.
//!
//! `plan` shows where each task type's staging buffer would live in a
//! group's shared memory; `simulate` drives the two-tier queue with a tree
//! fan-out workload and reports what the tiers did.

mod commands;
mod output;

use clap::{Parser, Subcommand, ValueEnum};

use commands::plan::EntrySpec;

/// Two-tier task queue planning and simulation tool.
#[derive(Parser)]
#[command(name = "tierq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Suppress progress and info messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

/// Output format options.
#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// Machine-readable JSON format
    Json,
}

/// How local group enqueues reserve slots.
#[derive(Clone, Copy, ValueEnum, Default)]
enum ModeArg {
    /// One reservation for the whole group
    #[default]
    Coalesced,
    /// One reservation per record
    PerRecord,
}

/// What happens to local records left when a group retires.
#[derive(Clone, Copy, ValueEnum, Default)]
enum ResidualArg {
    /// Move them to the external tier
    #[default]
    Drain,
    /// Throw them away
    Discard,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Plan a shared-memory layout and print where every queue lives
    Plan {
        /// Shared-memory budget in bytes
        #[arg(long, default_value_t = 48 * 1024)]
        budget: u32,

        /// Queue entry as <id>:<record_bytes>:<count=N|bytes=N|share=N>
        #[arg(long = "entry", required = true)]
        entries: Vec<EntrySpec>,
    },

    /// Run a synthetic tree fan-out workload
    Simulate(SimulateArgs),
}

/// Workload and queue parameters for `simulate`.
#[derive(clap::Args)]
struct SimulateArgs {
    /// Worker groups
    #[arg(long, default_value_t = 4)]
    groups: u32,

    /// Lanes per group
    #[arg(long, default_value_t = 32)]
    lanes: u32,

    /// Shared-memory budget per group in bytes
    #[arg(long, default_value_t = 48 * 1024)]
    budget: u32,

    /// Percent of enqueues sent straight to the external tier
    #[arg(long, default_value_t = 0)]
    spill: u32,

    /// Fill percentage a local buffer needs to beat the external tier
    #[arg(long, default_value_t = 80)]
    high_fill: u32,

    /// Tree depth below the root
    #[arg(long, default_value_t = 5)]
    depth: u32,

    /// Children per inner node
    #[arg(long, default_value_t = 4)]
    fanout: u32,

    /// Leaves emitted per deepest node
    #[arg(long, default_value_t = 2)]
    leaves: u32,

    /// Busy-work iterations per executed record
    #[arg(long, default_value_t = 0)]
    work: u32,

    /// Records each type's external queue can hold
    #[arg(long, default_value_t = 1 << 16)]
    global_capacity: usize,

    /// Lanes cooperating on one enqueued record
    #[arg(long, default_value_t = 1)]
    lanes_per_record: u32,

    /// Local enqueue reservation mode
    #[arg(long, default_value = "coalesced")]
    mode: ModeArg,

    /// Residual policy at worker end
    #[arg(long, default_value = "drain")]
    residual: ResidualArg,

    /// Seed for the spill rolls
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else if !cli.quiet {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let result = match cli.command {
        Commands::Plan { budget, entries } => {
            commands::plan::run(budget, &entries, cli.format, cli.quiet)
        }
        Commands::Simulate(args) => commands::simulate::run(&args, cli.format, cli.quiet),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
