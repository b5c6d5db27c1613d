//! objsync CLI
//!
//! Command-line tools for exercising the objsync engine.
//!
//! # Commands
//!
//! - `simulate` - Run a sync session against a simulated remote store
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use commands::simulate::{OutputFormat, SimulateOptions};
use tracing_subscriber::EnvFilter;

/// objsync command-line tools.
#[derive(Parser)]
#[command(name = "objsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync session against a simulated remote store
    Simulate {
        /// Number of records seeded into the local store
        #[arg(short, long, default_value = "100")]
        entities: u64,

        /// Entities per request
        #[arg(short, long, default_value = "10")]
        fetch_limit: usize,

        /// Probability that a request fails transiently
        #[arg(short, long, default_value = "0.1")]
        transient_rate: f64,

        /// Record ids the remote always rejects
        #[arg(short, long, value_delimiter = ',')]
        reject: Vec<u64>,

        /// Give up on an entity after this many retries (unbounded if unset)
        #[arg(short, long)]
        max_retries: Option<u32>,

        /// Make each record wait for the previous one to sync
        #[arg(short, long)]
        dependency_chain: bool,

        /// Maximum requests in flight at once
        #[arg(short, long, default_value = "4")]
        concurrency: usize,

        /// Seed for failure injection
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            entities,
            fetch_limit,
            transient_rate,
            reject,
            max_retries,
            dependency_chain,
            concurrency,
            seed,
            format,
        } => {
            let options = SimulateOptions {
                entities,
                fetch_limit,
                transient_rate,
                rejected: reject.into_iter().collect(),
                max_retries,
                dependency_chain,
                concurrency,
                seed,
            };
            let format: OutputFormat = format.parse()?;
            commands::simulate::run(&options, format)?;
        }
        Commands::Version => {
            println!("objsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
