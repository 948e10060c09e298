//! Binary entry point for the driftwood salvage CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use driftwood::{find_nodes_quickly_at, ToolConfig};

#[derive(Parser, Debug)]
#[command(
    name = "driftwood",
    version,
    about = "Salvage tooling for driftwood database files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, help = "Path to a config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Directory holding the .couch files (overrides the config file)"
    )]
    database_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild the trailing header from the newest tree roots in the file.
    Repair {
        /// Database name (without the .couch extension)
        db: String,
    },
    /// Salvage every discoverable document into lost+found/<db>.
    LostAndFound {
        /// Database name (without the .couch extension)
        db: String,
    },
    /// List candidate leaf-node offsets found by the signature scanner.
    FindNodes {
        /// Database name (without the .couch extension)
        db: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(&T),
{
    match format {
        OutputFormat::Text => printer(value),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ToolConfig::load(cli.config.clone())?;
    if let Some(dir) = cli.database_dir.clone() {
        config.database_dir = dir;
    }

    match &cli.command {
        Command::Repair { db } => {
            let outcome = driftwood::repair(&config, db)?;
            emit(cli.format, &outcome, |outcome| match outcome {
                driftwood::RepairOutcome::Clean => {
                    println!("{db}: header is current, nothing to repair");
                }
                driftwood::RepairOutcome::NoHeader => {
                    println!(
                        "{db}: no valid header found; consider `driftwood lost-and-found {db}`"
                    );
                }
                driftwood::RepairOutcome::Repaired(report) => {
                    println!("{db}: repaired");
                    println!("  update_seq:   {}", report.update_seq);
                    println!("  by_seq root:  {}", report.by_seq_root_pos);
                    match report.by_id_root_pos {
                        Some(pos) => println!("  by_id root:   {pos}"),
                        None => println!("  by_id root:   (preserved from previous header)"),
                    }
                    println!(
                        "  header:       {} -> {}",
                        report.prev_header_pos, report.new_header_pos
                    );
                }
            })?;
        }
        Command::LostAndFound { db } => {
            driftwood::make_lost_and_found(&config, db)?;
            println!("{db}: salvage complete, see lost+found/{db}");
        }
        Command::FindNodes { db } => {
            let offsets = find_nodes_quickly_at(&config, db)?;
            emit(cli.format, &offsets, |offsets| {
                if offsets.is_empty() {
                    println!("{db}: no leaf nodes found");
                } else {
                    for offset in offsets {
                        println!("{offset}");
                    }
                }
            })?;
        }
    }
    Ok(())
}
