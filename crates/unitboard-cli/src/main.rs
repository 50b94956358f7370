//! Unitboard CLI.
//!
//! A small tool around the curriculum-selection form:
//! - `unitboard serve` runs the HTTP server hosting the form page, the
//!   lookup/save API, and the operator diagnostics endpoint,
//! - `unitboard check` prints the same credential/spreadsheet diagnostics
//!   to the terminal.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use unitboard_sheets::{
    load_service_key, SheetStore, DEFAULT_SPREADSHEET_ID, SERVICE_KEY_ENV,
};

mod server;

#[derive(Parser)]
#[command(name = "unitboard")]
#[command(
    author,
    version,
    about = "Curriculum unit selection form backed by a shared spreadsheet"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server hosting the selection form and its API.
    Serve(ServeArgs),

    /// Diagnose credential and spreadsheet configuration.
    ///
    /// Prints what the server would see: whether `SERVICE_KEY` is set,
    /// whether the credentials load, and which worksheets are visible.
    /// Always exits 0; this is a report, not a gate.
    Check(CheckArgs),
}

#[derive(Args, Debug, Clone)]
pub(crate) struct ServeArgs {
    /// Listen address (use `127.0.0.1:0` to auto-pick a free port).
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Service-account key file, used when SERVICE_KEY is not set.
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Spreadsheet to read lookups from and append records to.
    #[arg(long, default_value = DEFAULT_SPREADSHEET_ID)]
    pub spreadsheet_id: String,

    /// Serve fixture data from an in-memory store (no network, no credentials).
    #[arg(long)]
    pub mock_store: bool,

    /// If set, write a small JSON file once the server is listening.
    ///
    /// Useful for scripts/tests to learn the chosen port when `--listen ...:0`.
    #[arg(long)]
    pub ready_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct CheckArgs {
    /// Service-account key file, used when SERVICE_KEY is not set.
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Spreadsheet to check against.
    #[arg(long, default_value = DEFAULT_SPREADSHEET_ID)]
    spreadsheet_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => server::cmd_serve(args),
        Commands::Check(args) => cmd_check(args),
    }
}

fn cmd_check(args: CheckArgs) -> Result<()> {
    println!("{}", "unitboard configuration check".green().bold());

    match std::env::var(SERVICE_KEY_ENV) {
        Ok(raw) if !raw.trim().is_empty() => {
            println!(
                "  {} {SERVICE_KEY_ENV}: set ({} chars)",
                "→".yellow(),
                raw.chars().count()
            );
        }
        _ => println!("  {} {SERVICE_KEY_ENV}: not set", "→".yellow()),
    }

    match load_service_key(args.key_file.as_deref()) {
        Ok(key) => println!(
            "  {} credentials: {} ({})",
            "→".green(),
            "OK".green(),
            key.client_email
        ),
        Err(e) => {
            println!("  {} credentials: {}", "→".red(), e.to_string().red());
            return Ok(());
        }
    }

    let store = SheetStore::google(args.spreadsheet_id, args.key_file);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;
    match rt.block_on(async { store.connect().await.and_then(|s| s.worksheet_titles()) }) {
        Ok(titles) => println!("  {} worksheets: {}", "→".green(), titles.join(", ")),
        Err(e) => println!("  {} spreadsheet: {}", "→".red(), e.to_string().red()),
    }
    Ok(())
}
