//! Command-line surface of the `mothership` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Mothership orchestration server
///
/// Turns curated values and beliefs into directives, routes tasks to live
/// agents and classifies their output before it is accepted.
#[derive(Parser, Debug)]
#[command(name = "mothership")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Alternate configuration file (default: ~/.mothership/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the API server and the supervisor loop
    Serve {
        /// Override `server.port`
        #[arg(short, long)]
        port: Option<u16>,
        /// Override `storage.db_path`
        #[arg(long, value_name = "PATH")]
        db: Option<String>,
    },

    /// Load values and beliefs from a TOML file into the knowledge base
    Seed {
        /// Seed file
        file: PathBuf,
        /// Override `storage.db_path`
        #[arg(long, value_name = "PATH")]
        db: Option<String>,
    },

    /// Write a configuration file, asking for the essentials
    Init {
        /// Accept every default without prompting
        #[arg(long)]
        defaults: bool,
    },

    /// Print the effective configuration (secrets redacted)
    Config,
}
