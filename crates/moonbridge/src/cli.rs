//! Command-line interface definitions for moonbridge.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use logging::LogArgs;

/// Command-line interface for the `moonbridge` binary.
#[derive(Parser, Debug)]
#[command(
    name = "moonbridge",
    about = "Supervised connection to the Klippy API socket",
    version
)]
pub struct Cli {
    /// Logging controls shared across moonbridge binaries.
    #[command(flatten)]
    pub log: LogArgs,

    /// Optional path to the config file (defaults to ~/.moonbridge/config.ron)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Klippy API socket, overriding the config file
    #[arg(long, value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// What to do; defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Keep the bridge connected and log its events until interrupted.
    Run,
    /// Send one request once Klippy is ready and print the result.
    Call {
        /// API method (`printer.objects.list`) or Klippy endpoint (`objects/list`).
        method: String,
        /// Request params as a JSON object.
        #[arg(value_name = "JSON")]
        params: Option<String>,
    },
    /// Subscribe to printer objects and print every update.
    Watch {
        /// Objects to watch, e.g. `toolhead` or `extruder:temperature,target`.
        #[arg(value_name = "OBJECT[:FIELDS]", required = true, num_args = 1..)]
        objects: Vec<String>,
    },
    /// Load and validate the configuration, then print it.
    Check,
}
