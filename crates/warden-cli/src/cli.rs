//! CLI argument definitions for Warden.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Warden -- secure vault access control and audit engine.
#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Warden -- secure vault access control and audit engine",
    long_about = "Operator tooling for a Warden vault: initialize key material, verify the \
                  audit chain, inspect audit events and check role policies."
)]
pub struct Cli {
    /// Config file (TOML, or JSON by extension). Overrides `WARDEN_CONFIG`.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory. Overrides `WARDEN_DATA_DIR` and the config file.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit machine-readable JSON (output and logs).
    #[arg(long, global = true)]
    pub json: bool,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the data directory, master key and empty stores.
    Init,

    /// Verify the audit hash chain and compare it with the mirror.
    Verify,

    /// Show recent audit events.
    Audit {
        /// Number of most recent events to show.
        #[arg(long, short = 'n', default_value_t = 20)]
        tail: usize,

        /// Only events for this principal.
        #[arg(long, short)]
        principal: Option<String>,
    },

    /// Print configured roles and assignments.
    Policies,

    /// Statically check whether a principal's role permits an operation.
    Check {
        /// Principal id.
        principal: String,

        /// Secret type: credential, pii, financial, token, certificate.
        secret_type: String,

        /// Operation: create, read, update, delete, rotate.
        operation: String,
    },
}
