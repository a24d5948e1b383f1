//! Command-line surface, grounded on the teacher's `crates/bin::Cli`/
//! `Commands` shape (`#[derive(Parser)]` over a `#[derive(Subcommand)]`
//! enum), pared down to this daemon's three operating modes.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Drives STA Archon CCD controllers for astronomical spectrographs.
#[derive(Debug, Parser)]
#[command(name = "archond", version, about, long_about = None)]
pub struct Cli {
    /// Path to the site configuration TOML file.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// The daemon's operating modes.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to every configured controller and serve `ArchonControl`
    /// over gRPC until interrupted.
    Serve,
    /// Scan a directory for lockfiles left behind by a prior crash, replay
    /// them, and exit without starting the gRPC server.
    Recover {
        /// Directory to scan; defaults to the configured storage directory.
        directory: Option<PathBuf>,
    },
    /// Connect to every configured controller, cancel any in-flight
    /// exposure, and return the fleet to `IDLE`, then exit.
    Reset,
}
