//! Command-line interface for tally
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand is defined in its own submodule.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;

mod config;
mod scan;
mod watch;

/// tally - incremental chat transcript extraction
///
/// Derives tasks, inventory, contacts, points, red envelopes and avatars
/// from a JSONL chat transcript, and keeps them reconciled as it grows.
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to a .tally.toml (defaults to ./.tally.toml, then the user config dir)
    #[arg(long, global = true, env = "TALLY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one extraction pass over a transcript and print the result
    Scan {
        /// JSONL transcript file
        file: PathBuf,
    },

    /// Watch a transcript and emit delta events until interrupted
    Watch {
        /// JSONL transcript file
        file: PathBuf,

        /// Event destination: "-" for stdout (default) or a file path
        #[arg(long)]
        events: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Write a default .tally.toml in the current directory
        #[arg(long)]
        init: bool,
    },
}

impl Cli {
    /// Whether delta events will be written to stdout, in which case the
    /// JSON envelope is suppressed.
    pub fn events_to_stdout(&self) -> bool {
        match &self.command {
            Commands::Watch { events, .. } => events
                .as_deref()
                .map(|value| value.trim() == "-")
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Scan { file } => scan::run(scan::ScanOptions {
                file,
                config: self.config,
                json: self.json,
                quiet: self.quiet,
            }),
            Commands::Watch { file, events } => watch::run(watch::WatchOptions {
                file,
                events,
                config: self.config,
                json: self.json,
                quiet: self.quiet,
            }),
            Commands::Config { init } => config::run(config::ConfigOptions {
                init,
                config: self.config,
                json: self.json,
                quiet: self.quiet,
            }),
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}
