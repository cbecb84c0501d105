// src/cli/mod.rs
//! CLI definitions for nougat
//!
//! A handful of module tooling commands are handled here directly:
//! - `keygen` - Generate a module signing key pair
//! - `pack` - Build a signed module image
//! - `inspect` - Show a module image's manifest and identity
//!
//! Anything else is looked up in the sealed command container, so built-in
//! commands (`help`, `extensions`, `sources`) and extension commands are
//! dispatched the same way.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod module;

pub use module::{cmd_inspect, cmd_keygen, cmd_pack};

#[derive(Parser)]
#[command(name = "nougat")]
#[command(author, version)]
#[command(about = "Package manager with signed, pluggable extensions", long_about = None)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Configuration file (default: <config dir>/nougat/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory to discover extensions in
    #[arg(long, global = true, value_name = "DIR")]
    pub extensions_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate an Ed25519 key pair for signing modules
    Keygen {
        /// Output path prefix (creates PREFIX.private and PREFIX.public)
        #[arg(short, long, default_value = "nougat-signing")]
        output: String,

        /// Label recorded in signatures made with the key
        #[arg(long)]
        label: Option<String>,

        /// Overwrite existing key files
        #[arg(short, long)]
        force: bool,
    },

    /// Build a module image from a TOML manifest and a payload
    Pack {
        /// Module manifest (name, version, entry_point, description, requires)
        manifest: PathBuf,

        /// Payload file embedded in the image
        payload: PathBuf,

        /// Private key to sign with; the image is unsigned without one
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// Output file (default: <name>.ngm)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show a module image's manifest and signing identity
    Inspect {
        /// Module image file
        image: PathBuf,
    },

    /// Commands registered by the core or by extensions
    #[command(external_subcommand)]
    External(Vec<String>),
}
