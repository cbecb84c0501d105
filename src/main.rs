// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use nougat::{Bootstrap, EntryPoints};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Keygen {
            output,
            label,
            force,
        }) => cli::cmd_keygen(&output, label, force),
        Some(Commands::Pack {
            manifest,
            payload,
            key,
            output,
        }) => cli::cmd_pack(&manifest, &payload, key.as_deref(), output),
        Some(Commands::Inspect { image }) => cli::cmd_inspect(&image),
        Some(Commands::External(args)) => {
            run_registered(cli.config.as_deref(), cli.extensions_dir, &args)
        }
        None => run_registered(cli.config.as_deref(), cli.extensions_dir, &["help".to_string()]),
    }
}

/// Extension entry points linked into this binary
///
/// An extension crate exports a `fn() -> anyhow::Result<Box<dyn ExtensionModule>>`
/// and is added here under the symbol its image manifest names as
/// `entry_point`, e.g. `.with("nougat_extras_register", nougat_extras::register)`.
/// An image whose symbol is missing from this table is reported as `Failed`.
fn linked_entry_points() -> EntryPoints {
    EntryPoints::new()
}

/// Start the application and dispatch to a registered command
fn run_registered(
    config_path: Option<&Path>,
    extensions_dir: Option<PathBuf>,
    args: &[String],
) -> Result<()> {
    let mut bootstrap =
        Bootstrap::from_config_file(config_path).context("Failed to load configuration")?;
    if let Some(dir) = extensions_dir {
        bootstrap = bootstrap.with_extensions_dir(dir);
    }

    let app = bootstrap
        .with_entry_points(linked_entry_points())
        .run()
        .context("Startup failed")?;

    let (name, rest) = args
        .split_first()
        .context("No command given")?;
    app.run_command(name, rest)
}
