// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("nougat")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Nougat Contributors")
        .about("Package manager with signed, pluggable extensions")
        .disable_help_subcommand(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Configuration file (default: <config dir>/nougat/config.toml)"),
        )
        .arg(
            Arg::new("extensions_dir")
                .long("extensions-dir")
                .value_name("DIR")
                .global(true)
                .help("Directory to discover extensions in"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .subcommand(
            Command::new("keygen")
                .about("Generate an Ed25519 key pair for signing modules")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .default_value("nougat-signing")
                        .help("Output path prefix (creates PREFIX.private and PREFIX.public)"),
                )
                .arg(Arg::new("label").long("label").help("Label recorded in signatures made with the key"))
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Overwrite existing key files"),
                ),
        )
        .subcommand(
            Command::new("pack")
                .about("Build a module image from a TOML manifest and a payload")
                .arg(Arg::new("manifest").required(true).help("Module manifest"))
                .arg(Arg::new("payload").required(true).help("Payload file embedded in the image"))
                .arg(Arg::new("key").short('k').long("key").help("Private key to sign with"))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("Output file (default: <name>.ngm)"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Show a module image's manifest and signing identity")
                .arg(Arg::new("image").required(true).help("Module image file")),
        )
        .subcommand(Command::new("help").about("List available commands (alias: commands)"))
        .subcommand(
            Command::new("extensions")
                .about("Show discovered extensions and their status (aliases: extension, ext)")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
        .subcommand(Command::new("sources").about("List package source types (alias: source-types)"))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("nougat.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
