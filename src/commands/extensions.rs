// src/commands/extensions.rs

use crate::extensions::{ExtensionInfo, ExtensionReport};
use crate::registry::{Command, CommandContext, Component, Resolver};
use anyhow::{Context, Result};

/// Report what happened to each extension at startup
pub struct ExtensionsCommand;

impl Component for ExtensionsCommand {
    fn construct(_resolver: &Resolver<'_>) -> Result<Self> {
        Ok(Self)
    }
}

impl Command for ExtensionsCommand {
    fn names() -> &'static [&'static str] {
        &["extensions", "extension", "ext"]
    }

    fn summary(&self) -> &str {
        "Show discovered extensions and their status"
    }

    fn run(&self, ctx: &CommandContext<'_>) -> Result<()> {
        let report = ctx.container.resolve::<ExtensionReport>()?;
        let json = ctx.args.iter().any(|a| a == "--json");
        let filter = ctx.args.iter().find(|a| !a.starts_with("--"));

        let selected: Vec<&ExtensionInfo> = match filter {
            Some(name) => vec![report
                .get(name)
                .with_context(|| format!("No extension named '{}'", name))?],
            None => report.extensions().iter().collect(),
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&selected)?);
            return Ok(());
        }

        println!("Extensions directory: {}", ctx.config.extensions_dir.display());
        if selected.is_empty() {
            println!("No extensions found.");
            return Ok(());
        }
        println!();
        for info in selected {
            println!(
                "  {:<24} {:<10} {:<10} {}",
                info.name,
                info.version.as_deref().unwrap_or("-"),
                info.status,
                info.identity.as_ref().map(|t| t.as_str()).unwrap_or("unsigned")
            );
            if let Some(reason) = &info.reason {
                println!("      {}", reason);
            }
        }
        if report.is_licensed() {
            println!();
            println!("Licensed extension is active.");
        }
        Ok(())
    }
}
