// src/commands/help.rs

use crate::registry::{Command, CommandContext, Component, Resolver};
use anyhow::Result;

/// Lists commands, or describes one
pub struct HelpCommand;

impl Component for HelpCommand {
    fn construct(_resolver: &Resolver<'_>) -> Result<Self> {
        Ok(Self)
    }
}

impl Command for HelpCommand {
    fn names() -> &'static [&'static str] {
        &["help", "commands"]
    }

    fn summary(&self) -> &str {
        "List available commands"
    }

    fn run(&self, ctx: &CommandContext<'_>) -> Result<()> {
        if let Some(name) = ctx.args.first() {
            return describe(ctx, name);
        }

        println!("Available commands:");
        println!();
        for entry in ctx.container.commands() {
            let command = ctx.container.instantiate_command(entry.primary_name())?;
            println!("  {:<14} {}", entry.primary_name(), command.summary());
        }
        println!();
        println!("Run 'nougat help <command>' for aliases and origin.");
        Ok(())
    }
}

fn describe(ctx: &CommandContext<'_>, name: &str) -> Result<()> {
    let Some(entry) = ctx.container.command(name) else {
        anyhow::bail!("Unknown command '{}'", name);
    };
    let command = ctx.container.instantiate_command(name)?;

    println!("{}", entry.primary_name());
    println!("  {}", command.summary());
    if !entry.aliases().is_empty() {
        println!("  Aliases: {}", entry.aliases().join(", "));
    }
    println!("  Provided by: {}", entry.origin());
    Ok(())
}
