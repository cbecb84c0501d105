// src/commands/sources.rs
//! Package source backends

use crate::registry::{Command, CommandContext, Component, Resolver};
use anyhow::Result;

/// A package-source backend (NuGet feeds, OS features, language packagers)
///
/// Backends are a multi-capability: every registered runner is available,
/// in registration order.
pub trait SourceRunner: Send + Sync {
    /// Value users pass to select this source, e.g. `nuget`
    fn source_type(&self) -> &str;

    fn description(&self) -> &str;
}

/// The built-in NuGet feed backend
pub struct NugetSource;

impl Component for NugetSource {
    fn construct(_resolver: &Resolver<'_>) -> Result<Self> {
        Ok(Self)
    }
}

impl SourceRunner for NugetSource {
    fn source_type(&self) -> &str {
        "nuget"
    }

    fn description(&self) -> &str {
        "NuGet v2/v3 package feeds"
    }
}

pub struct SourcesCommand;

impl Component for SourcesCommand {
    fn construct(_resolver: &Resolver<'_>) -> Result<Self> {
        Ok(Self)
    }
}

impl Command for SourcesCommand {
    fn names() -> &'static [&'static str] {
        &["sources", "source-types"]
    }

    fn summary(&self) -> &str {
        "List package source types"
    }

    fn run(&self, ctx: &CommandContext<'_>) -> Result<()> {
        let runners = ctx.container.resolve_all::<dyn SourceRunner>()?;
        if runners.is_empty() {
            println!("No package sources are registered.");
            return Ok(());
        }

        for runner in runners {
            println!("  {:<16} {}", runner.source_type(), runner.description());
        }
        Ok(())
    }
}
