// src/commands/mod.rs
//! First-party commands
//!
//! These are registered by the core like any other command, so an extension
//! may supersede them under the usual conflict rules.

mod extensions;
mod help;
mod sources;

pub use extensions::ExtensionsCommand;
pub use help::HelpCommand;
pub use sources::{NugetSource, SourceRunner, SourcesCommand};

use crate::registry::{Registrar, RegistryError};

/// Register the built-in commands and the source runner capability
pub fn register_core(registrar: &Registrar<'_>) -> Result<(), RegistryError> {
    registrar.declare_multi::<dyn SourceRunner>()?;
    registrar.register_multi::<dyn SourceRunner, NugetSource>(|it| it)?;

    registrar.register_command::<HelpCommand>()?;
    registrar.register_command::<ExtensionsCommand>()?;
    registrar.register_command::<SourcesCommand>()?;
    Ok(())
}
