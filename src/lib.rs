// src/lib.rs

//! Nougat extensibility core
//!
//! The part of the nougat package manager that decides which code runs:
//! built-in commands and services, plus extension modules discovered at
//! startup, all registered into one catalog and sealed into an immutable
//! container.
//!
//! # Architecture
//!
//! - `registry`: registration catalog, conflict rules, sealed container
//! - `loader`: signed module images, identity-checked loading, module cache
//! - `extensions`: discovery and registration of extension modules
//! - `bootstrap`: the fixed startup sequence tying the above together
//! - `commands`: first-party commands registered by the core

pub mod bootstrap;
pub mod commands;
pub mod config;
mod error;
pub mod extensions;
pub mod loader;
pub mod registry;

pub use bootstrap::{Application, Bootstrap};
pub use config::NougatConfig;
pub use error::{Error, Result};
pub use extensions::{EntryPoints, ExtensionInfo, ExtensionModule, ExtensionStatus};
pub use loader::{KeyToken, LoadedModule, TrustedLoader};
pub use registry::{Catalog, Command, CommandContext, Component, Origin, Registrar};
