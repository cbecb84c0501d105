// src/registry/mod.rs
//! Registration catalog for services and commands
//!
//! Core code and every extension register their services and commands through
//! the same contract: a [`Registrar`] handle stamped with the caller's
//! [`Origin`]. Registrations accumulate in the [`Catalog`] until it is sealed
//! into an immutable [`ServiceContainer`].
//!
//! # Bindings
//!
//! - **Single**: one binding per capability, either a singleton type, a
//!   transient type or a lazily invoked factory
//! - **Multi**: an ordered list of implementations for a capability that was
//!   declared multi (e.g. all package-source backends)
//! - **Command**: an implementation claiming a primary name and its aliases
//!
//! Competing registrations are settled by the conflict rules in [`arbiter`].
//!
//! # Example
//!
//! ```ignore
//! let catalog = Catalog::new();
//! let core = catalog.registrar(Origin::Core);
//! core.register_singleton::<dyn SourceRunner, WindowsFeatures>(|it| it)?;
//! core.register_command::<ListCommand>()?;
//!
//! let mut builder = ServiceContainer::builder();
//! catalog.seal(&mut builder)?;
//! let container = builder.build();
//! ```

pub mod arbiter;
mod catalog;
pub mod container;

pub use arbiter::Decision;
pub use catalog::{Catalog, CatalogSnapshot, Registrar, ValidationRule};
pub use container::{
    CommandContext, CommandEntry, ContainerBuilder, Resolver, ServiceContainer,
    ServiceContainerBuilder,
};

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Contract name carried by types that implement the registrar themselves.
///
/// The core installs a validation rule that rejects any extension
/// registration of such a type.
pub const REGISTRAR_CONTRACT: &str = "nougat.registrar";

/// Errors raised while registering into the catalog
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registration is closed: the container was already built (attempted {operation})")]
    AlreadyBuilt { operation: &'static str },

    #[error(
        "The command '{name}' is already registered by {existing} ({existing_origin}); \
         {candidate} ({candidate_origin}) is not allowed to replace it"
    )]
    CommandConflict {
        name: String,
        existing: &'static str,
        existing_origin: Origin,
        candidate: &'static str,
        candidate_origin: Origin,
    },

    #[error(
        "The service '{capability}' is already bound to {existing} ({existing_origin}); \
         {candidate} ({candidate_origin}) is not allowed to replace it"
    )]
    ServiceConflict {
        capability: &'static str,
        existing: &'static str,
        existing_origin: Origin,
        candidate: &'static str,
        candidate_origin: Origin,
    },

    #[error("'{0}' was not declared as a multi-capability")]
    NotMultiCapability(&'static str),

    #[error("'{0}' is a multi-capability and cannot take a single binding")]
    MultiCapabilityMisuse(&'static str),

    #[error("Command type {0} declares no command names")]
    NoCommandNames(&'static str),

    #[error("The replace permission was already set")]
    ReplacePermissionAlreadySet,
}

/// Errors raised while resolving from a sealed container
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No binding registered for '{0}'")]
    NotRegistered(&'static str),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Circular dependency while resolving '{capability}' (path: {path})")]
    Cycle { capability: &'static str, path: String },

    #[error("Binding for '{capability}' produced an instance of the wrong type")]
    TypeMismatch { capability: &'static str },

    #[error("Failed to construct {implementation} for '{capability}': {message}")]
    Construction {
        capability: &'static str,
        implementation: &'static str,
        message: String,
    },
}

/// Identifier of an abstract capability (usually a `dyn Trait`)
#[derive(Clone, Copy)]
pub struct CapabilityId {
    type_id: TypeId,
    name: &'static str,
}

impl CapabilityId {
    /// Identifier for the capability `C`
    pub fn of<C: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            name: std::any::type_name::<C>(),
        }
    }

    /// Type name, for diagnostics only
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for CapabilityId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for CapabilityId {}

impl std::hash::Hash for CapabilityId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Where a registration came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The main application binary
    Core,
    /// A dynamically discovered extension, by name
    Extension(String),
}

impl Origin {
    /// Origin for the named extension
    pub fn extension(name: impl Into<String>) -> Self {
        Self::Extension(name.into())
    }

    pub fn is_core(&self) -> bool {
        matches!(self, Self::Core)
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, Self::Extension(_))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core => f.write_str("core"),
            Self::Extension(name) => write!(f, "extension {}", name),
        }
    }
}

/// A type that the container knows how to construct
pub trait Component: Send + Sync + 'static {
    /// Build an instance, resolving collaborators through `resolver`
    fn construct(resolver: &Resolver<'_>) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Contracts this type implements beyond the capability it is bound to
    ///
    /// Validation rules inspect these (see [`REGISTRAR_CONTRACT`]).
    fn contracts() -> &'static [&'static str]
    where
        Self: Sized,
    {
        &[]
    }
}

/// A CLI command handler
pub trait Command: Send + Sync + 'static {
    /// Names this command answers to, primary name first, then aliases
    fn names() -> &'static [&'static str]
    where
        Self: Sized;

    /// One-line description for help output
    fn summary(&self) -> &str;

    /// Execute the command
    fn run(&self, ctx: &CommandContext<'_>) -> anyhow::Result<()>;
}

/// Metadata about a candidate implementation, handed to validation rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplementationInfo {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub contracts: &'static [&'static str],
    pub origin: Origin,
}

impl ImplementationInfo {
    /// Describe the component type `T` registered from `origin`
    pub fn of<T: Component>(origin: Origin) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            contracts: T::contracts(),
            origin,
        }
    }

    /// Whether the type declares `contract`
    pub fn implements(&self, contract: &str) -> bool {
        self.contracts.iter().any(|c| *c == contract)
    }

    /// Whether both describe the same concrete type
    pub fn same_type(&self, other: &ImplementationInfo) -> bool {
        self.type_id == other.type_id
    }
}

/// Type-erased instance; always holds an `Arc<C>` for its capability `C`
pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

type Constructor = Arc<dyn Fn(&Resolver<'_>) -> anyhow::Result<Instance> + Send + Sync>;

fn constructor<F>(f: F) -> Constructor
where
    F: Fn(&Resolver<'_>) -> anyhow::Result<Instance> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A registered implementation together with its constructor
#[derive(Clone)]
pub struct Implementation {
    info: ImplementationInfo,
    construct: Constructor,
}

impl Implementation {
    /// Implementation backed by the component type `T`, exposed as `C`
    pub(crate) fn for_type<C, T>(origin: Origin, cast: fn(Arc<T>) -> Arc<C>) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
        T: Component,
    {
        Self {
            info: ImplementationInfo::of::<T>(origin),
            construct: constructor(move |resolver| {
                let value = T::construct(resolver)?;
                let instance: Instance = Arc::new(cast(Arc::new(value)));
                Ok(instance)
            }),
        }
    }

    /// Implementation backed by a factory closure producing `C`
    pub(crate) fn for_factory<C, F>(origin: Origin, factory: F) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<C>> + Send + Sync + 'static,
    {
        Self {
            info: ImplementationInfo {
                type_id: TypeId::of::<F>(),
                type_name: std::any::type_name::<F>(),
                contracts: &[],
                origin,
            },
            construct: constructor(move |resolver| {
                let instance: Instance = Arc::new(factory(resolver)?);
                Ok(instance)
            }),
        }
    }

    pub fn info(&self) -> &ImplementationInfo {
        &self.info
    }

    pub(crate) fn instantiate(&self, resolver: &Resolver<'_>) -> anyhow::Result<Instance> {
        (self.construct)(resolver)
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation")
            .field("type_name", &self.info.type_name)
            .field("origin", &self.info.origin)
            .finish()
    }
}

/// Binding for a single-implementation capability
#[derive(Debug, Clone)]
pub enum ServiceBinding {
    /// One shared instance, constructed on first resolve
    Singleton(Implementation),
    /// A fresh instance per resolve
    Transient(Implementation),
    /// A factory invoked once, on first resolve
    Factory(Implementation),
}

impl ServiceBinding {
    pub fn implementation(&self) -> &Implementation {
        match self {
            Self::Singleton(imp) | Self::Transient(imp) | Self::Factory(imp) => imp,
        }
    }

    pub fn info(&self) -> &ImplementationInfo {
        self.implementation().info()
    }

    /// Lifetime label for listings
    pub fn lifetime(&self) -> &'static str {
        match self {
            Self::Singleton(_) => "singleton",
            Self::Transient(_) => "transient",
            Self::Factory(_) => "factory",
        }
    }
}

type CommandConstructor =
    Arc<dyn Fn(&Resolver<'_>) -> anyhow::Result<Arc<dyn Command>> + Send + Sync>;

fn command_constructor<F>(f: F) -> CommandConstructor
where
    F: Fn(&Resolver<'_>) -> anyhow::Result<Arc<dyn Command>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A command type and every name it claims
#[derive(Clone)]
pub struct CommandBinding {
    info: ImplementationInfo,
    names: Vec<String>,
    construct: CommandConstructor,
}

impl CommandBinding {
    pub(crate) fn for_type<T>(origin: Origin) -> Result<Self, RegistryError>
    where
        T: Command + Component,
    {
        let info = ImplementationInfo::of::<T>(origin);
        let mut names: Vec<String> = Vec::new();
        for name in T::names() {
            let name = normalize_command_name(name);
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Err(RegistryError::NoCommandNames(info.type_name));
        }

        Ok(Self {
            info,
            names,
            construct: command_constructor(|resolver| {
                let command: Arc<dyn Command> = Arc::new(T::construct(resolver)?);
                Ok(command)
            }),
        })
    }

    pub fn info(&self) -> &ImplementationInfo {
        &self.info
    }

    /// Lower-cased names, primary first
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn primary_name(&self) -> &str {
        &self.names[0]
    }

    pub(crate) fn instantiate(&self, resolver: &Resolver<'_>) -> anyhow::Result<Arc<dyn Command>> {
        (self.construct)(resolver)
    }
}

impl fmt::Debug for CommandBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBinding")
            .field("type_name", &self.info.type_name)
            .field("origin", &self.info.origin)
            .field("names", &self.names)
            .finish()
    }
}

/// Command names are matched case-insensitively
pub fn normalize_command_name(name: &str) -> String {
    name.trim().to_lowercase()
}
