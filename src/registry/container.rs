// src/registry/container.rs
//! Immutable service and command container
//!
//! [`Catalog::seal`](super::Catalog::seal) hands every pending binding to a
//! [`ContainerBuilder`]. The default builder produces a [`ServiceContainer`],
//! which constructs instances on demand and answers command lookups. Nothing
//! can be registered into a built container.

use super::{
    normalize_command_name, CapabilityId, Command, CommandBinding, Implementation,
    ImplementationInfo, Instance, Origin, ResolveError, ServiceBinding,
};
use crate::config::NougatConfig;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Receiver for sealed bindings
pub trait ContainerBuilder {
    fn add_service(&mut self, capability: CapabilityId, binding: ServiceBinding);
    fn add_multi(&mut self, capability: CapabilityId, implementations: Vec<Implementation>);
    fn add_command(&mut self, binding: CommandBinding);
}

/// Builder for [`ServiceContainer`]
#[derive(Default)]
pub struct ServiceContainerBuilder {
    services: HashMap<CapabilityId, ServiceBinding>,
    multi: HashMap<CapabilityId, Vec<Implementation>>,
    commands: Vec<CommandBinding>,
}

impl ContainerBuilder for ServiceContainerBuilder {
    fn add_service(&mut self, capability: CapabilityId, binding: ServiceBinding) {
        self.services.insert(capability, binding);
    }

    fn add_multi(&mut self, capability: CapabilityId, implementations: Vec<Implementation>) {
        self.multi.insert(capability, implementations);
    }

    fn add_command(&mut self, binding: CommandBinding) {
        self.commands.push(binding);
    }
}

impl ServiceContainerBuilder {
    pub fn build(self) -> ServiceContainer {
        let services = self
            .services
            .into_iter()
            .map(|(capability, binding)| {
                (
                    capability,
                    Slot {
                        binding,
                        instance: OnceLock::new(),
                    },
                )
            })
            .collect();

        let multi = self
            .multi
            .into_iter()
            .map(|(capability, implementations)| {
                let slots = implementations
                    .into_iter()
                    .map(|implementation| MultiSlot {
                        implementation,
                        instance: OnceLock::new(),
                    })
                    .collect();
                (capability, slots)
            })
            .collect();

        let mut commands: Vec<Arc<CommandEntry>> = self
            .commands
            .into_iter()
            .map(|binding| Arc::new(CommandEntry { binding }))
            .collect();
        commands.sort_by(|a, b| a.primary_name().cmp(b.primary_name()));

        let mut by_name = HashMap::new();
        for entry in &commands {
            for name in entry.names() {
                by_name.insert(name.clone(), Arc::clone(entry));
            }
        }

        ServiceContainer {
            services,
            multi,
            commands,
            by_name,
        }
    }
}

struct Slot {
    binding: ServiceBinding,
    instance: OnceLock<Instance>,
}

struct MultiSlot {
    implementation: Implementation,
    instance: OnceLock<Instance>,
}

/// A sealed command registration
pub struct CommandEntry {
    binding: CommandBinding,
}

impl CommandEntry {
    pub fn primary_name(&self) -> &str {
        self.binding.primary_name()
    }

    /// Primary name followed by aliases
    pub fn names(&self) -> &[String] {
        self.binding.names()
    }

    pub fn aliases(&self) -> &[String] {
        &self.binding.names()[1..]
    }

    pub fn info(&self) -> &ImplementationInfo {
        self.binding.info()
    }

    pub fn origin(&self) -> &Origin {
        &self.binding.info().origin
    }
}

/// Sealed, immutable set of services and commands
pub struct ServiceContainer {
    services: HashMap<CapabilityId, Slot>,
    multi: HashMap<CapabilityId, Vec<MultiSlot>>,
    commands: Vec<Arc<CommandEntry>>,
    by_name: HashMap<String, Arc<CommandEntry>>,
}

impl ServiceContainer {
    pub fn builder() -> ServiceContainerBuilder {
        ServiceContainerBuilder::default()
    }

    /// Resolve the single binding for `C`
    pub fn resolve<C>(&self) -> Result<Arc<C>, ResolveError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        Resolver::root(self).resolve::<C>()
    }

    /// Resolve every implementation of the multi-capability `C`, in
    /// registration order
    pub fn resolve_all<C>(&self) -> Result<Vec<Arc<C>>, ResolveError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        Resolver::root(self).resolve_all::<C>()
    }

    /// Binding recorded for `C`
    pub fn binding<C: ?Sized + 'static>(&self) -> Option<&ServiceBinding> {
        self.services.get(&CapabilityId::of::<C>()).map(|slot| &slot.binding)
    }

    pub fn contains<C: ?Sized + 'static>(&self) -> bool {
        let capability = CapabilityId::of::<C>();
        self.services.contains_key(&capability) || self.multi.contains_key(&capability)
    }

    /// Look up a command by primary name or alias, ignoring case
    pub fn command(&self, name: &str) -> Option<&CommandEntry> {
        self.by_name
            .get(&normalize_command_name(name))
            .map(|entry| entry.as_ref())
    }

    /// All commands, sorted by primary name
    pub fn commands(&self) -> impl Iterator<Item = &CommandEntry> {
        self.commands.iter().map(|entry| entry.as_ref())
    }

    /// Construct the handler for the command `name`
    pub fn instantiate_command(&self, name: &str) -> Result<Arc<dyn Command>, ResolveError> {
        let entry = self
            .by_name
            .get(&normalize_command_name(name))
            .ok_or_else(|| ResolveError::UnknownCommand(name.to_string()))?;

        entry
            .binding
            .instantiate(&Resolver::root(self))
            .map_err(|e| construction_error("command", entry.info().type_name, e))
    }
}

/// Resolution context handed to constructors
///
/// Tracks the chain of capabilities being constructed so that circular
/// dependencies fail instead of recursing forever.
pub struct Resolver<'c> {
    container: &'c ServiceContainer,
    path: Vec<CapabilityId>,
}

impl<'c> Resolver<'c> {
    fn root(container: &'c ServiceContainer) -> Self {
        Self {
            container,
            path: Vec::new(),
        }
    }

    fn descend(&self, capability: CapabilityId) -> Result<Resolver<'c>, ResolveError> {
        if self.path.contains(&capability) {
            let mut names: Vec<&str> = self.path.iter().map(|c| c.name()).collect();
            names.push(capability.name());
            return Err(ResolveError::Cycle {
                capability: capability.name(),
                path: names.join(" -> "),
            });
        }

        let mut path = self.path.clone();
        path.push(capability);
        Ok(Resolver {
            container: self.container,
            path,
        })
    }

    /// The container being resolved from
    pub fn container(&self) -> &'c ServiceContainer {
        self.container
    }

    pub fn resolve<C>(&self) -> Result<Arc<C>, ResolveError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let capability = CapabilityId::of::<C>();
        let slot = self
            .container
            .services
            .get(&capability)
            .ok_or(ResolveError::NotRegistered(capability.name()))?;

        let instance = match &slot.binding {
            ServiceBinding::Transient(implementation) => {
                self.descend(capability)?.instantiate(capability, implementation)?
            }
            ServiceBinding::Singleton(implementation) | ServiceBinding::Factory(implementation) => {
                match slot.instance.get() {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        let created =
                            self.descend(capability)?.instantiate(capability, implementation)?;
                        Arc::clone(slot.instance.get_or_init(|| created))
                    }
                }
            }
        };

        downcast::<C>(capability, &instance)
    }

    pub fn resolve_all<C>(&self) -> Result<Vec<Arc<C>>, ResolveError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let capability = CapabilityId::of::<C>();
        let Some(slots) = self.container.multi.get(&capability) else {
            return Ok(Vec::new());
        };

        let mut resolved = Vec::with_capacity(slots.len());
        for slot in slots {
            let instance = match slot.instance.get() {
                Some(existing) => Arc::clone(existing),
                None => {
                    let created = self
                        .descend(capability)?
                        .instantiate(capability, &slot.implementation)?;
                    Arc::clone(slot.instance.get_or_init(|| created))
                }
            };
            resolved.push(downcast::<C>(capability, &instance)?);
        }
        Ok(resolved)
    }

    fn instantiate(
        &self,
        capability: CapabilityId,
        implementation: &Implementation,
    ) -> Result<Instance, ResolveError> {
        implementation
            .instantiate(self)
            .map_err(|e| construction_error(capability.name(), implementation.info().type_name, e))
    }
}

fn downcast<C>(capability: CapabilityId, instance: &Instance) -> Result<Arc<C>, ResolveError>
where
    C: ?Sized + Send + Sync + 'static,
{
    instance
        .downcast_ref::<Arc<C>>()
        .cloned()
        .ok_or(ResolveError::TypeMismatch {
            capability: capability.name(),
        })
}

/// Keep resolution errors raised by nested resolves intact
fn construction_error(
    capability: &'static str,
    implementation: &'static str,
    error: anyhow::Error,
) -> ResolveError {
    match error.downcast::<ResolveError>() {
        Ok(inner) => inner,
        Err(other) => ResolveError::Construction {
            capability,
            implementation,
            message: format!("{:#}", other),
        },
    }
}

/// Everything a command sees when it runs
pub struct CommandContext<'a> {
    /// Name the command was invoked as
    pub invoked_as: &'a str,
    /// Arguments following the command name
    pub args: &'a [String],
    pub container: &'a ServiceContainer,
    pub config: &'a NougatConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Catalog, Component, Origin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static BUILT: AtomicUsize = AtomicUsize::new(0);

    trait Clock: Send + Sync {
        fn now(&self) -> u64;
    }

    trait Scheduler: Send + Sync {
        fn next(&self) -> u64;
    }

    struct FixedClock;
    impl Component for FixedClock {
        fn construct(_: &Resolver<'_>) -> anyhow::Result<Self> {
            Ok(Self)
        }
    }
    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            42
        }
    }

    struct CountedClock;
    impl Component for CountedClock {
        fn construct(_: &Resolver<'_>) -> anyhow::Result<Self> {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Ok(Self)
        }
    }
    impl Clock for CountedClock {
        fn now(&self) -> u64 {
            7
        }
    }

    struct Cron {
        clock: Arc<dyn Clock>,
    }
    impl Component for Cron {
        fn construct(resolver: &Resolver<'_>) -> anyhow::Result<Self> {
            Ok(Self {
                clock: resolver.resolve::<dyn Clock>()?,
            })
        }
    }
    impl Scheduler for Cron {
        fn next(&self) -> u64 {
            self.clock.now() + 1
        }
    }

    // Depends on itself through Clock
    struct LoopClock;
    impl Component for LoopClock {
        fn construct(resolver: &Resolver<'_>) -> anyhow::Result<Self> {
            resolver.resolve::<dyn Scheduler>()?;
            Ok(Self)
        }
    }
    impl Clock for LoopClock {
        fn now(&self) -> u64 {
            0
        }
    }

    fn build(register: impl FnOnce(&Catalog)) -> ServiceContainer {
        let catalog = Catalog::new();
        register(&catalog);
        let mut builder = ServiceContainer::builder();
        catalog.seal(&mut builder).unwrap();
        builder.build()
    }

    #[test]
    fn test_nested_resolution() {
        let container = build(|catalog| {
            let core = catalog.registrar(Origin::Core);
            core.register_singleton::<dyn Clock, FixedClock>(|it| it).unwrap();
            core.register_transient::<dyn Scheduler, Cron>(|it| it).unwrap();
        });

        assert_eq!(container.resolve::<dyn Scheduler>().unwrap().next(), 43);
    }

    #[test]
    fn test_singleton_constructed_once() {
        let container = build(|catalog| {
            catalog
                .registrar(Origin::Core)
                .register_singleton::<dyn Clock, CountedClock>(|it| it)
                .unwrap();
        });

        let before = BUILT.load(Ordering::SeqCst);
        let a = container.resolve::<dyn Clock>().unwrap();
        let b = container.resolve::<dyn Clock>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(BUILT.load(Ordering::SeqCst), before + 1);
        assert_eq!(a.now(), 7);
    }

    #[test]
    fn test_cycle_is_reported() {
        let container = build(|catalog| {
            let core = catalog.registrar(Origin::Core);
            core.register_singleton::<dyn Clock, LoopClock>(|it| it).unwrap();
            core.register_singleton::<dyn Scheduler, Cron>(|it| it).unwrap();
        });

        let err = container.resolve::<dyn Clock>().err().unwrap();
        assert!(matches!(err, ResolveError::Cycle { .. }), "got {:?}", err);
    }

    #[test]
    fn test_unregistered_capability() {
        let container = build(|_| {});
        assert!(matches!(
            container.resolve::<dyn Clock>().err(),
            Some(ResolveError::NotRegistered(_))
        ));
        assert!(container.resolve_all::<dyn Clock>().unwrap().is_empty());
        assert!(matches!(
            container.instantiate_command("install").err(),
            Some(ResolveError::UnknownCommand(_))
        ));
    }
}
