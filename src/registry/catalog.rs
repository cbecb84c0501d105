// src/registry/catalog.rs
//! Pending registration tables and the seal transition

use super::arbiter::{arbitrate_command, arbitrate_service, Decision};
use super::container::ContainerBuilder;
use super::{
    CapabilityId, Command, CommandBinding, Component, Implementation, ImplementationInfo, Origin,
    RegistryError, ServiceBinding,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

type Predicate = Arc<dyn Fn(&ImplementationInfo) -> bool + Send + Sync>;

/// A named predicate that may veto a registration
///
/// Returning `false` rejects the candidate. Rejection is silent: the
/// registration call succeeds without recording anything.
#[derive(Clone)]
pub struct ValidationRule {
    name: String,
    predicate: Predicate,
}

impl ValidationRule {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ImplementationInfo) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allows(&self, candidate: &ImplementationInfo) -> bool {
        (self.predicate)(candidate)
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule").field("name", &self.name).finish()
    }
}

/// Command name ownership
#[derive(Debug, Clone, Default)]
struct CommandTable {
    owners: HashMap<String, TypeId>,
    bindings: HashMap<TypeId, CommandBinding>,
}

impl CommandTable {
    /// Drop a binding and release every name it still owns
    fn release(&mut self, type_id: TypeId) -> Option<CommandBinding> {
        let binding = self.bindings.remove(&type_id)?;
        for name in binding.names() {
            if self.owners.get(name) == Some(&type_id) {
                self.owners.remove(name);
            }
        }
        Some(binding)
    }
}

/// Registration catalog
///
/// Append-until-sealed store of service and command bindings. Safe to share
/// across threads; every mutation holds the read side of the seal gate, and
/// [`Catalog::seal`] takes the write side, so nothing slips in after sealing.
pub struct Catalog {
    sealed: RwLock<bool>,
    services: DashMap<CapabilityId, ServiceBinding>,
    multi: DashMap<CapabilityId, Vec<Implementation>>,
    /// Held while deciding whether a capability is single or multi
    kinds: Mutex<()>,
    commands: Mutex<CommandTable>,
    validators: RwLock<Vec<ValidationRule>>,
    replace_permission: OnceLock<bool>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            sealed: RwLock::new(false),
            services: DashMap::new(),
            multi: DashMap::new(),
            kinds: Mutex::new(()),
            commands: Mutex::new(CommandTable::default()),
            validators: RwLock::new(Vec::new()),
            replace_permission: OnceLock::new(),
        }
    }

    /// Registration handle stamped with `origin`
    pub fn registrar(&self, origin: Origin) -> Registrar<'_> {
        Registrar {
            catalog: self,
            origin,
        }
    }

    /// Add a validation rule (core only, before sealing)
    pub fn register_validator(&self, rule: ValidationRule) -> Result<(), RegistryError> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt {
                operation: "register_validator",
            });
        }

        debug!("Registered validation rule '{}'", rule.name());
        self.validators.write().push(rule);
        Ok(())
    }

    /// Set the process-wide replace permission; allowed once
    pub fn set_replace_permission(&self, allow: bool) -> Result<(), RegistryError> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt {
                operation: "set_replace_permission",
            });
        }

        self.replace_permission
            .set(allow)
            .map_err(|_| RegistryError::ReplacePermissionAlreadySet)?;
        info!("Replacing existing registrations is {}", if allow { "allowed" } else { "denied" });
        Ok(())
    }

    /// Current replace permission (defaults to denied when never set)
    pub fn replace_permission(&self) -> bool {
        self.replace_permission.get().copied().unwrap_or(false)
    }

    pub fn is_sealed(&self) -> bool {
        *self.sealed.read()
    }

    /// Implementation currently bound to `capability`, if any
    pub fn service_owner(&self, capability: CapabilityId) -> Option<ImplementationInfo> {
        self.services.get(&capability).map(|b| b.info().clone())
    }

    /// Implementation currently claiming the command `name`, if any
    pub fn command_owner(&self, name: &str) -> Option<ImplementationInfo> {
        let name = super::normalize_command_name(name);
        let table = self.commands.lock();
        let owner = table.owners.get(&name)?;
        table.bindings.get(owner).map(|b| b.info().clone())
    }

    /// All claimed command names, sorted
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.lock().owners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Implementations registered for a multi-capability, in order
    pub fn multi_implementations(&self, capability: CapabilityId) -> Vec<ImplementationInfo> {
        self.multi
            .get(&capability)
            .map(|list| list.iter().map(|imp| imp.info().clone()).collect())
            .unwrap_or_default()
    }

    /// Freeze the catalog into `builder`
    ///
    /// One-shot: every later mutation, including a second seal, fails with
    /// [`RegistryError::AlreadyBuilt`]. The pending tables are cleared.
    pub fn seal(&self, builder: &mut dyn ContainerBuilder) -> Result<(), RegistryError> {
        let mut sealed = self.sealed.write();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt { operation: "seal" });
        }
        *sealed = true;

        let service_count = self.services.len();
        for entry in self.services.iter() {
            builder.add_service(*entry.key(), entry.value().clone());
        }
        self.services.clear();

        let multi_count = self.multi.len();
        for entry in self.multi.iter() {
            builder.add_multi(*entry.key(), entry.value().clone());
        }
        self.multi.clear();

        let table = std::mem::take(&mut *self.commands.lock());
        let command_count = table.bindings.len();
        for binding in table.bindings.into_values() {
            builder.add_command(binding);
        }

        self.validators.write().clear();

        info!(
            "Sealed registrations: {} services, {} multi-capabilities, {} commands",
            service_count, multi_count, command_count
        );
        Ok(())
    }

    /// Copy of the pending state, for test harnesses that fork a configuration
    pub fn snapshot(&self) -> CatalogSnapshot {
        let sealed = self.sealed.read();
        CatalogSnapshot {
            sealed: *sealed,
            services: self
                .services
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            multi: self
                .multi
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            commands: self.commands.lock().clone(),
            validators: self.validators.read().clone(),
            replace_permission: self.replace_permission.get().copied(),
        }
    }

    /// Rebuild a catalog from a snapshot
    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let replace_permission = OnceLock::new();
        if let Some(allow) = snapshot.replace_permission {
            let _ = replace_permission.set(allow);
        }

        Self {
            sealed: RwLock::new(snapshot.sealed),
            services: snapshot.services.into_iter().collect(),
            multi: snapshot.multi.into_iter().collect(),
            kinds: Mutex::new(()),
            commands: Mutex::new(snapshot.commands),
            validators: RwLock::new(snapshot.validators),
            replace_permission,
        }
    }

    /// Private copy of the pending state to register into
    ///
    /// Nothing done to the copy is visible here until it is passed to
    /// [`Catalog::commit`]; dropping it discards every registration.
    pub fn stage(&self) -> Catalog {
        Catalog::from_snapshot(self.snapshot())
    }

    /// Adopt the pending state of a catalog returned by [`Catalog::stage`]
    ///
    /// Stages are committed one at a time; a registration made here after
    /// `stage` and before `commit` is overwritten.
    pub fn commit(&self, staged: Catalog) -> Result<(), RegistryError> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt { operation: "commit" });
        }
        let CatalogSnapshot {
            services,
            multi,
            commands,
            ..
        } = staged.snapshot();

        let _kinds = self.kinds.lock();
        self.services.clear();
        for (capability, binding) in services {
            self.services.insert(capability, binding);
        }
        self.multi.clear();
        for (capability, implementations) in multi {
            self.multi.insert(capability, implementations);
        }
        *self.commands.lock() = commands;
        Ok(())
    }

    fn validate(&self, candidate: &ImplementationInfo) -> bool {
        let validators = self.validators.read();
        match validators.iter().find(|rule| !rule.allows(candidate)) {
            Some(rule) => {
                debug!(
                    "Validation rule '{}' rejected {} from {}",
                    rule.name(),
                    candidate.type_name,
                    candidate.origin
                );
                false
            }
            None => true,
        }
    }

    fn bind_single(
        &self,
        capability: CapabilityId,
        binding: ServiceBinding,
        operation: &'static str,
    ) -> Result<(), RegistryError> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt { operation });
        }
        if !self.validate(binding.info()) {
            return Ok(());
        }

        let _kinds = self.kinds.lock();
        if self.multi.contains_key(&capability) {
            return Err(RegistryError::MultiCapabilityMisuse(capability.name()));
        }

        match self.services.entry(capability) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().info();
                match arbitrate_service(existing, binding.info(), self.replace_permission()) {
                    Decision::Same => {}
                    Decision::Replace => debug!(
                        "{} ({}) replaces {} ({}) for {}",
                        binding.info().type_name,
                        binding.info().origin,
                        existing.type_name,
                        existing.origin,
                        capability
                    ),
                    Decision::Conflict => {
                        return Err(RegistryError::ServiceConflict {
                            capability: capability.name(),
                            existing: existing.type_name,
                            existing_origin: existing.origin.clone(),
                            candidate: binding.info().type_name,
                            candidate_origin: binding.info().origin.clone(),
                        });
                    }
                }
                entry.insert(binding);
            }
            Entry::Vacant(entry) => {
                debug!(
                    "Bound {} to {} as {}",
                    capability,
                    binding.info().type_name,
                    binding.lifetime()
                );
                entry.insert(binding);
            }
        }
        Ok(())
    }

    fn declare_multi(&self, capability: CapabilityId) -> Result<(), RegistryError> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt {
                operation: "declare_multi",
            });
        }

        let _kinds = self.kinds.lock();
        if self.services.contains_key(&capability) {
            return Err(RegistryError::MultiCapabilityMisuse(capability.name()));
        }

        self.multi.entry(capability).or_default();
        Ok(())
    }

    fn bind_multi(
        &self,
        capability: CapabilityId,
        implementation: Implementation,
    ) -> Result<(), RegistryError> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt {
                operation: "register_multi",
            });
        }
        if !self.validate(implementation.info()) {
            return Ok(());
        }

        let mut list = self
            .multi
            .get_mut(&capability)
            .ok_or(RegistryError::NotMultiCapability(capability.name()))?;
        debug!(
            "Added {} to {} (position {})",
            implementation.info().type_name,
            capability,
            list.len()
        );
        list.push(implementation);
        Ok(())
    }

    fn bind_command(&self, binding: CommandBinding) -> Result<(), RegistryError> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(RegistryError::AlreadyBuilt {
                operation: "register_command",
            });
        }
        if !self.validate(binding.info()) {
            return Ok(());
        }

        let permission = self.replace_permission();
        let mut table = self.commands.lock();

        // Decide every name before touching the table so a conflict on any
        // name leaves the table exactly as it was.
        let mut displaced: Vec<TypeId> = Vec::new();
        for name in binding.names() {
            let Some(owner) = table.owners.get(name) else {
                continue;
            };
            let Some(existing) = table.bindings.get(owner) else {
                continue;
            };
            match arbitrate_command(existing.info(), binding.info(), permission) {
                Decision::Same => {}
                Decision::Replace => {
                    if !displaced.contains(owner) {
                        displaced.push(*owner);
                    }
                }
                Decision::Conflict => {
                    return Err(RegistryError::CommandConflict {
                        name: name.clone(),
                        existing: existing.info().type_name,
                        existing_origin: existing.info().origin.clone(),
                        candidate: binding.info().type_name,
                        candidate_origin: binding.info().origin.clone(),
                    });
                }
            }
        }

        for owner in displaced {
            if let Some(old) = table.release(owner) {
                info!(
                    "Command '{}' from {} ({}) replaced by {} ({})",
                    old.primary_name(),
                    old.info().type_name,
                    old.info().origin,
                    binding.info().type_name,
                    binding.info().origin
                );
            }
        }

        // Re-registering a type replaces its whole alias set.
        let type_id = binding.info().type_id;
        table.release(type_id);
        for name in binding.names() {
            table.owners.insert(name.clone(), type_id);
        }
        debug!(
            "Registered command {:?} -> {} ({})",
            binding.names(),
            binding.info().type_name,
            binding.info().origin
        );
        table.bindings.insert(type_id, binding);
        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Value copy of a catalog's pending state
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    sealed: bool,
    services: Vec<(CapabilityId, ServiceBinding)>,
    multi: Vec<(CapabilityId, Vec<Implementation>)>,
    commands: CommandTable,
    validators: Vec<ValidationRule>,
    replace_permission: Option<bool>,
}

/// Registration handle for one origin
///
/// Core code and extensions register through the same handle type; the
/// origin it carries is what the conflict rules look at.
#[derive(Clone)]
pub struct Registrar<'a> {
    catalog: &'a Catalog,
    origin: Origin,
}

impl Registrar<'_> {
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Bind `C` to a single shared instance of `T`
    ///
    /// `cast` coerces the concrete type to the capability, usually `|it| it`.
    pub fn register_singleton<C, T>(&self, cast: fn(Arc<T>) -> Arc<C>) -> Result<(), RegistryError>
    where
        C: ?Sized + Send + Sync + 'static,
        T: Component,
    {
        let implementation = Implementation::for_type::<C, T>(self.origin.clone(), cast);
        self.catalog.bind_single(
            CapabilityId::of::<C>(),
            ServiceBinding::Singleton(implementation),
            "register_singleton",
        )
    }

    /// Bind `C` to a fresh instance of `T` per resolve
    pub fn register_transient<C, T>(&self, cast: fn(Arc<T>) -> Arc<C>) -> Result<(), RegistryError>
    where
        C: ?Sized + Send + Sync + 'static,
        T: Component,
    {
        let implementation = Implementation::for_type::<C, T>(self.origin.clone(), cast);
        self.catalog.bind_single(
            CapabilityId::of::<C>(),
            ServiceBinding::Transient(implementation),
            "register_transient",
        )
    }

    /// Bind `C` to a factory, invoked once on first resolve
    pub fn register_factory<C, F>(&self, factory: F) -> Result<(), RegistryError>
    where
        C: ?Sized + Send + Sync + 'static,
        F: Fn(&super::Resolver<'_>) -> anyhow::Result<Arc<C>> + Send + Sync + 'static,
    {
        let implementation = Implementation::for_factory::<C, F>(self.origin.clone(), factory);
        self.catalog.bind_single(
            CapabilityId::of::<C>(),
            ServiceBinding::Factory(implementation),
            "register_factory",
        )
    }

    /// Declare `C` as accepting many implementations
    pub fn declare_multi<C>(&self) -> Result<(), RegistryError>
    where
        C: ?Sized + 'static,
    {
        self.catalog.declare_multi(CapabilityId::of::<C>())
    }

    /// Append `T` to the implementations of the multi-capability `C`
    pub fn register_multi<C, T>(&self, cast: fn(Arc<T>) -> Arc<C>) -> Result<(), RegistryError>
    where
        C: ?Sized + Send + Sync + 'static,
        T: Component,
    {
        let implementation = Implementation::for_type::<C, T>(self.origin.clone(), cast);
        self.catalog.bind_multi(CapabilityId::of::<C>(), implementation)
    }

    /// Claim every name `T` declares
    pub fn register_command<T>(&self) -> Result<(), RegistryError>
    where
        T: Command + Component,
    {
        if self.catalog.is_sealed() {
            return Err(RegistryError::AlreadyBuilt {
                operation: "register_command",
            });
        }
        let binding = CommandBinding::for_type::<T>(self.origin.clone())?;
        self.catalog.bind_command(binding)
    }
}
