//! Service and plugin registry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::container::Container;
use crate::definition::{Declaration, DefinitionBuilder, ServiceDefinition};
use crate::error::ServiceResult;
use crate::traits::Plugin;

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// A plugin instantiated for one container.
#[derive(Clone)]
pub(crate) struct PluginSlot {
    pub(crate) type_id: TypeId,
    pub(crate) name: &'static str,
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

type FactoryFn = dyn Fn(&Container) -> PluginSlot + Send + Sync;

/// A registered plugin factory.
#[derive(Clone)]
pub(crate) struct PluginFactory {
    pub(crate) type_id: TypeId,
    pub(crate) name: &'static str,
    factory: Arc<FactoryFn>,
}

impl PluginFactory {
    pub(crate) fn new<P, F>(factory: F) -> Self
    where
        P: Plugin,
        F: Fn(&Container) -> P + Send + Sync + 'static,
    {
        let name = std::any::type_name::<P>();
        Self {
            type_id: TypeId::of::<P>(),
            name,
            factory: Arc::new(move |container| {
                let plugin = Arc::new(factory(container));
                PluginSlot {
                    type_id: TypeId::of::<P>(),
                    name: plugin.name(),
                    plugin: plugin.clone(),
                    any: plugin,
                }
            }),
        }
    }

    pub(crate) fn instantiate(&self, container: &Container) -> PluginSlot {
        (self.factory)(container)
    }
}

#[derive(Default)]
struct RegistryInner {
    definitions: Vec<ServiceDefinition>,
    by_name: HashMap<String, ServiceDefinition>,
    plugins: Vec<PluginFactory>,
    sequence: u64,
}

impl RegistryInner {
    fn has_plugin(&self, type_id: TypeId) -> bool {
        self.plugins.iter().any(|factory| factory.type_id == type_id)
    }
}

/// Service definitions and plugin factories shared by containers.
///
/// Containers read the registry; they never mutate it. Tests normally build
/// their own `Registry`, while applications may use [`Registry::global`] at
/// their outermost composition point.
///
/// # Examples
///
/// ```
/// use ferrous_services::{Declaration, Registry};
/// use ferrous_services::descriptors::value;
///
/// let registry = Registry::new();
/// let first = registry.declare(Declaration::new("theme"), |d| {
///     d.field("dark", value(false));
/// }).unwrap();
///
/// // A second declaration with the same identifier returns the original.
/// let again = registry.declare(Declaration::new("theme"), |d| {
///     d.field("dark", value(true));
/// }).unwrap();
/// assert_eq!(first, again);
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Declares a service.
    ///
    /// `build` receives a [`DefinitionBuilder`] and adds fields through
    /// descriptors. Declaring an identifier that already exists logs an error
    /// and returns the existing definition without running `build`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::ReservedField`](crate::ServiceError::ReservedField) if
    /// the blueprint uses a reserved name.
    pub fn declare<F>(&self, declaration: Declaration, build: F) -> ServiceResult<ServiceDefinition>
    where
        F: FnOnce(&mut DefinitionBuilder),
    {
        if let Some(existing) = self.definition(declaration.identifier()) {
            error!(
                service = declaration.identifier(),
                "Service already declared; returning the existing definition"
            );
            return Ok(existing);
        }

        // Descriptors run user code, so no lock is held while building.
        let mut builder = DefinitionBuilder::new(declaration.identifier());
        build(&mut builder);

        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_name.get(declaration.identifier()) {
            error!(
                service = declaration.identifier(),
                "Service declared concurrently; returning the existing definition"
            );
            return Ok(existing.clone());
        }

        let definition = builder.build(declaration, inner.sequence)?;
        inner.sequence += 1;
        inner
            .by_name
            .insert(definition.identifier().to_string(), definition.clone());
        inner.definitions.push(definition.clone());
        debug!(service = definition.identifier(), order = definition.order(), "Service declared");
        Ok(definition)
    }

    /// Looks up a definition by identifier.
    pub fn definition(&self, identifier: &str) -> Option<ServiceDefinition> {
        self.inner.read().by_name.get(identifier).cloned()
    }

    /// All definitions in declaration order.
    pub fn definitions(&self) -> Vec<ServiceDefinition> {
        self.inner.read().definitions.clone()
    }

    /// Number of declared services.
    pub fn len(&self) -> usize {
        self.inner.read().definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a plugin factory.
    ///
    /// Containers created afterwards instantiate the plugin once, in
    /// registration order. Registering the same plugin type again is a no-op
    /// and returns `false`.
    pub fn register<P, F>(&self, factory: F) -> bool
    where
        P: Plugin,
        F: Fn(&Container) -> P + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        if inner.has_plugin(TypeId::of::<P>()) {
            debug!(plugin = std::any::type_name::<P>(), "Plugin already registered");
            return false;
        }
        inner.plugins.push(PluginFactory::new(factory));
        debug!(plugin = std::any::type_name::<P>(), "Plugin registered");
        true
    }

    /// True if a plugin of type `P` is registered.
    pub fn has_plugin<P: Plugin>(&self) -> bool {
        self.inner.read().has_plugin(TypeId::of::<P>())
    }

    pub(crate) fn plugin_factories(&self) -> Vec<PluginFactory> {
        self.inner.read().plugins.clone()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("definitions", &inner.definitions.len())
            .field("plugins", &inner.plugins.iter().map(|p| p.name).collect::<Vec<_>>())
            .finish()
    }
}
