//! Service container: resolution, plugin lifecycle and batch invocation.
//!
//! This module contains the [`Container`] type, which turns service
//! definitions into singleton instances and runs every plugin's lifecycle
//! hooks against them.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{join_all, FutureExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::{PluginConfig, CONFIG_PROPERTY};
use crate::definition::ServiceDefinition;
use crate::error::{ServiceError, ServiceResult};
use crate::event_bus::{Dispatch, Subscription, UnaryEventBus};
use crate::internal::spawn;
use crate::method::{Args, Value};
use crate::notification::Notification;
use crate::registry::{PluginFactory, PluginSlot, Registry};
use crate::traits::{HookFuture, Plugin};

mod instance;
pub use instance::{ServiceInstance, WeakInstance};

type InstanceKey = (ServiceDefinition, Option<String>);

/// Service container for resolving singleton service instances.
///
/// The `Container` is the heart of the runtime. It creates exactly one
/// instance per (definition, scope) pair, runs plugin `on_create` hooks in
/// registration order on every new instance and `on_destroy` hooks in
/// reverse order when an instance is destroyed.
///
/// Besides resolution it offers batch invocation across all live instances,
/// a property store plugins use to share configuration, a notification
/// channel and a global halt flag.
///
/// # Thread Safety
///
/// `Container` is a cheap handle around shared state and can be cloned
/// freely. Internal locks are never held while plugin or service code runs.
///
/// # Examples
///
/// ```
/// use ferrous_services::{Container, Declaration, Registry};
/// use ferrous_services::descriptors::value;
/// use serde_json::json;
///
/// let registry = Registry::new();
/// let settings = registry.declare(Declaration::new("settings"), |d| {
///     d.field("volume", value(7));
/// }).unwrap();
///
/// let container = Container::new(registry);
/// let a = container.get_by_class(&settings, None);
/// let b = container.get_by_name("settings", None).unwrap();
/// assert!(a.ptr_eq(&b));
///
/// // Scopes produce independent instances of the same definition.
/// let tab = container.get_by_class(&settings, Some("tab-2"));
/// tab.set("volume", 3).unwrap();
/// assert_eq!(a.get("volume"), Some(json!(7)));
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

/// Non-owning handle to a [`Container`].
#[derive(Clone, Default)]
pub struct WeakContainer {
    inner: Weak<ContainerInner>,
}

impl WeakContainer {
    /// The container, if it is still alive.
    pub fn upgrade(&self) -> Option<Container> {
        self.inner.upgrade().map(|inner| Container { inner })
    }
}

pub(crate) struct ContainerInner {
    registry: Registry,
    plugins: RwLock<Vec<PluginSlot>>,
    instances: Mutex<HashMap<InstanceKey, ServiceInstance>>,
    properties: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    channel: UnaryEventBus<Notification>,
    halted: AtomicBool,
}

impl Container {
    /// Creates a container reading from `registry`.
    ///
    /// Every plugin factory registered so far is instantiated once, in
    /// registration order.
    pub fn new(registry: Registry) -> Self {
        let factories = registry.plugin_factories();
        let container = Container {
            inner: Arc::new(ContainerInner {
                registry,
                plugins: RwLock::new(Vec::with_capacity(factories.len())),
                instances: Mutex::new(HashMap::new()),
                properties: RwLock::new(HashMap::new()),
                channel: UnaryEventBus::new(),
                halted: AtomicBool::new(false),
            }),
        };

        for factory in factories {
            let slot = factory.instantiate(&container);
            debug!(plugin = slot.name, "Plugin instantiated");
            container.inner.plugins.write().push(slot);
        }
        container
    }

    /// Creates a container reading from [`Registry::global`].
    pub fn with_global_registry() -> Self {
        Self::new(Registry::global().clone())
    }

    /// The registry this container reads from.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Non-owning handle, for plugins that need to reach their container.
    pub fn downgrade(&self) -> WeakContainer {
        WeakContainer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// True if both handles refer to the same container.
    pub fn ptr_eq(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn plugins_snapshot(&self) -> Vec<PluginSlot> {
        self.inner.plugins.read().clone()
    }

    // ----- Resolution -----

    /// Returns the instance for `definition` (and `scope`), creating it if needed.
    ///
    /// On creation every plugin's `on_create` runs synchronously in
    /// registration order. Asynchronous hook work is spawned on the current
    /// tokio runtime and not awaited, so it may still be running when the
    /// instance is first used; use [`Container::resolve_by_class`] or
    /// [`ServiceInstance::ready`] when a plugin's setup must complete first.
    pub fn get_by_class(&self, definition: &ServiceDefinition, scope: Option<&str>) -> ServiceInstance {
        let (instance, setup) = self.get_or_create(definition, scope);
        if let Some(setup) = setup {
            if let Err(err) = spawn(definition.identifier(), setup) {
                warn!(service = definition.identifier(), error = %err, "Skipping asynchronous on_create work");
            }
        }
        instance
    }

    /// Like [`Container::get_by_class`] but awaits every plugin's async `on_create` work.
    ///
    /// Hooks are awaited in registration order. Callers that find the
    /// instance already created wait for the same setup. There is no
    /// timeout: a hook that never completes stalls this call.
    ///
    /// # Errors
    ///
    /// The first error returned by a hook. The instance stays registered.
    pub async fn resolve_by_class(
        &self,
        definition: &ServiceDefinition,
        scope: Option<&str>,
    ) -> ServiceResult<ServiceInstance> {
        let (instance, setup) = self.get_or_create(definition, scope);
        match setup {
            Some(setup) => setup.await?,
            None => instance.ready().await?,
        }
        Ok(instance)
    }

    /// Returns the live instance named `identifier`, resolving it through the
    /// registry if it was never instantiated.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotRegistered`] if no definition has this identifier.
    pub fn get_by_name(&self, identifier: &str, scope: Option<&str>) -> ServiceResult<ServiceInstance> {
        let live = self
            .inner
            .instances
            .lock()
            .iter()
            .find(|((definition, s), _)| definition.identifier() == identifier && s.as_deref() == scope)
            .map(|(_, instance)| instance.clone());
        if let Some(instance) = live {
            return Ok(instance);
        }

        match self.inner.registry.definition(identifier) {
            Some(definition) => Ok(self.get_by_class(&definition, scope)),
            None => Err(ServiceError::NotRegistered(identifier.to_string())),
        }
    }

    // The second element drives the plugins' async `on_create` work; it is
    // only returned to the caller that created the instance.
    fn get_or_create(
        &self,
        definition: &ServiceDefinition,
        scope: Option<&str>,
    ) -> (ServiceInstance, Option<HookFuture>) {
        let key: InstanceKey = (definition.clone(), scope.map(str::to_string));
        let (done, setup) = oneshot::channel();
        let instance = {
            let mut instances = self.inner.instances.lock();
            if let Some(existing) = instances.get(&key) {
                return (existing.clone(), None);
            }
            let setup = async move { setup.await.unwrap_or(Ok(())) }.boxed().shared();
            let instance = ServiceInstance::new(definition.clone(), key.1.clone(), self.downgrade(), setup);
            instances.insert(key, instance.clone());
            instance
        };
        debug!(service = definition.identifier(), scope = ?scope, id = instance.id(), "Service instance created");

        let hooks: Vec<(&'static str, HookFuture)> = self
            .plugins_snapshot()
            .iter()
            .filter_map(|slot| {
                slot.plugin
                    .on_create(definition, &instance)
                    .map(|hook| (slot.name, hook))
            })
            .collect();
        if hooks.is_empty() {
            let _ = done.send(Ok(()));
            return (instance, None);
        }

        let service = definition.identifier().to_string();
        let setup = async move {
            let mut result = Ok(());
            for (plugin, hook) in hooks {
                if let Err(err) = hook.await {
                    error!(service = %service, plugin, error = %err, "Plugin on_create failed");
                    result = Err(err);
                    break;
                }
            }
            let _ = done.send(result.clone());
            result
        };
        (instance, Some(setup.boxed()))
    }

    /// Live instances in creation order.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        let mut instances: Vec<ServiceInstance> = self.inner.instances.lock().values().cloned().collect();
        instances.sort_by_key(ServiceInstance::id);
        instances
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.inner.instances.lock().len()
    }

    // ----- Batch invocation -----

    /// Calls `method` on every live instance that defines it, concurrently.
    ///
    /// Every call is started before any is awaited, and all calls are allowed
    /// to settle; a failure does not cancel the others.
    ///
    /// # Errors
    ///
    /// The first error in instance creation order, once all calls settled.
    pub async fn invoke_parallel(&self, method: &str, args: Args) -> ServiceResult<Vec<Value>> {
        let calls: Vec<_> = self
            .instances()
            .into_iter()
            .filter(|instance| instance.has_method(method))
            .map(|instance| instance.call(method, args.clone()))
            .collect();
        debug!(method, targets = calls.len(), "Invoking in parallel");
        join_all(calls).await.into_iter().collect()
    }

    /// Calls `method` on every live instance that defines it, one at a time.
    ///
    /// Instances are ordered by their definition's declared order (ascending),
    /// ties keeping declaration order. Each call is awaited before the next
    /// starts, which suits phased startup and shutdown.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error.
    pub async fn invoke_linear(&self, method: &str, args: Args) -> ServiceResult<Vec<Value>> {
        let mut targets: Vec<ServiceInstance> = self
            .instances()
            .into_iter()
            .filter(|instance| instance.has_method(method))
            .collect();
        targets.sort_by_key(|instance| {
            let definition = instance.definition();
            (definition.order(), definition.sequence(), instance.id())
        });

        let mut results = Vec::with_capacity(targets.len());
        for instance in targets {
            debug!(method, service = instance.definition().identifier(), "Invoking linearly");
            results.push(instance.call(method, args.clone()).await?);
        }
        Ok(results)
    }

    // ----- Reset / destroy -----

    /// Resets every instance matching `filter` to its blueprint defaults.
    pub fn reset_where<F>(&self, filter: F)
    where
        F: Fn(&ServiceDefinition, &ServiceInstance) -> bool,
    {
        for instance in self.instances() {
            if filter(instance.definition(), &instance) {
                instance.reset();
            }
        }
    }

    /// Resets every live instance.
    pub fn reset_all(&self) {
        self.reset_where(|_, _| true);
    }

    /// Destroys every instance matching `filter`.
    pub fn destroy_where<F>(&self, filter: F)
    where
        F: Fn(&ServiceDefinition, &ServiceInstance) -> bool,
    {
        for instance in self.instances() {
            if filter(instance.definition(), &instance) {
                instance.destroy();
            }
        }
    }

    /// Destroys every live instance.
    pub fn destroy_all(&self) {
        self.destroy_where(|_, _| true);
    }

    // Called by `ServiceInstance::destroy`.
    pub(crate) fn teardown(&self, instance: &ServiceInstance) {
        let definition = instance.definition();
        for slot in self.plugins_snapshot().iter().rev() {
            slot.plugin.on_destroy(definition, instance);
        }

        let key: InstanceKey = (definition.clone(), instance.scope().map(str::to_string));
        let mut instances = self.inner.instances.lock();
        if instances.get(&key).is_some_and(|current| current.ptr_eq(instance)) {
            instances.remove(&key);
        }
        debug!(service = definition.identifier(), id = instance.id(), "Service instance destroyed");
    }

    // ----- Plugins -----

    /// Registers a plugin with this container only.
    ///
    /// The plugin's `on_create` runs immediately against every live instance,
    /// so plugins can be attached to a running container. Returns `false`
    /// (and does nothing) if a plugin of type `P` is already present.
    pub fn register_plugin<P, F>(&self, factory: F) -> bool
    where
        P: Plugin,
        F: Fn(&Container) -> P + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<P>();
        if self.has_plugin_type(type_id) {
            return false;
        }

        let slot = PluginFactory::new(factory).instantiate(self);
        {
            let mut plugins = self.inner.plugins.write();
            if plugins.iter().any(|existing| existing.type_id == type_id) {
                return false;
            }
            plugins.push(slot.clone());
        }
        debug!(plugin = slot.name, "Plugin registered dynamically");

        for instance in self.instances() {
            if let Some(hook) = slot.plugin.on_create(instance.definition(), &instance) {
                spawn_hook(instance.definition().identifier(), slot.name, hook);
            }
        }
        true
    }

    fn has_plugin_type(&self, type_id: TypeId) -> bool {
        self.inner.plugins.read().iter().any(|slot| slot.type_id == type_id)
    }

    /// Returns this container's instance of plugin `P`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::PluginNotRegistered`] if `P` is not registered.
    pub fn plugin<P: Plugin>(&self) -> ServiceResult<Arc<P>> {
        self.inner
            .plugins
            .read()
            .iter()
            .find(|slot| slot.type_id == TypeId::of::<P>())
            .and_then(|slot| slot.any.clone().downcast::<P>().ok())
            .ok_or(ServiceError::PluginNotRegistered(std::any::type_name::<P>()))
    }

    /// Names of the plugins in registration order.
    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.inner.plugins.read().iter().map(|slot| slot.name).collect()
    }

    // ----- Properties -----

    /// Stores a container-scoped value plugins can share.
    pub fn set_property<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.properties.write().insert(key.into(), Arc::new(value));
    }

    /// Reads a container-scoped value; `None` if absent or of another type.
    pub fn get_property<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.properties.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes a property, returning whether it existed.
    pub fn remove_property(&self, key: &str) -> bool {
        self.inner.properties.write().remove(key).is_some()
    }

    /// Installs plugin defaults used by descriptors declared without explicit options.
    pub fn set_config(&self, config: PluginConfig) {
        self.set_property(CONFIG_PROPERTY, config);
    }

    /// The installed plugin configuration, or the defaults.
    pub fn config(&self) -> Arc<PluginConfig> {
        self.get_property::<PluginConfig>(CONFIG_PROPERTY)
            .unwrap_or_default()
    }

    // ----- Notifications -----

    /// Sends a notification to every container listener.
    pub fn dispatch(&self, notification: &Notification) -> Dispatch {
        self.inner.channel.dispatch(notification)
    }

    /// Listens to the container channel.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.channel.subscribe(listener)
    }

    /// Listens to the container channel with an asynchronous listener.
    pub fn subscribe_async<F, Fut>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notification) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.channel.subscribe_async(listener)
    }

    // ----- Halt -----

    /// Suppresses (or re-enables) reactive side effects across the container.
    ///
    /// While halted, signal writes still update their values but emit no
    /// notifications, and plugins that consult the flag skip their side effects.
    pub fn halt(&self, halted: bool) {
        self.inner.halted.store(halted, Ordering::SeqCst);
        debug!(halted, "Container halt flag changed");
    }

    /// True while the container is halted.
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    #[cfg(feature = "diagnostics")]
    pub fn to_debug_string(&self) -> String {
        let mut s = String::new();
        s.push_str("=== Container Debug ===\n");
        s.push_str("Plugins:\n");
        for name in self.plugin_names() {
            s.push_str(&format!("  {}\n", name));
        }
        s.push_str("Instances:\n");
        for instance in self.instances() {
            s.push_str(&format!(
                "  #{} {} (scope: {:?}, order: {})\n",
                instance.id(),
                instance.definition().identifier(),
                instance.scope(),
                instance.definition().order()
            ));
        }
        s
    }
}

fn spawn_hook(service: &str, plugin: &'static str, hook: HookFuture) {
    let owner = service.to_string();
    let task = async move {
        if let Err(err) = hook.await {
            error!(service = %owner, plugin, error = %err, "Plugin on_create failed");
        }
    };
    if let Err(err) = spawn(plugin, task) {
        warn!(service, plugin, error = %err, "Skipping asynchronous on_create work");
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("plugins", &self.plugin_names())
            .field("instances", &self.instance_count())
            .field("halted", &self.is_halted())
            .finish()
    }
}

// Runs once the last `Container` handle is gone. Instances still held by
// callers are destroyed so no plugin keeps work scheduled for them.
impl Drop for ContainerInner {
    fn drop(&mut self) {
        let mut instances: Vec<ServiceInstance> = self.instances.get_mut().drain().map(|(_, instance)| instance).collect();
        if instances.is_empty() {
            return;
        }
        instances.sort_by_key(ServiceInstance::id);

        let plugins = self.plugins.get_mut();
        for instance in &instances {
            if !instance.mark_destroyed() {
                continue;
            }
            for slot in plugins.iter().rev() {
                slot.plugin.on_destroy(instance.definition(), instance);
            }
        }
        debug!(instances = instances.len(), "Container dropped; live instances destroyed");
    }
}
