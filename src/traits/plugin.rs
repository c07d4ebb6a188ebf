//! Plugin lifecycle contract.

use futures::future::BoxFuture;

use crate::container::ServiceInstance;
use crate::definition::ServiceDefinition;
use crate::error::ServiceResult;

/// Asynchronous remainder of an `on_create` hook.
pub type HookFuture = BoxFuture<'static, ServiceResult<()>>;

/// Cross-cutting lifecycle hooks attached to every service instance.
///
/// A plugin is created once per container by the factory registered with
/// [`Registry::register`](crate::Registry::register) or
/// [`Container::register_plugin`](crate::Container::register_plugin). The
/// container calls `on_create` for every new instance in plugin registration
/// order and `on_destroy` in reverse registration order, so a plugin may rely
/// on everything registered before it having instrumented the instance.
///
/// `on_create` runs its synchronous part immediately; any work that must
/// await is returned as a [`HookFuture`]. [`Container::get_by_class`](crate::Container::get_by_class)
/// spawns those futures without waiting, while
/// [`Container::resolve_by_class`](crate::Container::resolve_by_class) awaits them.
///
/// `on_destroy` is synchronous: it must cancel every pending timer or
/// scheduled call it owns for the instance before returning.
///
/// # Examples
///
/// ```
/// use ferrous_services::{Container, Plugin, Registry, ServiceDefinition, ServiceInstance, HookFuture};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CountingPlugin {
///     live: AtomicUsize,
/// }
///
/// impl Plugin for CountingPlugin {
///     fn on_create(&self, _def: &ServiceDefinition, _instance: &ServiceInstance) -> Option<HookFuture> {
///         self.live.fetch_add(1, Ordering::SeqCst);
///         None
///     }
///
///     fn on_destroy(&self, _def: &ServiceDefinition, _instance: &ServiceInstance) {
///         self.live.fetch_sub(1, Ordering::SeqCst);
///     }
/// }
///
/// let registry = Registry::new();
/// registry.register(|_| CountingPlugin::default());
/// let container = Container::new(registry);
/// assert!(container.plugin::<CountingPlugin>().is_ok());
/// ```
pub trait Plugin: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Called when an instance is created.
    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        let _ = (definition, instance);
        None
    }

    /// Called when an instance is destroyed.
    fn on_destroy(&self, definition: &ServiceDefinition, instance: &ServiceInstance) {
        let _ = (definition, instance);
    }
}
