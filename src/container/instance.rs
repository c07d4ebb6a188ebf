//! Live service instances.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{Container, WeakContainer};
use crate::definition::{Field, ServiceDefinition};
use crate::error::{ServiceError, ServiceResult};
use crate::event_bus::{Dispatch, EventBus, Subscription, UnaryEventBus};
use crate::method::{Args, Method, MethodFuture, Value};
use crate::notification::{Notification, PropertyChange};
use crate::signal::{Signal, Vault};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Completion of every plugin's asynchronous `on_create` work.
pub(crate) type Setup = Shared<BoxFuture<'static, ServiceResult<()>>>;

enum Slot {
    Plain(Value),
    Signal(Signal),
}

pub(crate) struct InstanceInner {
    id: u64,
    definition: ServiceDefinition,
    scope: Option<String>,
    container: WeakContainer,
    slots: RwLock<HashMap<String, Slot>>,
    methods: RwLock<HashMap<String, Method>>,
    vault: OnceCell<Arc<Vault>>,
    channel: UnaryEventBus<Notification>,
    watchers: EventBus<String, PropertyChange>,
    setup: Setup,
    destroyed: AtomicBool,
}

/// A live singleton created from a [`ServiceDefinition`] inside one container.
///
/// The handle is cheap to clone. Field reads and writes go through
/// [`get`](ServiceInstance::get) / [`set`](ServiceInstance::set); fields
/// intercepted by the signal plugin are backed by the instance's vault and
/// notify listeners on every write. Methods are invoked with
/// [`call`](ServiceInstance::call).
#[derive(Clone)]
pub struct ServiceInstance {
    inner: Arc<InstanceInner>,
}

/// Non-owning handle to a [`ServiceInstance`].
///
/// Scheduled plugin work holds this so a destroyed or dropped instance is
/// never kept alive by a pending timer.
#[derive(Clone)]
pub struct WeakInstance {
    inner: Weak<InstanceInner>,
}

impl WeakInstance {
    /// The instance, if it is still alive and not destroyed.
    pub fn upgrade(&self) -> Option<ServiceInstance> {
        self.inner
            .upgrade()
            .map(|inner| ServiceInstance { inner })
            .filter(|instance| !instance.is_destroyed())
    }
}

impl ServiceInstance {
    pub(crate) fn new(
        definition: ServiceDefinition,
        scope: Option<String>,
        container: WeakContainer,
        setup: Setup,
    ) -> Self {
        let mut slots = HashMap::new();
        let mut methods = HashMap::new();
        for (name, field) in definition.fields() {
            match field {
                Field::Value(default) => {
                    slots.insert(name.to_string(), Slot::Plain(default.clone()));
                }
                Field::Method(method) => {
                    methods.insert(name.to_string(), method.clone());
                }
            }
        }

        Self {
            inner: Arc::new(InstanceInner {
                id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                definition,
                scope,
                container,
                slots: RwLock::new(slots),
                methods: RwLock::new(methods),
                vault: OnceCell::new(),
                channel: UnaryEventBus::new(),
                watchers: EventBus::new(),
                setup,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique id; also reflects creation order.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The definition this instance was created from.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.inner.definition
    }

    /// The scope string, if the instance is scoped.
    pub fn scope(&self) -> Option<&str> {
        self.inner.scope.as_deref()
    }

    /// The owning container, if it is still alive.
    pub fn container(&self) -> Option<Container> {
        self.inner.container.upgrade()
    }

    /// Non-owning handle to this instance.
    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Waits until every plugin's asynchronous `on_create` work has finished.
    ///
    /// Resolves to the first hook error. Setup that was never driven (no
    /// runtime, or the creating future was dropped) counts as finished.
    pub async fn ready(&self) -> ServiceResult<()> {
        self.inner.setup.clone().await
    }

    /// True if both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &ServiceInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ----- Fields -----

    /// Current value of a data field.
    pub fn get(&self, name: &str) -> Option<Value> {
        let signal = match self.inner.slots.read().get(name)? {
            Slot::Plain(value) => return Some(value.clone()),
            Slot::Signal(signal) => signal.clone(),
        };
        Some(signal.get())
    }

    /// Current value of a data field, deserialized into `T`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::FieldNotFound`] for unknown fields,
    /// [`ServiceError::Serialization`] if the value does not fit `T`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> ServiceResult<T> {
        let value = self.get(name).ok_or_else(|| self.field_not_found(name))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Writes a data field. Signal fields notify their listeners.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotAValue`] when `name` is a method,
    /// [`ServiceError::FieldNotFound`] when it is not part of the blueprint.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> ServiceResult<()> {
        let value = value.into();
        let signal = {
            let mut slots = self.inner.slots.write();
            match slots.get_mut(name) {
                Some(Slot::Plain(current)) => {
                    *current = value;
                    return Ok(());
                }
                Some(Slot::Signal(signal)) => Some(signal.clone()),
                None => None,
            }
        };
        let Some(signal) = signal else {
            return Err(if self.has_method(name) {
                ServiceError::NotAValue {
                    service: self.inner.definition.identifier().to_string(),
                    field: name.to_string(),
                }
            } else {
                self.field_not_found(name)
            });
        };
        // Emits outside the slot lock so listeners may read the instance.
        signal.set(value);
        Ok(())
    }

    /// Names of the data fields in blueprint order.
    pub fn field_names(&self) -> Vec<String> {
        self.inner
            .definition
            .fields()
            .filter(|(_, field)| matches!(field, Field::Value(_)))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// The signal cell behind `name`, if the field is intercepted.
    pub fn signal(&self, name: &str) -> Option<Signal> {
        match self.inner.slots.read().get(name)? {
            Slot::Signal(signal) => Some(signal.clone()),
            Slot::Plain(_) => None,
        }
    }

    /// Replaces a plain field with a vault-backed signal cell.
    ///
    /// The vault is seeded with the field's current value. Installing twice
    /// returns the existing cell; unknown fields return `None`.
    pub fn install_signal(&self, name: &str) -> Option<Signal> {
        let mut slots = self.inner.slots.write();
        let slot = slots.get_mut(name)?;
        let current = match slot {
            Slot::Signal(signal) => return Some(signal.clone()),
            Slot::Plain(value) => std::mem::take(value),
        };

        let vault = self.vault();
        vault.insert(name, current);
        let signal = Signal::new(name, vault, self.downgrade());
        *slot = Slot::Signal(signal.clone());
        Some(signal)
    }

    /// The instance vault, attached on first use.
    pub fn vault(&self) -> Arc<Vault> {
        self.inner.vault.get_or_init(|| Arc::new(Vault::default())).clone()
    }

    /// True once a signal has been installed on this instance.
    pub fn has_vault(&self) -> bool {
        self.inner.vault.get().is_some()
    }

    fn field_not_found(&self, name: &str) -> ServiceError {
        ServiceError::FieldNotFound {
            service: self.inner.definition.identifier().to_string(),
            field: name.to_string(),
        }
    }

    // ----- Methods -----

    /// True if the instance has a method called `name`.
    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.read().contains_key(name)
    }

    /// The current (possibly wrapped) method called `name`.
    pub fn method(&self, name: &str) -> Option<Method> {
        self.inner.methods.read().get(name).cloned()
    }

    /// Invokes method `name` with `args`.
    ///
    /// Unknown methods resolve to [`ServiceError::MethodNotFound`].
    pub fn call(&self, name: &str, args: Args) -> MethodFuture {
        match self.method(name) {
            Some(method) => method.call(self.clone(), args),
            None => future::ready(Err(ServiceError::MethodNotFound {
                service: self.inner.definition.identifier().to_string(),
                method: name.to_string(),
            }))
            .boxed(),
        }
    }

    /// Replaces method `name` with `wrap(current)`. Returns `false` if absent.
    pub fn wrap_method<F>(&self, name: &str, wrap: F) -> bool
    where
        F: FnOnce(Method) -> Method,
    {
        let Some(current) = self.method(name) else {
            return false;
        };
        let wrapped = wrap(current);
        self.inner.methods.write().insert(name.to_string(), wrapped);
        true
    }

    // ----- Notifications -----

    /// Sends a notification to this instance's listeners.
    pub fn dispatch(&self, notification: &Notification) -> Dispatch {
        self.inner.channel.dispatch(notification)
    }

    /// Listens to this instance's channel.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.channel.subscribe(listener)
    }

    /// Listens to this instance's channel with an asynchronous listener.
    pub fn subscribe_async<F, Fut>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notification) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.channel.subscribe_async(listener)
    }

    /// Listens to changes of one signal field.
    pub fn watch<F>(&self, field: &str, listener: F) -> Subscription
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.inner.watchers.subscribe(field.to_string(), listener)
    }

    // Called by `Signal::set` after the vault was written.
    pub(crate) fn notify_change(&self, property: &str, value: Value, previous: Value) {
        let container = self.container();
        if container.as_ref().is_some_and(Container::is_halted) {
            debug!(service = self.inner.definition.identifier(), property, "Halted; change not emitted");
            return;
        }

        let is_similar = value == previous;
        let change = PropertyChange {
            property: property.to_string(),
            value,
            previous,
            target: self.inner.definition.clone(),
            instance: self.clone(),
            is_similar,
        };
        self.inner.watchers.dispatch(&change.property, &change).detach();

        let notification = Notification::PropertyChanged(change);
        self.inner.channel.dispatch(&notification).detach();
        if let Some(container) = container {
            container.dispatch(&notification).detach();
        }
    }

    // ----- Lifecycle -----

    /// Restores every data field to a fresh copy of its blueprint default.
    ///
    /// Signal fields are written through their cells and notify as usual.
    /// Methods, including plugin wrappers, are left untouched.
    pub fn reset(&self) {
        for (name, field) in self.inner.definition.fields() {
            if let Field::Value(default) = field {
                let _ = self.set(name, default.clone());
            }
        }
    }

    /// Runs every plugin's `on_destroy` (reverse registration order) and
    /// removes the instance from its container. Idempotent.
    pub fn destroy(&self) {
        if !self.mark_destroyed() {
            return;
        }
        match self.container() {
            Some(container) => container.teardown(self),
            None => debug!(
                service = self.inner.definition.identifier(),
                "Instance destroyed after its container was dropped"
            ),
        }
    }

    // True only for the first caller.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.inner.destroyed.swap(true, Ordering::SeqCst)
    }

    /// True once [`destroy`](ServiceInstance::destroy) ran.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("id", &self.inner.id)
            .field("service", &self.inner.definition.identifier())
            .field("scope", &self.inner.scope)
            .finish()
    }
}
