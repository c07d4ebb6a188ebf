//! Observable signal fields.
//!
//! Declaring a field with [`signal`] records it for the [`SignalPlugin`].
//! When an instance is created the plugin moves the field's value into the
//! instance [`Vault`] and replaces the field with a [`Signal`] cell. From then
//! on every write goes through the cell and emits a
//! [`PropertyChange`](crate::PropertyChange) on the per-field watchers, the
//! instance channel and the container channel.
//!
//! ```
//! use ferrous_services::{Container, Declaration, Notification, Registry};
//! use ferrous_services::signal::{signal, SignalPlugin};
//! use std::sync::{Arc, Mutex};
//!
//! let registry = Registry::new();
//! registry.register(|_| SignalPlugin);
//! let cart = registry.declare(Declaration::new("cart"), |d| {
//!     d.field("items", signal(0));
//! }).unwrap();
//!
//! let container = Container::new(registry);
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! container.subscribe(move |n: &Notification| {
//!     if let Some(change) = n.as_property_change() {
//!         sink.lock().unwrap().push((change.property.clone(), change.is_similar));
//!     }
//! });
//!
//! let instance = container.get_by_class(&cart, None);
//! instance.set("items", 0).unwrap();
//! instance.set("items", 2).unwrap();
//! assert_eq!(*seen.lock().unwrap(), vec![("items".to_string(), true), ("items".to_string(), false)]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::container::{ServiceInstance, WeakInstance};
use crate::definition::{Field, ServiceDefinition};
use crate::descriptors::{descriptor, Descriptor};
use crate::error::ServiceResult;
use crate::method::Value;
use crate::traits::{HookFuture, Plugin};

/// Per-instance backing store for intercepted fields.
#[derive(Default)]
pub struct Vault {
    values: Mutex<HashMap<String, Value>>,
}

impl Vault {
    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.lock().get(name).cloned()
    }

    /// Stores `value`, returning the previous value (`Null` if none).
    pub fn insert(&self, name: &str, value: Value) -> Value {
        self.values
            .lock()
            .insert(name.to_string(), value)
            .unwrap_or_default()
    }

    /// True if `name` is stored in the vault.
    pub fn contains(&self, name: &str) -> bool {
        self.values.lock().contains_key(name)
    }

    /// Copy of every stored value.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.lock().clone()
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.lock().iter()).finish()
    }
}

/// An intercepted field: reads and writes go through the owning instance's vault.
#[derive(Clone)]
pub struct Signal {
    name: Arc<str>,
    vault: Arc<Vault>,
    owner: WeakInstance,
}

impl Signal {
    pub(crate) fn new(name: &str, vault: Arc<Vault>, owner: WeakInstance) -> Self {
        Self {
            name: Arc::from(name),
            vault,
            owner,
        }
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn get(&self) -> Value {
        self.vault.get(&self.name).unwrap_or_default()
    }

    /// Current value deserialized into `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> ServiceResult<T> {
        Ok(serde_json::from_value(self.get())?)
    }

    /// Writes the vault, then notifies synchronously.
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        let previous = self.vault.insert(&self.name, value.clone());
        if let Some(owner) = self.owner.upgrade() {
            owner.notify_change(&self.name, value, previous);
        }
    }

    /// Replaces the value with `f(current)`.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&Value) -> Value,
    {
        let next = f(&self.get());
        self.set(next);
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("value", &self.get())
            .finish()
    }
}

/// Marker recorded for fields declared with [`signal`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalField;

/// A data field that becomes a [`Signal`] when the instance is created.
pub fn signal(initial: impl Into<Value>) -> impl Descriptor {
    let initial = initial.into();
    descriptor(move |builder, name| {
        builder.options_mut::<SignalField>().insert(name, SignalField);
        Field::Value(initial)
    })
}

/// Installs signal cells for every field declared with [`signal`].
///
/// Register this before plugins that read or persist signal values.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalPlugin;

impl Plugin for SignalPlugin {
    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        if let Some(fields) = definition.options::<SignalField>() {
            for (name, _) in fields.iter() {
                instance.install_signal(name);
            }
        }
        None
    }
}
