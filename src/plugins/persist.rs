//! Field snapshots.
//!
//! Fields declared with [`persisted`] are written to a [`SnapshotSaver`]
//! whenever one of them changes, and restored from a [`SnapshotProvider`]
//! when the instance is created. Both collaborators are read from container
//! properties ([`PERSIST_PROVIDER`], [`PERSIST_SAVER`]), so a container
//! without them simply does not persist.
//!
//! Snapshots are JSON objects mapping field name to value, stored under
//! [`ServiceDefinition::persistence_key`]. Change detection relies on signal
//! cells: declare persisted fields as `persisted(signal(..))` and register
//! [`PersistPlugin`] after [`SignalPlugin`](crate::signal::SignalPlugin).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::FutureExt;
use parking_lot::Mutex;
use serde_json::Map;
use tracing::{debug, warn};

use crate::container::ServiceInstance;
use crate::definition::ServiceDefinition;
use crate::descriptors::{descriptor, Descriptor};
use crate::error::ServiceResult;
use crate::event_bus::Subscription;
use crate::internal::PendingTable;
use crate::method::Value;
use crate::notification::Notification;
use crate::traits::{HookFuture, Plugin};

/// Property holding an `Arc<dyn SnapshotProvider>`.
pub const PERSIST_PROVIDER: &str = "ferrous_services.persist.provider";

/// Property holding an `Arc<dyn SnapshotSaver>`.
pub const PERSIST_SAVER: &str = "ferrous_services.persist.saver";

/// Source of stored snapshots.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn load(&self, key: &str) -> ServiceResult<Option<Value>>;
}

/// Sink for snapshots.
#[async_trait]
pub trait SnapshotSaver: Send + Sync {
    async fn save(&self, key: &str, snapshot: Value) -> ServiceResult<()>;
}

/// In-memory snapshot store implementing both sides.
#[derive(Debug, Default)]
pub struct MemorySnapshots {
    snapshots: Mutex<HashMap<String, Value>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.snapshots.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, snapshot: Value) {
        self.snapshots.lock().insert(key.into(), snapshot);
    }
}

#[async_trait]
impl SnapshotProvider for MemorySnapshots {
    async fn load(&self, key: &str) -> ServiceResult<Option<Value>> {
        Ok(self.get(key))
    }
}

#[async_trait]
impl SnapshotSaver for MemorySnapshots {
    async fn save(&self, key: &str, snapshot: Value) -> ServiceResult<()> {
        self.insert(key, snapshot);
        Ok(())
    }
}

/// Marker recorded for fields declared with [`persisted`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistField;

/// Includes a data field in the instance snapshot.
pub fn persisted(inner: impl Descriptor) -> impl Descriptor {
    descriptor(move |builder, name| {
        builder.options_mut::<PersistField>().insert(name, PersistField);
        inner.describe(builder, name)
    })
}

/// Current values of the persisted fields as a JSON object.
pub fn snapshot(instance: &ServiceInstance, fields: &[String]) -> Value {
    let map: Map<String, Value> = fields
        .iter()
        .filter_map(|name| instance.get(name).map(|value| (name.clone(), value)))
        .collect();
    Value::Object(map)
}

/// Plugin implementing [`persisted`].
#[derive(Default)]
pub struct PersistPlugin {
    subscriptions: PendingTable<Vec<Subscription>>,
}

impl PersistPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Plugin for PersistPlugin {
    fn name(&self) -> &'static str {
        "persist"
    }

    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        let fields = Arc::new(definition.options::<PersistField>()?.names());

        let watched = fields.clone();
        let subscription = instance.subscribe_async(move |notification: &Notification| {
            let change = notification
                .as_property_change()
                .filter(|change| watched.contains(&change.property))
                .cloned();
            let fields = watched.clone();
            async move {
                if let Some(change) = change {
                    save(&change.instance, &fields).await;
                }
            }
        });
        self.subscriptions
            .with(&(instance.id(), String::new()), |subscriptions| subscriptions.push(subscription));

        let instance = instance.clone();
        Some(async move { restore(&instance, &fields).await }.boxed())
    }

    fn on_destroy(&self, _definition: &ServiceDefinition, instance: &ServiceInstance) {
        for subscriptions in self.subscriptions.drain_instance(instance.id()) {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
        }
    }
}

async fn restore(instance: &ServiceInstance, fields: &[String]) -> ServiceResult<()> {
    let Some(container) = instance.container() else {
        return Ok(());
    };
    let Some(provider) = container.get_property::<Arc<dyn SnapshotProvider>>(PERSIST_PROVIDER) else {
        return Ok(());
    };

    let key = instance.definition().persistence_key(instance.scope());
    let Some(Value::Object(stored)) = provider.load(&key).await? else {
        debug!(key = %key, "No snapshot to restore");
        return Ok(());
    };
    for name in fields {
        if let Some(value) = stored.get(name) {
            instance.set(name, value.clone())?;
        }
    }
    debug!(key = %key, "Snapshot restored");
    Ok(())
}

async fn save(instance: &ServiceInstance, fields: &[String]) {
    let Some(container) = instance.container() else {
        return;
    };
    if container.is_halted() {
        return;
    }
    let Some(saver) = container.get_property::<Arc<dyn SnapshotSaver>>(PERSIST_SAVER) else {
        return;
    };

    let key = instance.definition().persistence_key(instance.scope());
    if let Err(err) = saver.save(&key, snapshot(instance, fields)).await {
        warn!(key = %key, error = %err, "Snapshot save failed");
    }
}
