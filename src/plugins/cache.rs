//! Time-bound result cache.
//!
//! A method declared with [`cached`] is single-flight, and its successful
//! results are written to a [`CacheStore`] under
//! `"{identifier}.{method}:{json(args)}"` (the identifier gains `":{scope}"`
//! for scoped instances). Until the entry's expiry, calls with the same
//! arguments are served from the store.
//!
//! The store sits behind an async trait so durable backends can be plugged
//! in; [`MemoryCacheStore`] is the default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::millis;
use crate::container::ServiceInstance;
use crate::definition::ServiceDefinition;
use crate::descriptors::{descriptor, Descriptor};
use crate::error::ServiceResult;
use crate::method::{Args, Method, MethodFuture, Value};
use crate::plugins::plugin_config;
use crate::plugins::single_flight::Flights;
use crate::traits::{HookFuture, Plugin};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Lifetime of a stored result.
    #[serde(with = "millis")]
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
        }
    }
}

/// A stored result and its expiry in clock milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at_ms: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Storage backend for cached results.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> ServiceResult<Option<CacheEntry>>;

    async fn put(&self, key: &str, entry: CacheEntry) -> ServiceResult<()>;

    /// Removes `key`, returning whether it existed.
    async fn remove(&self, key: &str) -> ServiceResult<bool>;

    async fn keys(&self) -> ServiceResult<Vec<String>>;

    /// Removes every entry expired at `now_ms`; returns how many were removed.
    async fn prune(&self, now_ms: u64) -> ServiceResult<usize> {
        let mut removed = 0;
        for key in self.keys().await? {
            let expired = matches!(self.get(&key).await?, Some(entry) if !entry.is_fresh(now_ms));
            if expired && self.remove(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Process-local [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> ServiceResult<Option<CacheEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> ServiceResult<()> {
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> ServiceResult<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn keys(&self) -> ServiceResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn prune(&self, now_ms: u64) -> ServiceResult<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now_ms));
        Ok(before - entries.len())
    }
}

/// Milliseconds source used for expiry.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Wall-clock milliseconds since the Unix epoch.
pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    })
}

/// Options recorded by [`cached`]; `None` defers to the container config.
#[derive(Debug, Clone)]
pub struct CacheField(pub Option<CacheOptions>);

/// Caches a method's successful results for `options.ttl`.
pub fn cached(options: CacheOptions, inner: impl Descriptor) -> impl Descriptor {
    cached_with(Some(options), inner)
}

/// Like [`cached`], using the container's [`PluginConfig`](crate::PluginConfig) defaults.
pub fn cached_default(inner: impl Descriptor) -> impl Descriptor {
    cached_with(None, inner)
}

fn cached_with(options: Option<CacheOptions>, inner: impl Descriptor) -> impl Descriptor {
    descriptor(move |builder, name| {
        builder.options_mut::<CacheField>().insert(name, CacheField(options));
        inner.describe(builder, name)
    })
}

/// Cache key for a call.
pub fn cache_key(instance: &ServiceInstance, method: &str, args: &Args) -> String {
    let identifier = instance.definition().identifier();
    let encoded = serde_json::to_string(args).unwrap_or_default();
    match instance.scope() {
        Some(scope) => format!("{identifier}:{scope}.{method}:{encoded}"),
        None => format!("{identifier}.{method}:{encoded}"),
    }
}

/// Plugin implementing [`cached`].
///
/// ```
/// use ferrous_services::plugins::cache::{CachePlugin, MemoryCacheStore};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let now = Arc::new(AtomicU64::new(0));
/// let clock = now.clone();
/// let plugin = CachePlugin::new(Arc::new(MemoryCacheStore::new()))
///     .with_clock(Arc::new(move || clock.load(Ordering::SeqCst)));
/// # let _ = plugin;
/// ```
pub struct CachePlugin {
    store: Arc<dyn CacheStore>,
    clock: Clock,
    flights: Arc<Flights>,
}

impl Default for CachePlugin {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl CachePlugin {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            clock: system_clock(),
            flights: Arc::new(Flights::default()),
        }
    }

    /// A plugin backed by a fresh [`MemoryCacheStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    /// Replaces the expiry clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Stored keys, expired ones included.
    pub async fn keys(&self) -> ServiceResult<Vec<String>> {
        self.store.keys().await
    }

    /// Drops every expired entry from the store.
    pub async fn prune_expired(&self) -> ServiceResult<usize> {
        self.store.prune((self.clock)()).await
    }

    /// Removes every stored key matching `matcher`; returns how many were removed.
    pub async fn clear<F>(&self, matcher: F) -> ServiceResult<usize>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        for key in self.store.keys().await? {
            if matcher(&key) && self.store.remove(&key).await? {
                removed += 1;
            }
        }
        debug!(removed, "Cache cleared");
        Ok(removed)
    }

    /// Overwrites the value of every stored key matching `matcher`, keeping
    /// each entry's expiry; returns how many were replaced.
    pub async fn replace<F>(&self, matcher: F, value: Value) -> ServiceResult<usize>
    where
        F: Fn(&str) -> bool,
    {
        let mut replaced = 0;
        for key in self.store.keys().await? {
            if !matcher(&key) {
                continue;
            }
            if let Some(entry) = self.store.get(&key).await? {
                let entry = CacheEntry {
                    value: value.clone(),
                    ..entry
                };
                self.store.put(&key, entry).await?;
                replaced += 1;
            }
        }
        Ok(replaced)
    }
}

impl Plugin for CachePlugin {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        let fields = definition.options::<CacheField>()?;
        let config = plugin_config(instance);
        for (name, CacheField(options)) in fields.iter() {
            let ttl = options.as_ref().unwrap_or(&config.cache).ttl;
            let call = CachedCall {
                store: self.store.clone(),
                clock: self.clock.clone(),
                flights: self.flights.clone(),
                method: name.to_string(),
                ttl_ms: ttl.as_millis() as u64,
            };
            let wrapped = instance.wrap_method(name, move |inner| {
                Method::from_boxed(move |this, args| call.invoke(&inner, this, args))
            });
            if !wrapped {
                warn!(service = definition.identifier(), method = name, "Cache declared on a field that is not a method");
            }
        }
        None
    }

    fn on_destroy(&self, _definition: &ServiceDefinition, instance: &ServiceInstance) {
        self.flights.cancel_instance(instance.id());
    }
}

#[derive(Clone)]
struct CachedCall {
    store: Arc<dyn CacheStore>,
    clock: Clock,
    flights: Arc<Flights>,
    method: String,
    ttl_ms: u64,
}

impl CachedCall {
    fn invoke(&self, inner: &Method, this: ServiceInstance, args: Args) -> MethodFuture {
        let call = self.clone();
        let inner = inner.clone();
        async move {
            let key = cache_key(&this, &call.method, &args);
            match call.store.get(&key).await {
                Ok(Some(entry)) if entry.is_fresh((call.clock)()) => {
                    debug!(method = %call.method, key = %key, "Cache hit");
                    return Ok(entry.value);
                }
                Ok(_) => {}
                Err(err) => warn!(method = %call.method, key = %key, error = %err, "Cache read failed"),
            }

            let store = call.store.clone();
            let clock = call.clock.clone();
            let ttl_ms = call.ttl_ms;
            let flight_key = (this.id(), key.clone());
            call.flights
                .join(flight_key, move || {
                    async move {
                        let result = inner.call(this, args).await;
                        if let Ok(value) = &result {
                            // Expired entries for other arguments are dropped on every write.
                            let now = clock();
                            if let Err(err) = store.prune(now).await {
                                warn!(error = %err, "Cache prune failed");
                            }
                            let entry = CacheEntry {
                                value: value.clone(),
                                expires_at_ms: now.saturating_add(ttl_ms),
                            };
                            if let Err(err) = store.put(&key, entry).await {
                                warn!(key = %key, error = %err, "Cache write failed");
                            }
                        }
                        result
                    }
                    .boxed()
                })
                .await
        }
        .boxed()
    }
}
