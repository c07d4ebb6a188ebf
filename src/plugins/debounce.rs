//! Debounced methods.
//!
//! Every call to a method declared with [`debounce`] cancels the pending
//! trigger and schedules a new one `delay` later. Only the last call's
//! arguments reach the underlying method, and every caller that was waiting
//! when the trigger fired receives the same result.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::millis;
use crate::container::{ServiceInstance, WeakInstance};
use crate::definition::ServiceDefinition;
use crate::descriptors::{descriptor, Descriptor};
use crate::error::ServiceError;
use crate::internal::{spawn, PendingKey, PendingTable};
use crate::method::{Args, Method, MethodResult};
use crate::plugins::plugin_config;
use crate::traits::{HookFuture, Plugin};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceOptions {
    /// Quiet period after the last call.
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(300),
        }
    }
}

/// Options recorded by [`debounce`]; `None` defers to the container config.
#[derive(Debug, Clone)]
pub struct DebounceField(pub Option<DebounceOptions>);

/// Debounces a method by `ms` milliseconds.
pub fn debounce(ms: u64, inner: impl Descriptor) -> impl Descriptor {
    debounce_with(
        Some(DebounceOptions {
            delay: Duration::from_millis(ms),
        }),
        inner,
    )
}

/// Like [`debounce`], using the container's [`PluginConfig`](crate::PluginConfig) defaults.
pub fn debounce_default(inner: impl Descriptor) -> impl Descriptor {
    debounce_with(None, inner)
}

fn debounce_with(options: Option<DebounceOptions>, inner: impl Descriptor) -> impl Descriptor {
    descriptor(move |builder, name| {
        builder.options_mut::<DebounceField>().insert(name, DebounceField(options));
        inner.describe(builder, name)
    })
}

#[derive(Default)]
struct DebounceState {
    generation: u64,
    trigger: Option<AbortHandle>,
    waiters: Vec<oneshot::Sender<MethodResult>>,
}

/// Plugin implementing [`debounce`].
#[derive(Default)]
pub struct DebouncePlugin {
    pending: Arc<PendingTable<DebounceState>>,
}

impl DebouncePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of methods with a scheduled trigger.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Plugin for DebouncePlugin {
    fn name(&self) -> &'static str {
        "debounce"
    }

    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        let fields = definition.options::<DebounceField>()?;
        let config = plugin_config(instance);
        for (name, DebounceField(options)) in fields.iter() {
            let delay = options.as_ref().unwrap_or(&config.debounce).delay;
            let pending = self.pending.clone();
            let method = name.to_string();
            let wrapped = instance.wrap_method(name, move |inner| {
                Method::from_boxed(move |this, args| schedule(&pending, &inner, &method, delay, this, args))
            });
            if !wrapped {
                warn!(service = definition.identifier(), method = name, "Debounce declared on a field that is not a method");
            }
        }
        None
    }

    fn on_destroy(&self, _definition: &ServiceDefinition, instance: &ServiceInstance) {
        for state in self.pending.drain_instance(instance.id()) {
            if let Some(trigger) = state.trigger {
                trigger.abort();
            }
            // Dropping the senders resolves every waiter with `Cancelled`.
        }
    }
}

fn schedule(
    pending: &Arc<PendingTable<DebounceState>>,
    inner: &Method,
    method: &str,
    delay: Duration,
    this: ServiceInstance,
    args: Args,
) -> BoxFuture<'static, MethodResult> {
    let key: PendingKey = (this.id(), method.to_string());
    let (tx, rx) = oneshot::channel();
    let generation = pending.with(&key, |state| {
        if let Some(previous) = state.trigger.take() {
            previous.abort();
        }
        state.generation += 1;
        state.waiters.push(tx);
        state.generation
    });

    let fire = trigger(
        pending.clone(),
        inner.clone(),
        this.downgrade(),
        key.clone(),
        generation,
        delay,
        args,
    );
    match spawn(method, fire) {
        Ok(task) => {
            pending.with_existing(&key, |state| {
                if state.generation == generation {
                    state.trigger = Some(task.abort_handle());
                }
            });
        }
        Err(err) => {
            pending.remove(&key);
            return future::ready(Err(err)).boxed();
        }
    }

    let method = method.to_string();
    async move { rx.await.unwrap_or_else(|_| Err(ServiceError::cancelled(&method))) }.boxed()
}

async fn trigger(
    pending: Arc<PendingTable<DebounceState>>,
    inner: Method,
    instance: WeakInstance,
    key: PendingKey,
    generation: u64,
    delay: Duration,
    args: Args,
) {
    tokio::time::sleep(delay).await;

    // Later calls take over the table entry; this trigger was aborted if so.
    let Some(state) = pending.remove_if(&key, |state| state.generation == generation) else {
        return;
    };
    let Some(this) = instance.upgrade() else {
        return;
    };

    debug!(
        service = this.definition().identifier(),
        method = %key.1,
        waiters = state.waiters.len(),
        "Debounced call firing"
    );
    let result = inner.call(this, args).await;
    for waiter in state.waiters {
        let _ = waiter.send(result.clone());
    }
}
