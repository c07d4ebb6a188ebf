//! Repeating timers.
//!
//! A method declared with [`timer`] is called on a fixed interval with two
//! arguments: the milliseconds elapsed since the cycle started and the
//! 1-based shot number. Returning `false` stops the cycle, as does reaching
//! the shot limit. Unless the timer is `manual` the cycle starts when the
//! instance is created; calling the method restarts it and returns the
//! result of the first tick.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::millis;
use crate::container::{ServiceInstance, WeakInstance};
use crate::definition::ServiceDefinition;
use crate::descriptors::{descriptor, Descriptor};
use crate::internal::{spawn, PendingKey, PendingTable};
use crate::method::{Method, MethodResult, Value};
use crate::plugins::plugin_config;
use crate::traits::{HookFuture, Plugin};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerOptions {
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Maximum number of ticks; `0` runs until stopped.
    pub shots: u32,
    /// Wait for the first explicit call instead of starting on creation.
    pub manual: bool,
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            shots: 0,
            manual: false,
        }
    }
}

/// Options recorded by [`timer`]; `None` defers to the container config.
#[derive(Debug, Clone)]
pub struct TimerField(pub Option<TimerOptions>);

/// Runs a method repeatedly.
pub fn timer(options: TimerOptions, inner: impl Descriptor) -> impl Descriptor {
    timer_with(Some(options), inner)
}

/// Like [`timer`], using the container's [`PluginConfig`](crate::PluginConfig) defaults.
pub fn timer_default(inner: impl Descriptor) -> impl Descriptor {
    timer_with(None, inner)
}

fn timer_with(options: Option<TimerOptions>, inner: impl Descriptor) -> impl Descriptor {
    descriptor(move |builder, name| {
        builder.options_mut::<TimerField>().insert(name, TimerField(options));
        inner.describe(builder, name)
    })
}

#[derive(Default)]
struct TimerState {
    generation: u64,
    tick: Option<AbortHandle>,
}

// One wrapped timer method.
struct Cycle {
    pending: Arc<PendingTable<TimerState>>,
    inner: Method,
    service: String,
    method: String,
    options: TimerOptions,
}

impl Cycle {
    fn more_shots(&self, shot: u32) -> bool {
        self.options.shots == 0 || shot < self.options.shots
    }

    // Cancels the running cycle and claims a new generation.
    fn claim(&self, key: &PendingKey) -> u64 {
        self.pending.with(key, |state| {
            if let Some(tick) = state.tick.take() {
                tick.abort();
            }
            state.generation += 1;
            state.generation
        })
    }

    async fn fire(&self, instance: &WeakInstance, started: Instant, shot: u32) -> Option<MethodResult> {
        let this = instance.upgrade()?;
        let elapsed = started.elapsed().as_millis() as u64;
        Some(self.inner.call(this, vec![json!(elapsed), json!(shot)]).await)
    }

    // Whether the cycle continues after `result`.
    fn proceed(&self, result: &MethodResult, shot: u32) -> bool {
        match result {
            Ok(Value::Bool(false)) => {
                debug!(service = %self.service, method = %self.method, shot, "Timer stopped by its method");
                false
            }
            Ok(_) => self.more_shots(shot),
            Err(err) => {
                warn!(service = %self.service, method = %self.method, shot, error = %err, "Timer tick failed; cycle stopped");
                false
            }
        }
    }

    // Ticks from `shot` onwards, waiting one interval before each.
    async fn run(self: Arc<Self>, instance: WeakInstance, key: PendingKey, generation: u64, started: Instant, mut shot: u32) {
        loop {
            tokio::time::sleep(self.options.interval).await;
            let Some(result) = self.fire(&instance, started, shot).await else {
                break;
            };
            if !self.proceed(&result, shot) {
                break;
            }
            shot += 1;
        }
        self.pending.remove_if(&key, |state| state.generation == generation);
    }

    fn schedule(self: &Arc<Self>, instance: WeakInstance, key: PendingKey, generation: u64, started: Instant, shot: u32) {
        let run = self.clone().run(instance, key.clone(), generation, started, shot);
        match spawn(&self.method, run) {
            Ok(task) => {
                self.pending.with_existing(&key, |state| {
                    if state.generation == generation {
                        state.tick = Some(task.abort_handle());
                    }
                });
            }
            Err(err) => {
                warn!(service = %self.service, method = %self.method, error = %err, "Timer not scheduled");
                self.pending.remove_if(&key, |state| state.generation == generation);
            }
        }
    }

    /// Restarts the cycle, runs the first tick inline and schedules the rest.
    async fn restart(self: Arc<Self>, instance: WeakInstance) -> MethodResult {
        let Some(id) = instance.upgrade().map(|this| this.id()) else {
            return Ok(Value::Null);
        };
        let key: PendingKey = (id, self.method.clone());
        let generation = self.claim(&key);
        let started = Instant::now();

        let Some(result) = self.fire(&instance, started, 1).await else {
            return Ok(Value::Null);
        };
        let superseded = self
            .pending
            .with_existing(&key, |state| state.generation != generation)
            .unwrap_or(true);
        if !superseded && self.proceed(&result, 1) {
            self.schedule(instance, key, generation, started, 2);
        } else if !superseded {
            self.pending.remove_if(&key, |state| state.generation == generation);
        }
        result
    }
}

/// Plugin implementing [`timer`].
#[derive(Default)]
pub struct TimerPlugin {
    pending: Arc<PendingTable<TimerState>>,
}

impl TimerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers with a scheduled tick.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Plugin for TimerPlugin {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        let fields = definition.options::<TimerField>()?;
        let config = plugin_config(instance);
        let mut autostart = Vec::new();

        for (name, TimerField(options)) in fields.iter() {
            let Some(inner) = instance.method(name) else {
                warn!(service = definition.identifier(), method = name, "Timer declared on a field that is not a method");
                continue;
            };
            let options = options.clone().unwrap_or_else(|| config.timer.clone());
            if options.interval.is_zero() {
                warn!(service = definition.identifier(), method = name, "Timer interval is zero; timer not installed");
                continue;
            }
            let cycle = Arc::new(Cycle {
                pending: self.pending.clone(),
                inner,
                service: definition.identifier().to_string(),
                method: name.to_string(),
                options,
            });

            let wrapper = cycle.clone();
            instance.wrap_method(name, move |_| {
                Method::from_boxed(move |this, _args| wrapper.clone().restart(this.downgrade()).boxed())
            });
            if !cycle.options.manual {
                autostart.push(cycle);
            }
        }

        if autostart.is_empty() {
            return None;
        }

        // The first tick runs as the asynchronous part of creation.
        let weak = instance.downgrade();
        Some(
            async move {
                let ticks = autostart.into_iter().map(|cycle| cycle.restart(weak.clone()));
                future::join_all(ticks).await;
                Ok(())
            }
            .boxed(),
        )
    }

    fn on_destroy(&self, _definition: &ServiceDefinition, instance: &ServiceInstance) {
        for state in self.pending.drain_instance(instance.id()) {
            if let Some(tick) = state.tick {
                tick.abort();
            }
        }
    }
}
