//! Retry with backoff.
//!
//! A method declared with [`retry`] is re-run after a delay whenever it
//! fails, until it succeeds or the shot limit is reached. While an attempt
//! cycle is running, further calls are dropped: they resolve to
//! `Ok(Value::Null)` immediately and do not queue.
//!
//! ```
//! use ferrous_services::plugins::retry::{RetryCurve, RetryOptions};
//! use std::time::Duration;
//!
//! let options = RetryOptions {
//!     shots: 0,
//!     interval: Duration::from_millis(100),
//!     maximum_delay: Duration::from_millis(300),
//!     curve: RetryCurve::Log,
//! };
//! let delays: Vec<u128> = options.delays().take(4).map(|d| d.as_millis()).collect();
//! assert_eq!(delays, vec![100, 200, 300, 300]);
//! ```

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
use crate::method::{Args, Method, MethodResult, Value};
use crate::plugins::plugin_config;
use crate::traits::{HookFuture, Plugin};

/// How the delay between attempts evolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryCurve {
    /// Doubles after every failure, capped at `maximum_delay`
    #[default]
    Log,
    /// Stays at `interval`
    Linear,
}

/// Retry policy for one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total attempts including the first; `0` retries forever.
    pub shots: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Upper bound for the `Log` curve.
    #[serde(with = "millis")]
    pub maximum_delay: Duration,
    pub curve: RetryCurve,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            shots: 3,
            interval: Duration::from_millis(1000),
            maximum_delay: Duration::from_secs(30),
            curve: RetryCurve::Log,
        }
    }
}

impl RetryOptions {
    /// The delay that follows `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        match self.curve {
            RetryCurve::Log => current.saturating_mul(2).min(self.maximum_delay),
            RetryCurve::Linear => self.interval,
        }
    }

    /// Delays between consecutive attempts.
    ///
    /// Yields `shots - 1` delays, or an endless schedule when `shots` is `0`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let retries = match self.shots {
            0 => usize::MAX,
            shots => shots as usize - 1,
        };
        std::iter::successors(Some(self.interval), move |current| Some(self.next_delay(*current))).take(retries)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.shots != 0 && attempts >= self.shots
    }
}

/// Options recorded by [`retry`]; `None` defers to the container config.
#[derive(Debug, Clone)]
pub struct RetryField(pub Option<RetryOptions>);

/// Wraps a method descriptor with retry behavior.
pub fn retry(options: RetryOptions, inner: impl Descriptor) -> impl Descriptor {
    retry_with(Some(options), inner)
}

/// Like [`retry`], using the container's [`PluginConfig`](crate::PluginConfig) defaults.
pub fn retry_default(inner: impl Descriptor) -> impl Descriptor {
    retry_with(None, inner)
}

fn retry_with(options: Option<RetryOptions>, inner: impl Descriptor) -> impl Descriptor {
    descriptor(move |builder, name| {
        builder.options_mut::<RetryField>().insert(name, RetryField(options));
        inner.describe(builder, name)
    })
}

#[derive(Default)]
struct RetryState {
    running: bool,
    task: Option<AbortHandle>,
}

/// Plugin implementing [`retry`].
#[derive(Default)]
pub struct RetryPlugin {
    pending: Arc<PendingTable<RetryState>>,
}

impl RetryPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempt cycles currently running or waiting to retry.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Plugin for RetryPlugin {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        let fields = definition.options::<RetryField>()?;
        let config = plugin_config(instance);
        for (name, RetryField(options)) in fields.iter() {
            let options = Arc::new(options.clone().unwrap_or_else(|| config.retry.clone()));
            let pending = self.pending.clone();
            let method = name.to_string();
            let wrapped = instance.wrap_method(name, move |inner| {
                Method::from_boxed(move |this, args| {
                    start(&pending, &inner, &method, &options, this, args)
                })
            });
            if !wrapped {
                warn!(service = definition.identifier(), method = name, "Retry declared on a field that is not a method");
            }
        }
        None
    }

    fn on_destroy(&self, _definition: &ServiceDefinition, instance: &ServiceInstance) {
        for state in self.pending.drain_instance(instance.id()) {
            if let Some(task) = state.task {
                task.abort();
            }
        }
    }
}

fn start(
    pending: &Arc<PendingTable<RetryState>>,
    inner: &Method,
    method: &str,
    options: &Arc<RetryOptions>,
    this: ServiceInstance,
    args: Args,
) -> BoxFuture<'static, MethodResult> {
    let key: PendingKey = (this.id(), method.to_string());
    let claimed = pending.with(&key, |state| !std::mem::replace(&mut state.running, true));
    if !claimed {
        debug!(service = this.definition().identifier(), method, "Attempt already running; call dropped");
        return future::ready(Ok(Value::Null)).boxed();
    }

    let (tx, rx) = oneshot::channel();
    let cycle = attempts(
        inner.clone(),
        this.downgrade(),
        this.definition().identifier().to_string(),
        key.clone(),
        options.clone(),
        args,
    );
    let table = pending.clone();
    let task_key = key.clone();
    let spawned = spawn(method, async move {
        let result = cycle.await;
        table.remove(&task_key);
        let _ = tx.send(result);
    });

    match spawned {
        Ok(task) => {
            pending.with_existing(&key, |state| state.task = Some(task.abort_handle()));
        }
        Err(err) => {
            pending.remove(&key);
            return future::ready(Err(err)).boxed();
        }
    }

    let method = method.to_string();
    async move { rx.await.unwrap_or_else(|_| Err(ServiceError::cancelled(&method))) }.boxed()
}

async fn attempts(
    inner: Method,
    instance: WeakInstance,
    service: String,
    key: PendingKey,
    options: Arc<RetryOptions>,
    args: Args,
) -> MethodResult {
    let method = key.1;
    let mut delay = options.interval;
    let mut attempt = 0u32;
    loop {
        let Some(this) = instance.upgrade() else {
            return Err(ServiceError::cancelled(&method));
        };
        attempt += 1;
        let err = match inner.call(this, args.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        warn!(service = %service, method = %method, attempt, error = %err, "Attempt failed");
        if options.exhausted(attempt) {
            return Err(err);
        }
        debug!(service = %service, method = %method, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        tokio::time::sleep(delay).await;
        delay = options.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn linear_schedule_is_flat() {
        let options = RetryOptions {
            shots: 4,
            interval: Duration::from_millis(250),
            curve: RetryCurve::Linear,
            ..RetryOptions::default()
        };
        let delays: Vec<Duration> = options.delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(250); 3]);
    }

    #[test]
    fn single_shot_never_retries() {
        let options = RetryOptions {
            shots: 1,
            ..RetryOptions::default()
        };
        assert_eq!(options.delays().count(), 0);
    }

    proptest! {
        #[test]
        fn log_schedule_is_monotonic_and_capped(interval in 1u64..5_000, cap_factor in 1u64..64, shots in 2u32..40) {
            let options = RetryOptions {
                shots,
                interval: Duration::from_millis(interval),
                maximum_delay: Duration::from_millis(interval * cap_factor),
                curve: RetryCurve::Log,
            };
            let delays: Vec<Duration> = options.delays().collect();
            prop_assert_eq!(delays.len(), shots as usize - 1);
            prop_assert_eq!(delays[0], options.interval);
            for pair in delays.windows(2) {
                prop_assert!(pair[1] >= pair[0]);
                prop_assert!(pair[1] <= options.maximum_delay);
                prop_assert!(pair[1] == pair[0] * 2 || pair[1] == options.maximum_delay);
            }
        }
    }
}
