//! Resilience and persistence plugins.
//!
//! Every plugin here follows the same shape: a descriptor decorator records
//! per-field options on the definition, `on_create` wraps the instance
//! method (or subscribes to its changes), and `on_destroy` cancels whatever
//! the plugin still has pending for that instance.
//!
//! | Module | Decorator | Behavior |
//! |--------|-----------|----------|
//! | [`retry`] | `retry`, `retry_default` | re-run failed calls with backoff |
//! | [`debounce`] | `debounce`, `debounce_default` | run only the last call in a window |
//! | [`timer`] | `timer`, `timer_default` | repeat a method on an interval |
//! | [`single_flight`] | `single_flight` | coalesce overlapping calls |
//! | [`cache`] | `cached`, `cached_default` | single-flight plus a time-bound store |
//! | [`persist`] | `persisted` | restore and save field snapshots |

use std::sync::Arc;

use crate::config::PluginConfig;
use crate::container::ServiceInstance;

pub mod cache;
pub mod debounce;
pub mod persist;
pub mod retry;
pub mod single_flight;
pub mod timer;

pub use cache::{cached, CachePlugin, CacheStore, MemoryCacheStore};
pub use debounce::{debounce, DebouncePlugin};
pub use persist::{persisted, PersistPlugin, SnapshotProvider, SnapshotSaver};
pub use retry::{retry, RetryPlugin};
pub use single_flight::{single_flight, SingleFlightPlugin};
pub use timer::{timer, TimerPlugin};

// Defaults for descriptors declared without explicit options.
pub(crate) fn plugin_config(instance: &ServiceInstance) -> Arc<PluginConfig> {
    instance
        .container()
        .map(|container| container.config())
        .unwrap_or_default()
}
