//! # ferrous-services
//!
//! Declarative singleton services with an ordered plugin pipeline, observable
//! signal fields and resilience wrappers (retry, debounce, timer, single-flight,
//! time-bound cache).
//!
//! ## Features
//!
//! - **Declarative blueprints**: services are declared once from descriptors and
//!   registered under a unique identifier
//! - **Singleton resolution**: exactly one instance per (definition, scope) per container
//! - **Ordered plugins**: `on_create` hooks run in registration order, `on_destroy`
//!   hooks in reverse order
//! - **Signals**: intercepted fields become vault-backed cells that emit change
//!   notifications on the instance and container channels
//! - **Resilience**: retry-with-backoff, debounce, repeating timers, single-flight
//!   de-duplication and a time-bound result cache, all cancelled on `destroy()`
//!
//! ## Quick Start
//!
//! ```rust
//! use ferrous_services::{Container, Declaration, Registry};
//! use ferrous_services::descriptors::{method, value};
//! use ferrous_services::signal::{signal, SignalPlugin};
//! use serde_json::json;
//!
//! let registry = Registry::new();
//! registry.register(|_| SignalPlugin);
//!
//! let counter = registry
//!     .declare(Declaration::new("counter").order(10), |d| {
//!         d.field("label", value("clicks"));
//!         d.field("count", signal(0));
//!         d.field("increment", method(|this, _args| async move {
//!             let next = this.get_as::<i64>("count")? + 1;
//!             this.set("count", next)?;
//!             Ok(json!(next))
//!         }));
//!     })
//!     .unwrap();
//!
//! let container = Container::new(registry);
//! let first = container.get_by_class(&counter, None);
//! let second = container.get_by_class(&counter, None);
//! assert!(first.ptr_eq(&second));
//!
//! first.set("count", 41).unwrap();
//! assert_eq!(second.get("count"), Some(json!(41)));
//! ```
//!
//! ## Plugin Ordering
//!
//! Plugins registered on the [`Registry`] are instantiated once per
//! [`Container`]. Later plugins may rely on earlier ones having instrumented
//! the instance, so register [`signal::SignalPlugin`] before anything that
//! reads signal cells (such as [`plugins::persist::PersistPlugin`]).

// Module declarations
pub mod config;
pub mod container;
pub mod definition;
pub mod descriptors;
pub mod error;
pub mod event_bus;
pub mod method;
pub mod notification;
pub mod plugins;
pub mod registry;
pub mod signal;
pub mod traits;

// Internal modules
mod internal;

// Re-export core types
pub use config::PluginConfig;
pub use container::{Container, ServiceInstance, WeakContainer, WeakInstance};
pub use definition::{Declaration, DefinitionBuilder, Field, ServiceDefinition, RESERVED_FIELDS};
pub use error::{ServiceError, ServiceResult};
pub use event_bus::{Dispatch, EventBus, Subscription, UnaryEventBus};
pub use method::{Args, Method, MethodFuture, MethodResult, Value};
pub use notification::{Notification, PropertyChange};
pub use registry::Registry;
pub use traits::{HookFuture, Plugin};
