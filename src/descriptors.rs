//! Field descriptors used to build service blueprints.
//!
//! A descriptor turns a field name into a [`Field`], optionally recording
//! metadata for a plugin on the [`DefinitionBuilder`]. Plugin decorators such
//! as [`retry`](crate::plugins::retry::retry) wrap another descriptor:
//!
//! ```
//! use ferrous_services::{Declaration, Registry};
//! use ferrous_services::descriptors::{method, value};
//! use ferrous_services::plugins::retry::{retry, RetryOptions};
//! use serde_json::json;
//!
//! let registry = Registry::new();
//! let def = registry
//!     .declare(Declaration::new("feed"), |d| {
//!         d.field("url", value("https://example.invalid/feed"));
//!         d.field("refresh", retry(RetryOptions::default(), method(|_this, _args| async {
//!             Ok(json!(true))
//!         })));
//!     })
//!     .unwrap();
//! assert_eq!(def.fields().count(), 2);
//! ```

use std::future::Future;

use crate::container::ServiceInstance;
use crate::definition::{DefinitionBuilder, Field};
use crate::method::{Args, Method, MethodResult, Value};

/// Produces a blueprint field for a given name.
pub trait Descriptor {
    /// Builds the field, optionally recording metadata on `builder`.
    fn describe(self, builder: &mut DefinitionBuilder, field: &str) -> Field;
}

impl<F> Descriptor for F
where
    F: FnOnce(&mut DefinitionBuilder, &str) -> Field,
{
    fn describe(self, builder: &mut DefinitionBuilder, field: &str) -> Field {
        self(builder, field)
    }
}

/// Pins a closure to the descriptor signature.
pub fn descriptor<F>(f: F) -> F
where
    F: FnOnce(&mut DefinitionBuilder, &str) -> Field,
{
    f
}

/// A plain data field with a default value.
pub fn value(initial: impl Into<Value>) -> impl Descriptor {
    let initial = initial.into();
    descriptor(move |_builder, _name| Field::Value(initial))
}

/// A method field backed by an async closure.
pub fn method<F, Fut>(f: F) -> impl Descriptor
where
    F: Fn(ServiceInstance, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    let method = Method::new(f);
    descriptor(move |_builder, _name| Field::Method(method))
}

/// A method field from an existing [`Method`].
pub fn existing(method: Method) -> impl Descriptor {
    descriptor(move |_builder, _name| Field::Method(method))
}
