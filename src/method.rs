//! Dynamic values and service methods.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::container::ServiceInstance;
use crate::error::ServiceResult;

/// Dynamic value stored in service fields and passed to methods.
pub type Value = serde_json::Value;

/// Positional method arguments.
pub type Args = Vec<Value>;

/// Result of a method invocation.
pub type MethodResult = ServiceResult<Value>;

/// Boxed future returned by every method call.
pub type MethodFuture = BoxFuture<'static, MethodResult>;

type MethodFn = dyn Fn(ServiceInstance, Args) -> MethodFuture + Send + Sync;

/// A callable service method.
///
/// Methods receive the owning instance and their positional arguments and
/// return a boxed future. They are cheap to clone; plugins wrap them by
/// building a new `Method` that captures the original.
///
/// # Examples
///
/// ```
/// use ferrous_services::Method;
/// use serde_json::json;
///
/// let add = Method::new(|_this, args| async move {
///     let a = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
///     let b = args.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
///     Ok(json!(a + b))
/// });
/// # let _ = add;
/// ```
#[derive(Clone)]
pub struct Method {
    inner: Arc<MethodFn>,
}

impl Method {
    /// Creates a method from an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ServiceInstance, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |instance, args| f(instance, args).boxed()),
        }
    }

    /// Creates a method from a closure that already returns a boxed future.
    pub fn from_boxed<F>(f: F) -> Self
    where
        F: Fn(ServiceInstance, Args) -> MethodFuture + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Invokes the method against `instance`.
    pub fn call(&self, instance: ServiceInstance, args: Args) -> MethodFuture {
        (self.inner)(instance, args)
    }

    /// Returns true if both handles point at the same closure.
    pub fn ptr_eq(&self, other: &Method) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Method(..)")
    }
}
