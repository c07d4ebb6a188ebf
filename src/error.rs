//! Error types for the service container and its plugins.

use thiserror::Error;

/// Service container errors
///
/// Covers resolution failures, plugin lookups, blueprint validation and the
/// runtime failures of wrapped service methods. Errors are `Clone` because a
/// single settled result may be handed to several waiting callers
/// (single-flight, debounce).
///
/// # Examples
///
/// ```rust
/// use ferrous_services::{Container, Registry, ServiceError};
///
/// let container = Container::new(Registry::new());
/// match container.get_by_name("missing", None) {
///     Err(ServiceError::NotRegistered(id)) => assert_eq!(id, "missing"),
///     _ => unreachable!(),
/// }
/// ```
///
/// ```rust
/// use ferrous_services::ServiceError;
///
/// let err = ServiceError::failed("connection refused");
/// assert_eq!(err.to_string(), "Service method failed: connection refused");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// No definition with this identifier exists in the registry
    #[error("Service not registered: {0}")]
    NotRegistered(String),
    /// The requested plugin type was never registered with the container
    #[error("Plugin not registered: {0}")]
    PluginNotRegistered(&'static str),
    /// A blueprint field uses a name reserved by the instance surface
    #[error("Field `{field}` of service `{service}` uses a reserved name")]
    ReservedField { service: String, field: String },
    /// The instance has no method with this name
    #[error("Service `{service}` has no method `{method}`")]
    MethodNotFound { service: String, method: String },
    /// The instance has no field with this name
    #[error("Service `{service}` has no field `{field}`")]
    FieldNotFound { service: String, field: String },
    /// A method was assigned where a value field exists, or the reverse
    #[error("Field `{field}` of service `{service}` is a method")]
    NotAValue { service: String, field: String },
    /// The wrapped method reported a failure
    #[error("Service method failed: {0}")]
    Failed(String),
    /// The owning instance was destroyed while the call was pending
    #[error("Call to `{method}` cancelled: instance destroyed")]
    Cancelled { method: String },
    /// A value could not be converted to or from JSON
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Scheduling was requested outside a tokio runtime
    #[error("No async runtime available to schedule `{0}`")]
    NoRuntime(String),
    /// Invalid plugin configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServiceError {
    /// Convenience constructor for method failures.
    pub fn failed(message: impl Into<String>) -> Self {
        ServiceError::Failed(message.into())
    }

    pub(crate) fn cancelled(method: &str) -> Self {
        ServiceError::Cancelled { method: method.to_string() }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

/// Result type for container operations
///
/// A convenience alias for `Result<T, ServiceError>` used throughout the crate.
pub type ServiceResult<T> = Result<T, ServiceError>;
