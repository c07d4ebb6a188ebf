//! Notification events carried by instance and container channels.

use crate::container::ServiceInstance;
use crate::definition::ServiceDefinition;
use crate::method::Value;

/// A signal field was written.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    /// Name of the written field
    pub property: String,
    /// Value after the write
    pub value: Value,
    /// Value before the write
    pub previous: Value,
    /// Definition of the owning service
    pub target: ServiceDefinition,
    /// The owning instance
    pub instance: ServiceInstance,
    /// True when the new value equals the previous one
    pub is_similar: bool,
}

/// Message carried on instance and container channels.
///
/// Listeners should match on the variant they care about and ignore the rest.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Emitted by signal cells on every write
    PropertyChanged(PropertyChange),
    /// Free-form message dispatched by services or plugins
    Message { topic: String, payload: Value },
}

impl Notification {
    /// Builds a free-form message.
    pub fn message(topic: impl Into<String>, payload: impl Into<Value>) -> Self {
        Notification::Message {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Returns the property change if this is one.
    pub fn as_property_change(&self) -> Option<&PropertyChange> {
        match self {
            Notification::PropertyChanged(change) => Some(change),
            Notification::Message { .. } => None,
        }
    }
}
