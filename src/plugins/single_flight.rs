//! Single-flight call coalescing.
//!
//! While a call to a method declared with [`single_flight`] is pending, every
//! further call attaches to it instead of starting new work. When the call
//! settles all attached callers receive the same result, success or error.

use std::sync::Arc;

use futures::future::{self, AbortHandle, Aborted, BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::container::ServiceInstance;
use crate::definition::ServiceDefinition;
use crate::descriptors::{descriptor, Descriptor};
use crate::error::ServiceError;
use crate::internal::{PendingKey, PendingTable};
use crate::method::{Method, MethodFuture, MethodResult};
use crate::traits::{HookFuture, Plugin};

type Flight = Shared<BoxFuture<'static, MethodResult>>;

#[derive(Default)]
struct FlightState {
    generation: u64,
    flight: Option<(Flight, AbortHandle)>,
}

/// In-flight calls keyed by (instance, call key).
#[derive(Default)]
pub(crate) struct Flights {
    table: Arc<PendingTable<FlightState>>,
}

impl Flights {
    /// Attaches to the pending call for `key`, or starts one with `start`.
    pub(crate) fn join<F>(&self, key: PendingKey, start: F) -> MethodFuture
    where
        F: FnOnce() -> MethodFuture,
    {
        let joined = self
            .table
            .with_existing(&key, |state| state.flight.as_ref().map(|(flight, _)| flight.clone()))
            .flatten();
        if let Some(flight) = joined {
            debug!(method = %key.1, "Joined in-flight call");
            return flight.boxed();
        }

        // Started outside the table lock; a racing caller may win the slot,
        // in which case this call is dropped unpolled.
        let (call, abort) = future::abortable(start());
        let table = self.table.clone();
        let cleanup_key = key.clone();
        self.table
            .with(&key, move |state| {
                if let Some((existing, _)) = &state.flight {
                    return existing.clone();
                }
                state.generation += 1;
                let generation = state.generation;
                let flight = async move {
                    let result = match call.await {
                        Ok(result) => result,
                        Err(Aborted) => Err(ServiceError::cancelled(&cleanup_key.1)),
                    };
                    table.remove_if(&cleanup_key, |state| state.generation == generation);
                    result
                }
                .boxed()
                .shared();
                state.flight = Some((flight.clone(), abort));
                flight
            })
            .boxed()
    }

    /// Cancels every pending call of `instance_id`; attached callers get `Cancelled`.
    pub(crate) fn cancel_instance(&self, instance_id: u64) {
        for state in self.table.drain_instance(instance_id) {
            if let Some((_, abort)) = state.flight {
                abort.abort();
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }
}

/// Marker recorded for fields declared with [`single_flight`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleFlightField;

/// Coalesces overlapping calls to a method.
pub fn single_flight(inner: impl Descriptor) -> impl Descriptor {
    descriptor(move |builder, name| {
        builder.options_mut::<SingleFlightField>().insert(name, SingleFlightField);
        inner.describe(builder, name)
    })
}

/// Plugin implementing [`single_flight`].
#[derive(Default)]
pub struct SingleFlightPlugin {
    flights: Arc<Flights>,
}

impl SingleFlightPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls currently in flight.
    pub fn pending_count(&self) -> usize {
        self.flights.len()
    }
}

impl Plugin for SingleFlightPlugin {
    fn name(&self) -> &'static str {
        "single_flight"
    }

    fn on_create(&self, definition: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        let fields = definition.options::<SingleFlightField>()?;
        for name in fields.names() {
            let flights = self.flights.clone();
            let method = name.clone();
            let wrapped = instance.wrap_method(&name, move |inner| {
                Method::from_boxed(move |this, args| {
                    let key: PendingKey = (this.id(), method.clone());
                    flights.join(key, || inner.call(this, args))
                })
            });
            if !wrapped {
                warn!(service = definition.identifier(), method = %name, "Single-flight declared on a field that is not a method");
            }
        }
        None
    }

    fn on_destroy(&self, _definition: &ServiceDefinition, instance: &ServiceInstance) {
        self.flights.cancel_instance(instance.id());
    }
}
