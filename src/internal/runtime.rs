//! Spawning onto the ambient tokio runtime.

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{ServiceError, ServiceResult};

/// Spawns `future` on the current runtime.
///
/// Plugins schedule deferred work from synchronous call sites; without a
/// runtime there is nothing to drive it, so the caller gets
/// [`ServiceError::NoRuntime`] instead of a panic.
pub(crate) fn spawn<F>(what: &str, future: F) -> ServiceResult<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Handle::try_current()
        .map(|handle| handle.spawn(future))
        .map_err(|_| ServiceError::NoRuntime(what.to_string()))
}
