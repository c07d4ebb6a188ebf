//! Internal implementation details.

pub(crate) mod pending;
pub(crate) mod runtime;

pub(crate) use pending::{PendingKey, PendingTable};
pub(crate) use runtime::spawn;
