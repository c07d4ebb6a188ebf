//! Core traits for the service container.

mod plugin;

pub use plugin::{HookFuture, Plugin};
