//! Stream handle management.
//!
//! [`ActivityStream`] owns the native handle and its state machine; the
//! trampoline module holds the callback the native side invokes per record.

/// Handle lifecycle.
pub mod manager;
/// Per-record native callback.
pub(crate) mod trampoline;

pub use manager::{ActivityStream, StreamState};
