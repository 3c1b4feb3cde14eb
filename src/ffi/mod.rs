//! Raw bindings to the private LoggingSupport activity-stream API.
//!
//! Nothing here is linked at build time: the four entry points are resolved at
//! runtime by [`crate::resolver`] and stored as the typed function pointers
//! declared in [`types`].

/// Block literal passed as the stream callback.
pub mod block;
/// C layouts, constants and entry-point signatures.
#[allow(missing_docs)]
pub mod types;

pub use block::{StreamBlock, StreamBlockInvoke};
pub use types::{
    CopyFormattedMessageFn, OsActivityStreamEntry, OsActivityStreamT, OsLogMessage,
    StreamCancelFn, StreamForPidFn, StreamResumeFn,
};
