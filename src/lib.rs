//! # oslog-stream - live unified-log activity stream bridge
//!
//! Receives the current process's unified-log messages in near-real-time by
//! tapping the private `LoggingSupport` activity-stream API, which the public
//! `OSLogStore` does not expose.
//!
//! ## Core Concepts
//!
//! - **Symbol resolution**: the private entry points are loaded at runtime into
//!   a typed [`ResolvedSymbols`] table; nothing links against the framework
//! - **Activity stream**: [`ActivityStream`] owns one native stream handle
//!   through `open → resume → close`
//! - **Trampoline**: a block literal the native side calls per record; it
//!   decodes the record and hands the [`LogMessage`] off
//! - **Dispatch bridge**: [`DispatchBridge`] moves messages onto the
//!   consumer's delivery context, in order, without blocking the trampoline
//!
//! ## Usage
//!
//! ```rust,ignore
//! use oslog_stream::{LogStreamHost, StreamConfig};
//!
//! let mut host = LogStreamHost::new(StreamConfig::default());
//! host.setup(|msg| println!("Log Handler: {msg}"))?;
//! // ... later, tied to the owning component's lifecycle:
//! host.teardown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod message;

// Native bridge
pub mod decoder;
pub mod dispatch;
pub mod ffi;
pub mod resolver;
pub mod stream;

// Lifecycle and test support
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{DecodeFailurePolicy, StreamConfig, StreamFlags};
pub use decoder::Decoded;
pub use dispatch::{DeliveryQueue, DispatchBridge, MessageSink};
pub use error::{DispatchError, LogStreamError, LogStreamResult, ResolveError, StreamError};
pub use message::{LogMessage, StreamId};
pub use resolver::{ResolvedSymbols, SymbolLookup, SymbolResolver, LOGGING_SUPPORT_PATH};
pub use session::{LogStream, LogStreamHost};
pub use stream::{ActivityStream, StreamState};
