//! Runtime resolution of the private activity-stream entry points.
//!
//! The library is opened with immediate binding and the four symbols are
//! looked up by exact name with their C signatures spelled out in
//! [`crate::ffi::types`]. Resolution is all-or-nothing: a table is only
//! produced when every symbol is present.

use std::fmt;
use std::os::raw::c_char;
use std::path::Path;

use libloading::Library;
use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::ffi::block::StreamBlock;
use crate::ffi::types::{
    CopyFormattedMessageFn, OsActivityStreamFlag, OsActivityStreamT, OsLogMessage,
    StreamCancelFn, StreamForPidFn, StreamResumeFn,
};

/// Location of the private framework on macOS.
pub const LOGGING_SUPPORT_PATH: &str =
    "/System/Library/PrivateFrameworks/LoggingSupport.framework/LoggingSupport";

/// NUL-terminated name of `os_activity_stream_for_pid`.
pub const SYM_STREAM_FOR_PID: &[u8] = b"os_activity_stream_for_pid\0";
/// NUL-terminated name of `os_activity_stream_resume`.
pub const SYM_STREAM_RESUME: &[u8] = b"os_activity_stream_resume\0";
/// NUL-terminated name of `os_activity_stream_cancel`.
pub const SYM_STREAM_CANCEL: &[u8] = b"os_activity_stream_cancel\0";
/// NUL-terminated name of `os_log_copy_formatted_message`.
pub const SYM_COPY_FORMATTED_MESSAGE: &[u8] = b"os_log_copy_formatted_message\0";

/// Every symbol the bridge needs, in resolution order.
pub const REQUIRED_SYMBOLS: [&[u8]; 4] = [
    SYM_STREAM_FOR_PID,
    SYM_STREAM_RESUME,
    SYM_STREAM_CANCEL,
    SYM_COPY_FORMATTED_MESSAGE,
];

/// Printable form of a NUL-terminated symbol name.
#[must_use]
pub fn symbol_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned()
}

/// A source of typed symbols.
pub trait SymbolLookup {
    /// Looks up `name` (NUL-terminated) as a value of type `T`.
    ///
    /// # Safety
    /// `T` must be the exact type of the symbol, normally an
    /// `unsafe extern "C" fn` matching its C declaration.
    unsafe fn lookup<T: Copy + 'static>(&self, name: &[u8]) -> Result<T, ResolveError>;
}

impl SymbolLookup for Library {
    unsafe fn lookup<T: Copy + 'static>(&self, name: &[u8]) -> Result<T, ResolveError> {
        self.get::<T>(name)
            .map(|symbol| *symbol)
            .map_err(|e| ResolveError::SymbolMissing {
                symbol: symbol_name(name),
                message: e.to_string(),
            })
    }
}

/// The four resolved entry points.
///
/// Immutable once built and safe to read from any number of trampoline
/// invocations at once. A library it was resolved from is never unloaded.
pub struct ResolvedSymbols {
    stream_for_pid: StreamForPidFn,
    stream_resume: StreamResumeFn,
    stream_cancel: StreamCancelFn,
    copy_formatted_message: CopyFormattedMessageFn,
    library: Option<&'static Library>,
}

impl ResolvedSymbols {
    /// Builds a table from function pointers already present in the process.
    #[must_use]
    pub fn from_fns(
        stream_for_pid: StreamForPidFn,
        stream_resume: StreamResumeFn,
        stream_cancel: StreamCancelFn,
        copy_formatted_message: CopyFormattedMessageFn,
    ) -> Self {
        Self {
            stream_for_pid,
            stream_resume,
            stream_cancel,
            copy_formatted_message,
            library: None,
        }
    }

    /// Resolves all four symbols from `lookup`, failing on the first miss.
    ///
    /// # Safety
    /// The symbols found under the required names must have the C
    /// signatures declared in [`crate::ffi::types`].
    pub unsafe fn from_lookup<L: SymbolLookup + ?Sized>(lookup: &L) -> Result<Self, ResolveError> {
        Ok(Self::from_fns(
            lookup.lookup::<StreamForPidFn>(SYM_STREAM_FOR_PID)?,
            lookup.lookup::<StreamResumeFn>(SYM_STREAM_RESUME)?,
            lookup.lookup::<StreamCancelFn>(SYM_STREAM_CANCEL)?,
            lookup.lookup::<CopyFormattedMessageFn>(SYM_COPY_FORMATTED_MESSAGE)?,
        ))
    }

    pub(crate) unsafe fn stream_for_pid(
        &self,
        pid: libc::pid_t,
        flags: OsActivityStreamFlag,
        block: *mut StreamBlock,
    ) -> OsActivityStreamT {
        (self.stream_for_pid)(pid, flags, block)
    }

    pub(crate) unsafe fn stream_resume(&self, stream: OsActivityStreamT) {
        (self.stream_resume)(stream);
    }

    pub(crate) unsafe fn stream_cancel(&self, stream: OsActivityStreamT) {
        (self.stream_cancel)(stream);
    }

    pub(crate) unsafe fn copy_formatted_message(&self, message: *mut OsLogMessage) -> *mut c_char {
        (self.copy_formatted_message)(message)
    }

    /// Whether the entry points came from a dynamically loaded library.
    #[must_use]
    pub fn is_library_backed(&self) -> bool {
        self.library.is_some()
    }
}

impl fmt::Debug for ResolvedSymbols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSymbols")
            .field("library_backed", &self.is_library_backed())
            .finish_non_exhaustive()
    }
}

/// Loads the logging library and resolves the symbol table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolResolver;

impl SymbolResolver {
    /// Resolves from the system LoggingSupport framework.
    pub fn resolve_default() -> Result<ResolvedSymbols, ResolveError> {
        Self::resolve(LOGGING_SUPPORT_PATH)
    }

    /// Opens `path` with immediate binding and resolves the four symbols.
    ///
    /// # Errors
    /// - `ResolveError::LibraryUnavailable` if the library cannot be loaded
    /// - `ResolveError::SymbolMissing` if any required symbol is absent
    pub fn resolve(path: impl AsRef<Path>) -> Result<ResolvedSymbols, ResolveError> {
        let path = path.as_ref();
        let library = open_now(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "logging library unavailable");
            ResolveError::LibraryUnavailable {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        // SAFETY: the signatures in ffi::types match ActivityStreamSPI.h.
        let mut symbols = unsafe { ResolvedSymbols::from_lookup(&library) }.map_err(|e| {
            warn!(path = %path.display(), error = %e, "activity stream symbol missing");
            e
        })?;
        // Never dlclose: a cancelled stream may still be draining on the
        // framework's own queue.
        symbols.library = Some(Box::leak(Box::new(library)));

        debug!(path = %path.display(), "resolved activity stream symbols");
        Ok(symbols)
    }
}

#[cfg(unix)]
fn open_now(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_NOW};

    // SAFETY: loading runs the library's initialisers; system libraries only.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_now(path: &Path) -> Result<Library, libloading::Error> {
    // SAFETY: as above.
    unsafe { Library::new(path) }
}
