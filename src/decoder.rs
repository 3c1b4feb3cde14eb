//! Decoding of native activity-stream records into [`LogMessage`]s.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr::NonNull;

use crate::ffi::types::{
    OsActivityStreamEntry, OsActivityStreamType, OS_ACTIVITY_STREAM_TYPE_LEGACY_LOG_MESSAGE,
    OS_ACTIVITY_STREAM_TYPE_LOG_MESSAGE,
};
use crate::message::LogMessage;
use crate::resolver::ResolvedSymbols;

/// Outcome of decoding one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Not a log message (activity, signpost, statedump ...).
    Ignored,
    /// A log message.
    Message(LogMessage),
    /// A log message whose formatted text could not be extracted.
    Failed,
}

/// True for the current and legacy log-message record types.
#[must_use]
pub const fn is_log_message(kind: OsActivityStreamType) -> bool {
    kind == OS_ACTIVITY_STREAM_TYPE_LOG_MESSAGE
        || kind == OS_ACTIVITY_STREAM_TYPE_LEGACY_LOG_MESSAGE
}

/// `malloc`ed C string returned by `os_log_copy_formatted_message`.
struct NativeText(NonNull<c_char>);

impl NativeText {
    fn from_raw(raw: *mut c_char) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    /// UTF-8 contents, or an empty string for anything else.
    fn to_text(&self) -> String {
        // SAFETY: non-null and NUL-terminated per the API contract.
        let bytes = unsafe { CStr::from_ptr(self.0.as_ptr()) };
        bytes.to_str().map(str::to_owned).unwrap_or_default()
    }
}

impl Drop for NativeText {
    fn drop(&mut self) {
        // SAFETY: the buffer was allocated with malloc by the logging library.
        unsafe { libc::free(self.0.as_ptr().cast()) };
    }
}

/// Decodes one borrowed record.
///
/// # Safety
/// `entry` must be a record handed to the stream callback by the native
/// system (or laid out identically), valid for the duration of the call.
pub unsafe fn decode_entry(symbols: &ResolvedSymbols, entry: &OsActivityStreamEntry) -> Decoded {
    if !is_log_message(entry.kind) {
        return Decoded::Ignored;
    }

    let mut log_message = entry.log_message;
    let Some(text) = NativeText::from_raw(symbols.copy_formatted_message(&mut log_message)) else {
        return Decoded::Failed;
    };
    let text = text.to_text();

    let secs = i64::from(log_message.tv_gmt.tv_sec);
    Decoded::Message(LogMessage::new(text, LogMessage::timestamp_from_secs(secs)))
}
