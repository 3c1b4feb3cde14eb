//! C layouts and signatures of the private activity-stream API.
//!
//! These mirror `ActivityStreamSPI.h` as shipped with LLDB's debugserver.
//! Only the log-message arm of the entry payload is declared; the other arms
//! (activity create/transition) are never read.

use std::os::raw::{c_char, c_int};

use libc::{pid_t, timeval};

use super::block::StreamBlock;

/// Opaque native stream object.
#[repr(C)]
pub struct OsActivityStream {
    _private: [u8; 0],
}

/// Raw native stream handle.
pub type OsActivityStreamT = *mut OsActivityStream;

/// `os_activity_stream_flag_t`.
pub type OsActivityStreamFlag = u32;

/// `os_activity_stream_type_t`.
pub type OsActivityStreamType = u32;

/// `os_activity_id_t`.
pub type OsActivityId = u64;

pub const OS_ACTIVITY_STREAM_PROCESS_ONLY: OsActivityStreamFlag = 0x0000_0001;
pub const OS_ACTIVITY_STREAM_SKIP_DECODE: OsActivityStreamFlag = 0x0000_0002;
pub const OS_ACTIVITY_STREAM_PAYLOAD: OsActivityStreamFlag = 0x0000_0004;
pub const OS_ACTIVITY_STREAM_HISTORICAL: OsActivityStreamFlag = 0x0000_0008;
pub const OS_ACTIVITY_STREAM_CALLSTACK: OsActivityStreamFlag = 0x0000_0010;
pub const OS_ACTIVITY_STREAM_DEBUG: OsActivityStreamFlag = 0x0000_0020;
pub const OS_ACTIVITY_STREAM_BUFFERED: OsActivityStreamFlag = 0x0000_0040;
pub const OS_ACTIVITY_STREAM_NO_SENSITIVE: OsActivityStreamFlag = 0x0000_0080;
pub const OS_ACTIVITY_STREAM_INFO: OsActivityStreamFlag = 0x0000_0100;

pub const OS_ACTIVITY_STREAM_TYPE_ACTIVITY_CREATE: OsActivityStreamType = 0x0201;
pub const OS_ACTIVITY_STREAM_TYPE_ACTIVITY_TRANSITION: OsActivityStreamType = 0x0202;
pub const OS_ACTIVITY_STREAM_TYPE_ACTIVITY_USERACTION: OsActivityStreamType = 0x0203;
pub const OS_ACTIVITY_STREAM_TYPE_TRACE_MESSAGE: OsActivityStreamType = 0x0300;
pub const OS_ACTIVITY_STREAM_TYPE_LOG_MESSAGE: OsActivityStreamType = 0x0400;
pub const OS_ACTIVITY_STREAM_TYPE_LEGACY_LOG_MESSAGE: OsActivityStreamType = 0x0480;
pub const OS_ACTIVITY_STREAM_TYPE_SIGNPOST_BEGIN: OsActivityStreamType = 0x0601;
pub const OS_ACTIVITY_STREAM_TYPE_SIGNPOST_END: OsActivityStreamType = 0x0602;
pub const OS_ACTIVITY_STREAM_TYPE_SIGNPOST_EVENT: OsActivityStreamType = 0x0603;
pub const OS_ACTIVITY_STREAM_TYPE_STATEDUMP_EVENT: OsActivityStreamType = 0x0A00;

/// `struct timezone`; libc does not expose a portable definition.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeZone {
    pub tz_minuteswest: c_int,
    pub tz_dsttime: c_int,
}

/// `struct os_log_message_s`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OsLogMessage {
    pub trace_id: u64,
    pub padding: u64,
    pub activity_id: OsActivityId,
    pub format: *const c_char,
    pub buffer: *const u8,
    pub buffer_sz: usize,
    pub privdata: *const u8,
    pub privdata_sz: usize,
    pub subsystem: *const c_char,
    pub category: *const c_char,
    pub tv_gmt: timeval,
    pub tz: TimeZone,
}

/// `struct os_activity_stream_entry_s`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OsActivityStreamEntry {
    pub kind: OsActivityStreamType,
    pub pid: pid_t,
    pub proc_id: u64,
    pub proc_imageuuid: *const u8,
    pub proc_imagepath: *const c_char,
    pub activity_id: OsActivityId,
    pub parent_id: OsActivityId,
    pub log_message: OsLogMessage,
}

/// `os_activity_stream_for_pid(pid, flags, block)`.
pub type StreamForPidFn =
    unsafe extern "C" fn(pid_t, OsActivityStreamFlag, *mut StreamBlock) -> OsActivityStreamT;

/// `os_activity_stream_resume(stream)`.
pub type StreamResumeFn = unsafe extern "C" fn(OsActivityStreamT);

/// `os_activity_stream_cancel(stream)`.
pub type StreamCancelFn = unsafe extern "C" fn(OsActivityStreamT);

/// `os_log_copy_formatted_message(msg)`; the result is `malloc`ed.
pub type CopyFormattedMessageFn = unsafe extern "C" fn(*mut OsLogMessage) -> *mut c_char;
