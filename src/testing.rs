//! In-process stand-in for the LoggingSupport activity-stream API.
//!
//! The four entry points are plain `extern "C"` functions with the same
//! signatures as the private ones, so the stream manager, trampoline and
//! decoder run unmodified against them. The fake behaves like the native
//! side in the ways the bridge depends on:
//!
//! - the callback block is copied to the heap on open and released on cancel
//!   or when the callback returns `false`
//! - with `HISTORICAL`, records emitted before resume are buffered and
//!   delivered, in order, on resume; without it they are dropped
//! - cancellation is synchronous: once `cancel` returns the block is gone
//!
//! Streams are addressed by process id. Use [`FakeActivitySystem::unique_pid`]
//! so concurrently running tests never share one.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use libc::pid_t;

use crate::error::ResolveError;
use crate::ffi::block::StreamBlock;
use crate::ffi::types::{
    CopyFormattedMessageFn, OsActivityStream, OsActivityStreamEntry, OsActivityStreamFlag,
    OsActivityStreamT, OsActivityStreamType, OsLogMessage, StreamCancelFn, StreamForPidFn,
    StreamResumeFn, TimeZone, OS_ACTIVITY_STREAM_HISTORICAL,
    OS_ACTIVITY_STREAM_TYPE_LEGACY_LOG_MESSAGE, OS_ACTIVITY_STREAM_TYPE_LOG_MESSAGE,
};
use crate::resolver::{
    symbol_name, ResolvedSymbols, SymbolLookup, SYM_COPY_FORMATTED_MESSAGE, SYM_STREAM_CANCEL,
    SYM_STREAM_FOR_PID, SYM_STREAM_RESUME,
};

/// A record to push through a fake stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRecord {
    kind: OsActivityStreamType,
    text: Option<Vec<u8>>,
    secs: i64,
    error: c_int,
}

impl FakeRecord {
    /// A current-format log message.
    #[must_use]
    pub fn log(text: &str, secs: i64) -> Self {
        Self {
            kind: OS_ACTIVITY_STREAM_TYPE_LOG_MESSAGE,
            text: Some(text.as_bytes().to_vec()),
            secs,
            error: 0,
        }
    }

    /// A legacy (NSLog/ASL) log message.
    #[must_use]
    pub fn legacy(text: &str, secs: i64) -> Self {
        Self {
            kind: OS_ACTIVITY_STREAM_TYPE_LEGACY_LOG_MESSAGE,
            ..Self::log(text, secs)
        }
    }

    /// A log message whose formatted text cannot be produced.
    #[must_use]
    pub fn undecodable(secs: i64) -> Self {
        Self {
            text: None,
            ..Self::log("", secs)
        }
    }

    /// A log message with arbitrary (possibly non-UTF-8) bytes.
    ///
    /// Interior NUL bytes truncate the text.
    #[must_use]
    pub fn raw_bytes(mut bytes: Vec<u8>, secs: i64) -> Self {
        if let Some(nul) = bytes.iter().position(|b| *b == 0) {
            bytes.truncate(nul);
        }
        Self {
            text: Some(bytes),
            ..Self::log("", secs)
        }
    }

    /// Overrides the record type.
    #[must_use]
    pub fn with_kind(mut self, kind: OsActivityStreamType) -> Self {
        self.kind = kind;
        self
    }

    /// Delivers the record with a non-zero native error code.
    #[must_use]
    pub fn with_error(mut self, error: c_int) -> Self {
        self.error = error;
        self
    }

    /// Native error code passed alongside the record.
    #[must_use]
    pub const fn error(&self) -> c_int {
        self.error
    }

    /// Lays the record out as a native entry for the duration of `f`.
    pub fn with_entry<R>(&self, f: impl FnOnce(&OsActivityStreamEntry) -> R) -> R {
        self.with_entry_mut(|entry| f(entry))
    }

    /// Mutable variant of [`FakeRecord::with_entry`].
    pub fn with_entry_mut<R>(&self, f: impl FnOnce(&mut OsActivityStreamEntry) -> R) -> R {
        let text = self
            .text
            .as_ref()
            .map(|bytes| CString::new(bytes.clone()).unwrap_or_default());

        let mut entry = OsActivityStreamEntry {
            kind: self.kind,
            pid: 0,
            proc_id: 0,
            proc_imageuuid: ptr::null(),
            proc_imagepath: ptr::null(),
            activity_id: 0,
            parent_id: 0,
            log_message: OsLogMessage {
                trace_id: 0,
                padding: 0,
                activity_id: 0,
                format: text.as_ref().map_or(ptr::null(), |t| t.as_ptr()),
                buffer: ptr::null(),
                buffer_sz: 0,
                privdata: ptr::null(),
                privdata_sz: 0,
                subsystem: ptr::null(),
                category: ptr::null(),
                tv_gmt: libc::timeval {
                    tv_sec: self.secs as libc::time_t,
                    tv_usec: 0,
                },
                tz: TimeZone::default(),
            },
        };
        f(&mut entry)
    }
}

/// What happened to an emitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Passed to the callback, which asked to continue.
    Delivered,
    /// Passed to the callback, which asked to stop.
    Stopped,
    /// Held until the stream is resumed.
    Buffered,
    /// No live stream to take it.
    Dropped,
}

/// Observable state of the latest fake stream for a pid.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeStreamStats {
    /// Streams ever opened for the pid.
    pub streams_opened: usize,
    /// Cancel calls across all of the pid's streams.
    pub cancel_calls: u32,
    pub flags: OsActivityStreamFlag,
    pub resume_calls: u32,
    pub resumed: bool,
    pub cancelled: bool,
    /// The callback returned `false`.
    pub stopped: bool,
    /// The heap copy of the callback block is still held.
    pub block_live: bool,
    /// Callback invocations.
    pub invocations: u64,
    pub pending: usize,
}

struct HeapBlock(*mut StreamBlock);

// SAFETY: the block is only invoked and released under the registry lock.
unsafe impl Send for HeapBlock {}

struct FakeStream {
    pid: pid_t,
    flags: OsActivityStreamFlag,
    block: Option<HeapBlock>,
    resumed: bool,
    resume_calls: u32,
    cancelled: bool,
    cancel_calls: u32,
    stopped: bool,
    invocations: u64,
    pending: VecDeque<FakeRecord>,
}

impl FakeStream {
    fn deliver(&mut self, record: &FakeRecord) -> bool {
        let Some(block) = self.block.as_ref() else {
            return false;
        };
        let block = block.0;
        // SAFETY: the heap block stays alive until release_block.
        let keep = record.with_entry_mut(|entry| unsafe {
            StreamBlock::invoke(block, entry, record.error)
        });
        self.invocations += 1;
        if !keep {
            self.stopped = true;
            self.pending.clear();
            self.release_block();
        }
        keep
    }

    fn release_block(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: made by copy_to_heap in fake_stream_for_pid, released once.
            unsafe { StreamBlock::release_heap(block.0) };
        }
    }
}

#[derive(Default)]
struct Registry {
    next_handle: usize,
    streams: HashMap<usize, FakeStream>,
    refused: HashSet<pid_t>,
}

impl Registry {
    fn latest_for_pid(&mut self, pid: pid_t) -> Option<&mut FakeStream> {
        let handle = self
            .streams
            .iter()
            .filter(|(_, s)| s.pid == pid)
            .map(|(h, _)| *h)
            .max()?;
        self.streams.get_mut(&handle)
    }
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(Registry::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn handle_to_ptr(handle: usize) -> OsActivityStreamT {
    (handle << 4) as *mut OsActivityStream
}

fn ptr_to_handle(stream: OsActivityStreamT) -> usize {
    (stream as usize) >> 4
}

unsafe extern "C" fn fake_stream_for_pid(
    pid: pid_t,
    flags: OsActivityStreamFlag,
    block: *mut StreamBlock,
) -> OsActivityStreamT {
    let mut reg = registry();
    if block.is_null() || reg.refused.contains(&pid) {
        return ptr::null_mut();
    }

    reg.next_handle += 1;
    let handle = reg.next_handle;
    let heap = StreamBlock::copy_to_heap(block);
    reg.streams.insert(
        handle,
        FakeStream {
            pid,
            flags,
            block: Some(HeapBlock(heap)),
            resumed: false,
            resume_calls: 0,
            cancelled: false,
            cancel_calls: 0,
            stopped: false,
            invocations: 0,
            pending: VecDeque::new(),
        },
    );
    handle_to_ptr(handle)
}

unsafe extern "C" fn fake_stream_resume(stream: OsActivityStreamT) {
    let mut reg = registry();
    let Some(s) = reg.streams.get_mut(&ptr_to_handle(stream)) else {
        return;
    };
    s.resume_calls += 1;
    if s.resumed || s.cancelled || s.stopped {
        return;
    }
    s.resumed = true;
    while let Some(record) = s.pending.pop_front() {
        if !s.deliver(&record) {
            break;
        }
    }
}

unsafe extern "C" fn fake_stream_cancel(stream: OsActivityStreamT) {
    let mut reg = registry();
    if let Some(s) = reg.streams.get_mut(&ptr_to_handle(stream)) {
        s.cancel_calls += 1;
        s.cancelled = true;
        s.pending.clear();
        s.release_block();
    }
}

unsafe extern "C" fn fake_copy_formatted_message(message: *mut OsLogMessage) -> *mut c_char {
    if message.is_null() || (*message).format.is_null() {
        return ptr::null_mut();
    }
    libc::strdup((*message).format)
}

/// Control surface of the fake logging system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeActivitySystem;

impl FakeActivitySystem {
    /// Symbol table pointing at the fake entry points.
    #[must_use]
    pub fn symbols() -> ResolvedSymbols {
        ResolvedSymbols::from_fns(
            fake_stream_for_pid,
            fake_stream_resume,
            fake_stream_cancel,
            fake_copy_formatted_message,
        )
    }

    /// A pid no other caller of this function has received.
    #[must_use]
    pub fn unique_pid() -> i32 {
        static NEXT: AtomicI32 = AtomicI32::new(100_000);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes stream creation for `pid` return null while `refuse` is set.
    pub fn refuse(pid: i32, refuse: bool) {
        let mut reg = registry();
        if refuse {
            reg.refused.insert(pid);
        } else {
            reg.refused.remove(&pid);
        }
    }

    /// Pushes a record into the latest stream opened for `pid`.
    ///
    /// Delivery happens synchronously on the calling thread.
    pub fn emit(pid: i32, record: FakeRecord) -> EmitOutcome {
        let mut reg = registry();
        let Some(s) = reg.latest_for_pid(pid) else {
            return EmitOutcome::Dropped;
        };
        if s.cancelled || s.stopped {
            return EmitOutcome::Dropped;
        }
        if !s.resumed {
            if s.flags & OS_ACTIVITY_STREAM_HISTORICAL == 0 {
                return EmitOutcome::Dropped;
            }
            s.pending.push_back(record);
            return EmitOutcome::Buffered;
        }
        if s.deliver(&record) {
            EmitOutcome::Delivered
        } else {
            EmitOutcome::Stopped
        }
    }

    /// State of the latest stream for `pid`, if any was opened.
    #[must_use]
    pub fn stats(pid: i32) -> Option<FakeStreamStats> {
        let mut reg = registry();
        let streams_opened = reg.streams.values().filter(|s| s.pid == pid).count();
        let cancel_calls = reg
            .streams
            .values()
            .filter(|s| s.pid == pid)
            .map(|s| s.cancel_calls)
            .sum();
        let s = reg.latest_for_pid(pid)?;
        Some(FakeStreamStats {
            streams_opened,
            cancel_calls,
            flags: s.flags,
            resume_calls: s.resume_calls,
            resumed: s.resumed,
            cancelled: s.cancelled,
            stopped: s.stopped,
            block_live: s.block.is_some(),
            invocations: s.invocations,
            pending: s.pending.len(),
        })
    }
}

/// A symbol source exporting the fake entry points, optionally minus one.
pub struct FakeLibrary {
    symbols: HashMap<&'static [u8], Box<dyn Any + Send + Sync>>,
}

impl FakeLibrary {
    /// Exports all four entry points.
    #[must_use]
    pub fn complete() -> Self {
        let mut symbols: HashMap<&'static [u8], Box<dyn Any + Send + Sync>> = HashMap::new();
        symbols.insert(SYM_STREAM_FOR_PID, Box::new(fake_stream_for_pid as StreamForPidFn));
        symbols.insert(SYM_STREAM_RESUME, Box::new(fake_stream_resume as StreamResumeFn));
        symbols.insert(SYM_STREAM_CANCEL, Box::new(fake_stream_cancel as StreamCancelFn));
        symbols.insert(
            SYM_COPY_FORMATTED_MESSAGE,
            Box::new(fake_copy_formatted_message as CopyFormattedMessageFn),
        );
        Self { symbols }
    }

    /// Exports everything except `name`.
    #[must_use]
    pub fn without(name: &[u8]) -> Self {
        let mut lib = Self::complete();
        lib.symbols.retain(|k, _| *k != name);
        lib
    }
}

impl SymbolLookup for FakeLibrary {
    unsafe fn lookup<T: Copy + 'static>(&self, name: &[u8]) -> Result<T, ResolveError> {
        self.symbols
            .get(name)
            .and_then(|symbol| symbol.downcast_ref::<T>())
            .copied()
            .ok_or_else(|| ResolveError::SymbolMissing {
                symbol: symbol_name(name),
                message: "not exported".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_stream_is_dropped() {
        let pid = FakeActivitySystem::unique_pid();
        assert_eq!(FakeActivitySystem::emit(pid, FakeRecord::log("x", 1)), EmitOutcome::Dropped);
        assert!(FakeActivitySystem::stats(pid).is_none());
    }

    #[test]
    fn test_copy_formatted_message_duplicates_format() {
        let record = FakeRecord::log("dup me", 1);
        let text = record.with_entry_mut(|entry| unsafe {
            let raw = fake_copy_formatted_message(&mut entry.log_message);
            assert!(!raw.is_null());
            let text = std::ffi::CStr::from_ptr(raw).to_str().unwrap().to_string();
            libc::free(raw.cast());
            text
        });
        assert_eq!(text, "dup me");
    }

    #[test]
    fn test_raw_bytes_truncates_at_nul() {
        let record = FakeRecord::raw_bytes(vec![b'a', 0, b'b'], 1);
        assert_eq!(record.text.as_deref(), Some(&b"a"[..]));
    }

    #[test]
    fn test_wrong_signature_is_missing() {
        let lib = FakeLibrary::complete();
        let result = unsafe { lib.lookup::<StreamResumeFn>(SYM_STREAM_FOR_PID) };
        assert!(result.is_err());
    }
}
