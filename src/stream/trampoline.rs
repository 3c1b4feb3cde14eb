//! Native-side callback: decode each record and forward it to the sink.

use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::DecodeFailurePolicy;
use crate::decoder::{decode_entry, Decoded};
use crate::dispatch::MessageSink;
use crate::ffi::block::StreamBlock;
use crate::ffi::types::OsActivityStreamEntry;
use crate::message::StreamId;
use crate::resolver::ResolvedSymbols;

/// State the trampoline needs for one stream.
///
/// Owned by the stream manager; the native block only holds a `Weak` to it.
pub(crate) struct TrampolineContext {
    stream_id: StreamId,
    symbols: Arc<ResolvedSymbols>,
    sink: Arc<dyn MessageSink>,
    policy: DecodeFailurePolicy,
    active: AtomicBool,
    forwarded: AtomicU64,
}

impl TrampolineContext {
    pub(crate) fn new(
        stream_id: StreamId,
        symbols: Arc<ResolvedSymbols>,
        sink: Arc<dyn MessageSink>,
        policy: DecodeFailurePolicy,
    ) -> Self {
        Self {
            stream_id,
            symbols,
            sink,
            policy,
            active: AtomicBool::new(true),
            forwarded: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Stops forwarding and closes the sink.
    pub(crate) fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        self.sink.close();
    }

    /// Handles one record; the return value is the native continue flag.
    fn handle(&self, entry: &OsActivityStreamEntry) -> bool {
        if !self.is_active() {
            return false;
        }

        // SAFETY: the entry is borrowed from the native callback for this call.
        match unsafe { decode_entry(&self.symbols, entry) } {
            Decoded::Ignored => true,
            Decoded::Message(message) => match self.sink.deliver(message) {
                Ok(()) => {
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(e) => {
                    debug!(stream_id = %self.stream_id, error = %e, "sink gone, stopping stream");
                    self.active.store(false, Ordering::Release);
                    false
                }
            },
            Decoded::Failed => match self.policy {
                DecodeFailurePolicy::StopStream => {
                    warn!(
                        stream_id = %self.stream_id,
                        pid = entry.pid,
                        "formatted message unavailable, stopping stream"
                    );
                    self.active.store(false, Ordering::Release);
                    false
                }
                DecodeFailurePolicy::SkipRecord => {
                    warn!(
                        stream_id = %self.stream_id,
                        pid = entry.pid,
                        "formatted message unavailable, skipping record"
                    );
                    true
                }
            },
        }
    }
}

/// Invoke function installed in every [`StreamBlock`].
pub(crate) unsafe extern "C" fn stream_entry_trampoline(
    block: *mut StreamBlock,
    entry: *mut OsActivityStreamEntry,
    error: c_int,
) -> bool {
    let Some(context) = StreamBlock::upgrade_context(block) else {
        return false;
    };

    if error != 0 {
        debug!(stream_id = %context.stream_id, error, "activity stream reported an error");
        context.active.store(false, Ordering::Release);
        return false;
    }

    let Some(entry) = entry.as_ref() else {
        return false;
    };

    // Unwinding across the native frame is not allowed.
    panic::catch_unwind(AssertUnwindSafe(|| context.handle(entry))).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::Mutex;

    use super::*;
    use crate::dispatch::{DeliveryQueue, DispatchBridge};
    use crate::ffi::types::OS_ACTIVITY_STREAM_TYPE_TRACE_MESSAGE;
    use crate::message::LogMessage;
    use crate::testing::{FakeActivitySystem, FakeRecord};

    type Harness = (
        Arc<TrampolineContext>,
        StreamBlock,
        Arc<Mutex<Vec<LogMessage>>>,
        DeliveryQueue,
    );

    fn setup(policy: DecodeFailurePolicy) -> Harness {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (bridge, queue) = DispatchBridge::channel(move |m| sink.lock().unwrap().push(m));
        let ctx = Arc::new(TrampolineContext::new(
            StreamId::new(),
            Arc::new(FakeActivitySystem::symbols()),
            Arc::new(bridge),
            policy,
        ));
        let block = StreamBlock::new(Arc::downgrade(&ctx), stream_entry_trampoline);
        (ctx, block, seen, queue)
    }

    fn fire(block: &mut StreamBlock, record: &FakeRecord) -> bool {
        record.with_entry_mut(|entry| unsafe { StreamBlock::invoke(block, entry, record.error()) })
    }

    #[test]
    fn test_forwards_and_continues() {
        let (ctx, mut block, seen, mut queue) = setup(DecodeFailurePolicy::StopStream);
        assert!(fire(&mut block, &FakeRecord::log("one", 1)));
        assert!(fire(&mut block, &FakeRecord::log("two", 2)));
        assert_eq!(ctx.forwarded(), 2);
        queue.drain();
        let texts: Vec<_> = seen.lock().unwrap().iter().map(|m| m.text.clone()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn test_ignored_record_continues() {
        let (ctx, mut block, _seen, _queue) = setup(DecodeFailurePolicy::StopStream);
        let record = FakeRecord::log("x", 1).with_kind(OS_ACTIVITY_STREAM_TYPE_TRACE_MESSAGE);
        assert!(fire(&mut block, &record));
        assert_eq!(ctx.forwarded(), 0);
    }

    #[test]
    fn test_decode_failure_stops() {
        let (ctx, mut block, _seen, _queue) = setup(DecodeFailurePolicy::StopStream);
        assert!(!fire(&mut block, &FakeRecord::undecodable(1)));
        assert!(!ctx.is_active());
        assert!(!fire(&mut block, &FakeRecord::log("after", 2)));
        assert_eq!(ctx.forwarded(), 0);
    }

    #[test]
    fn test_decode_failure_skips_under_skip_policy() {
        let (ctx, mut block, _seen, _queue) = setup(DecodeFailurePolicy::SkipRecord);
        assert!(fire(&mut block, &FakeRecord::undecodable(1)));
        assert!(fire(&mut block, &FakeRecord::log("after", 2)));
        assert_eq!(ctx.forwarded(), 1);
    }

    #[test]
    fn test_native_error_stops() {
        let (ctx, mut block, _seen, _queue) = setup(DecodeFailurePolicy::StopStream);
        assert!(!fire(&mut block, &FakeRecord::log("x", 1).with_error(5)));
        assert!(!ctx.is_active());
    }

    #[test]
    fn test_null_entry_stops() {
        let (_ctx, mut block, _seen, _queue) = setup(DecodeFailurePolicy::StopStream);
        assert!(!unsafe { StreamBlock::invoke(&mut block, ptr::null_mut(), 0) });
    }

    #[test]
    fn test_dropped_owner_stops() {
        let (ctx, mut block, _seen, _queue) = setup(DecodeFailurePolicy::StopStream);
        drop(ctx);
        assert!(!fire(&mut block, &FakeRecord::log("late", 1)));
    }

    #[test]
    fn test_dead_sink_stops() {
        let (ctx, mut block, _seen, queue) = setup(DecodeFailurePolicy::StopStream);
        drop(queue);
        assert!(!fire(&mut block, &FakeRecord::log("nobody", 1)));
        assert!(!ctx.is_active());
    }
}
