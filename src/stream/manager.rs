//! Lifecycle of one native activity stream.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{DecodeFailurePolicy, StreamFlags};
use crate::dispatch::MessageSink;
use crate::error::{LogStreamResult, StreamError};
use crate::ffi::block::StreamBlock;
use crate::ffi::types::OsActivityStream;
use crate::message::StreamId;
use crate::resolver::ResolvedSymbols;

use super::trampoline::{stream_entry_trampoline, TrampolineContext};

/// Where a stream manager is in its lifecycle.
///
/// `Uninitialized → Opened → Resumed → Cancelled`, with `Opened → Cancelled`
/// also allowed. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Nothing opened yet.
    Uninitialized,
    /// Native stream created, delivery not started.
    Opened,
    /// Delivery started.
    Resumed,
    /// Cancelled; the manager cannot be reused.
    Cancelled,
}

/// Owned native stream pointer.
struct NativeStream(NonNull<OsActivityStream>);

// SAFETY: the native stream object may be resumed and cancelled from any thread.
unsafe impl Send for NativeStream {}

/// Owns at most one native activity stream.
///
/// All transitions take `&mut self`, so they happen on the single context that
/// owns the manager; only message delivery crosses threads. Dropping the
/// manager cancels the stream.
pub struct ActivityStream {
    symbols: Arc<ResolvedSymbols>,
    policy: DecodeFailurePolicy,
    state: StreamState,
    id: Option<StreamId>,
    handle: Option<NativeStream>,
    context: Option<Arc<TrampolineContext>>,
}

impl ActivityStream {
    /// Creates a manager over a resolved symbol table.
    #[must_use]
    pub fn new(symbols: Arc<ResolvedSymbols>) -> Self {
        Self {
            symbols,
            policy: DecodeFailurePolicy::default(),
            state: StreamState::Uninitialized,
            id: None,
            handle: None,
            context: None,
        }
    }

    /// Sets the reaction to undecodable records for streams opened afterwards.
    #[must_use]
    pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Opens a stream for `pid`, forwarding decoded messages to `sink`.
    ///
    /// While a stream is already open this is a no-op returning its id.
    ///
    /// # Errors
    /// - `StreamError::CreationFailed` if the native call returns null
    /// - `StreamError::Cancelled` if this manager was already closed
    pub fn open(
        &mut self,
        pid: i32,
        flags: StreamFlags,
        sink: Arc<dyn MessageSink>,
    ) -> LogStreamResult<StreamId> {
        match (self.state, self.id) {
            (StreamState::Opened | StreamState::Resumed, Some(id)) => {
                debug!(stream_id = %id, pid, "activity stream already open");
                return Ok(id);
            }
            (StreamState::Cancelled, id) => return Err(StreamError::Cancelled { id }.into()),
            _ => {}
        }

        let id = StreamId::new();
        let context = Arc::new(TrampolineContext::new(
            id,
            Arc::clone(&self.symbols),
            sink,
            self.policy,
        ));

        let mut block = StreamBlock::new(Arc::downgrade(&context), stream_entry_trampoline);
        // SAFETY: the block is valid for the call; the native side copies it.
        let raw = unsafe { self.symbols.stream_for_pid(pid, flags.bits(), &mut block) };
        drop(block);

        let Some(handle) = NonNull::new(raw) else {
            warn!(pid, flags = flags.bits(), "activity stream creation returned null");
            return Err(StreamError::CreationFailed { pid }.into());
        };

        self.handle = Some(NativeStream(handle));
        self.context = Some(context);
        self.id = Some(id);
        self.state = StreamState::Opened;
        debug!(stream_id = %id, pid, flags = flags.bits(), "activity stream opened");
        Ok(id)
    }

    /// Starts delivery. Resuming an already resumed stream is a no-op.
    ///
    /// # Errors
    /// - `StreamError::NotOpened` before a successful `open`
    /// - `StreamError::Cancelled` after `close`
    pub fn resume(&mut self) -> LogStreamResult<()> {
        match self.state {
            StreamState::Uninitialized => Err(StreamError::NotOpened.into()),
            StreamState::Cancelled => Err(StreamError::Cancelled { id: self.id }.into()),
            StreamState::Resumed => Ok(()),
            StreamState::Opened => {
                let Some(handle) = self.handle.as_ref() else {
                    return Err(StreamError::NotOpened.into());
                };
                // SAFETY: handle is a live stream created by stream_for_pid.
                unsafe { self.symbols.stream_resume(handle.0.as_ptr()) };
                self.state = StreamState::Resumed;
                info!(stream_id = ?self.id, "activity stream resumed");
                Ok(())
            }
        }
    }

    /// Cancels the stream exactly once. A no-op when nothing is open.
    ///
    /// Once this returns the consumer sees no further messages from this
    /// stream, provided the native side honours cancellation.
    pub fn close(&mut self) {
        if let Some(context) = self.context.take() {
            context.shutdown();
        }

        if let Some(handle) = self.handle.take() {
            // SAFETY: handle is live and is cancelled only here.
            unsafe { self.symbols.stream_cancel(handle.0.as_ptr()) };
            info!(stream_id = ?self.id, "activity stream cancelled");
        }

        if self.state != StreamState::Uninitialized {
            self.state = StreamState::Cancelled;
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Id of the open (or last opened) stream.
    #[must_use]
    pub const fn id(&self) -> Option<StreamId> {
        self.id
    }

    /// True while resumed and the trampoline has not signalled stop.
    #[must_use]
    pub fn is_delivering(&self) -> bool {
        self.state == StreamState::Resumed
            && self.context.as_ref().is_some_and(|ctx| ctx.is_active())
    }

    /// Messages handed to the sink so far.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.context.as_ref().map_or(0, |ctx| ctx.forwarded())
    }
}

impl std::fmt::Debug for ActivityStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityStream")
            .field("state", &self.state)
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Drop for ActivityStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::dispatch::{DeliveryQueue, DispatchBridge};
    use crate::message::LogMessage;
    use crate::testing::{FakeActivitySystem, FakeRecord};

    fn bridge() -> (Arc<DispatchBridge>, DeliveryQueue, Arc<Mutex<Vec<LogMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (bridge, queue) = DispatchBridge::channel(move |m| sink.lock().unwrap().push(m));
        (Arc::new(bridge), queue, seen)
    }

    fn manager() -> ActivityStream {
        ActivityStream::new(Arc::new(FakeActivitySystem::symbols()))
    }

    fn flags() -> StreamFlags {
        StreamFlags::HISTORICAL | StreamFlags::PROCESS_ONLY
    }

    #[test]
    fn test_open_resume_close() {
        let pid = FakeActivitySystem::unique_pid();
        let (bridge, mut queue, seen) = bridge();
        let mut stream = manager();
        assert_eq!(stream.state(), StreamState::Uninitialized);

        let id = stream.open(pid, flags(), bridge).unwrap();
        assert_eq!(stream.state(), StreamState::Opened);
        assert_eq!(stream.id(), Some(id));
        assert_eq!(FakeActivitySystem::stats(pid).unwrap().flags, flags().bits());

        stream.resume().unwrap();
        assert_eq!(stream.state(), StreamState::Resumed);
        assert!(stream.is_delivering());

        FakeActivitySystem::emit(pid, FakeRecord::log("hello", 3));
        assert_eq!(queue.drain(), 1);
        assert_eq!(seen.lock().unwrap()[0].text, "hello");

        stream.close();
        assert_eq!(stream.state(), StreamState::Cancelled);
        assert!(FakeActivitySystem::stats(pid).unwrap().cancelled);
    }

    #[test]
    fn test_open_is_idempotent() {
        let pid = FakeActivitySystem::unique_pid();
        let (bridge, _queue, _seen) = bridge();
        let mut stream = manager();
        let first = stream.open(pid, flags(), bridge.clone()).unwrap();
        let second = stream.open(pid, flags(), bridge.clone()).unwrap();
        assert_eq!(first, second);
        stream.resume().unwrap();
        let third = stream.open(pid, flags(), bridge).unwrap();
        assert_eq!(first, third);
        assert_eq!(FakeActivitySystem::stats(pid).unwrap().streams_opened, 1);
    }

    #[test]
    fn test_resume_twice_is_single_resume() {
        let pid = FakeActivitySystem::unique_pid();
        let (bridge, mut queue, _seen) = bridge();
        let mut stream = manager();
        stream.open(pid, flags(), bridge).unwrap();
        FakeActivitySystem::emit(pid, FakeRecord::log("buffered", 1));

        stream.resume().unwrap();
        stream.resume().unwrap();

        assert_eq!(FakeActivitySystem::stats(pid).unwrap().resume_calls, 1);
        assert_eq!(queue.drain(), 1);
    }

    #[test]
    fn test_resume_before_open_fails() {
        let mut stream = manager();
        let err = stream.resume().unwrap_err();
        assert!(err.is_stream());
        assert_eq!(stream.state(), StreamState::Uninitialized);
    }

    #[test]
    fn test_close_without_open_is_noop() {
        let mut stream = manager();
        stream.close();
        stream.close();
        assert_eq!(stream.state(), StreamState::Uninitialized);
    }

    #[test]
    fn test_close_before_resume() {
        let pid = FakeActivitySystem::unique_pid();
        let (bridge, _queue, _seen) = bridge();
        let mut stream = manager();
        stream.open(pid, flags(), bridge).unwrap();
        stream.close();
        assert_eq!(stream.state(), StreamState::Cancelled);
        let stats = FakeActivitySystem::stats(pid).unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.resume_calls, 0);
    }

    #[test]
    fn test_no_transition_out_of_cancelled() {
        let pid = FakeActivitySystem::unique_pid();
        let (bridge, _queue, _seen) = bridge();
        let mut stream = manager();
        stream.open(pid, flags(), bridge.clone()).unwrap();
        stream.close();

        assert!(stream.resume().is_err());
        assert!(stream.open(pid, flags(), bridge).is_err());
        stream.close();
        assert_eq!(FakeActivitySystem::stats(pid).unwrap().cancel_calls, 1);
    }

    #[test]
    fn test_null_handle_fails_and_allows_retry() {
        let pid = FakeActivitySystem::unique_pid();
        FakeActivitySystem::refuse(pid, true);
        let (bridge, _queue, _seen) = bridge();
        let mut stream = manager();

        let err = stream.open(pid, flags(), bridge.clone()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(stream.state(), StreamState::Uninitialized);

        FakeActivitySystem::refuse(pid, false);
        stream.open(pid, flags(), bridge).unwrap();
        assert_eq!(stream.state(), StreamState::Opened);
    }

    #[test]
    fn test_drop_cancels() {
        let pid = FakeActivitySystem::unique_pid();
        let (bridge, _queue, _seen) = bridge();
        {
            let mut stream = manager();
            stream.open(pid, flags(), bridge).unwrap();
            stream.resume().unwrap();
        }
        let stats = FakeActivitySystem::stats(pid).unwrap();
        assert!(stats.cancelled);
        assert!(!stats.block_live);
    }
}
