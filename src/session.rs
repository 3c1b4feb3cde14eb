//! One-call setup of a live log stream and its lifecycle owner.
//!
//! [`LogStream`] resolves, opens for the configured process, and resumes in a
//! single step; dropping it cancels the stream. [`LogStreamHost`] is what an
//! application keeps next to its own lifecycle: `setup` is idempotent and
//! `teardown` releases everything.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::StreamConfig;
use crate::dispatch::DispatchBridge;
use crate::error::{DispatchError, LogStreamResult};
use crate::message::{LogMessage, StreamId};
use crate::resolver::{ResolvedSymbols, SymbolResolver};
use crate::stream::{ActivityStream, StreamState};

/// A resumed activity stream wired to a dispatch bridge.
#[derive(Debug)]
pub struct LogStream {
    stream: ActivityStream,
    bridge: DispatchBridge,
    pid: i32,
    id: StreamId,
}

impl LogStream {
    /// Resolves the configured library, then opens and resumes a stream.
    pub fn start(config: &StreamConfig, bridge: DispatchBridge) -> LogStreamResult<Self> {
        config.validate()?;
        let symbols = Arc::new(SymbolResolver::resolve(&config.library_path)?);
        Self::start_with_symbols(symbols, config, bridge)
    }

    /// Opens and resumes a stream over an already resolved symbol table.
    pub fn start_with_symbols(
        symbols: Arc<ResolvedSymbols>,
        config: &StreamConfig,
        bridge: DispatchBridge,
    ) -> LogStreamResult<Self> {
        let pid = config.resolved_pid();
        let mut stream = ActivityStream::new(symbols).with_decode_failure(config.decode_failure);
        let id = stream.open(pid, config.flags(), Arc::new(bridge.clone()))?;
        stream.resume()?;
        info!(stream_id = %id, pid, "log stream started");
        Ok(Self {
            stream,
            bridge,
            pid,
            id,
        })
    }

    /// Id of the underlying stream.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// Process the stream is filtered to.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Lifecycle state of the underlying stream.
    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// True until the stream is closed or stops itself.
    #[must_use]
    pub fn is_delivering(&self) -> bool {
        self.stream.is_delivering()
    }

    /// Messages posted to the delivery context so far.
    #[must_use]
    pub fn posted(&self) -> u64 {
        self.bridge.posted()
    }

    /// Cancels the stream; no consumer callback runs after this returns.
    pub fn close(&mut self) {
        self.stream.close();
    }
}

/// Owns at most one [`LogStream`] for an application component.
#[derive(Debug)]
pub struct LogStreamHost {
    config: StreamConfig,
    symbols: Option<Arc<ResolvedSymbols>>,
    session: Option<LogStream>,
}

impl LogStreamHost {
    /// Creates a host that resolves symbols from `config.library_path`.
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            symbols: None,
            session: None,
        }
    }

    /// Creates a host over an already resolved symbol table.
    #[must_use]
    pub fn with_symbols(config: StreamConfig, symbols: Arc<ResolvedSymbols>) -> Self {
        Self {
            config,
            symbols: Some(symbols),
            session: None,
        }
    }

    /// Starts streaming to `handler` on a dedicated delivery thread.
    ///
    /// Returns `Ok(false)` without touching anything when a session is
    /// already delivering. A session that stopped itself is replaced.
    pub fn setup<F>(&mut self, handler: F) -> LogStreamResult<bool>
    where
        F: FnMut(LogMessage) + Send + 'static,
    {
        if self.is_active() {
            return Ok(false);
        }
        let bridge = DispatchBridge::spawn(handler)?;
        self.setup_with_bridge(bridge)
    }

    /// Like [`LogStreamHost::setup`] with a caller-supplied bridge.
    ///
    /// # Errors
    /// `DispatchError::Disconnected` if `bridge` was already closed, for
    /// example by an earlier teardown.
    pub fn setup_with_bridge(&mut self, bridge: DispatchBridge) -> LogStreamResult<bool> {
        if self.is_active() {
            return Ok(false);
        }
        if bridge.is_closed() {
            warn!("refusing to start a log stream on a closed delivery bridge");
            return Err(DispatchError::Disconnected {
                path: "delivery_gate".to_string(),
            }
            .into());
        }
        self.teardown();

        let result = self
            .symbols()
            .and_then(|symbols| LogStream::start_with_symbols(symbols, &self.config, bridge));
        match result {
            Ok(session) => {
                self.session = Some(session);
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "log stream setup failed");
                Err(e)
            }
        }
    }

    /// True while a session is delivering.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(LogStream::is_delivering)
    }

    /// The current session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&LogStream> {
        self.session.as_ref()
    }

    /// The host configuration.
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Cancels and drops the current session. A no-op without one.
    pub fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn symbols(&mut self) -> LogStreamResult<Arc<ResolvedSymbols>> {
        if let Some(symbols) = &self.symbols {
            return Ok(Arc::clone(symbols));
        }
        self.config.validate()?;
        let symbols = Arc::new(SymbolResolver::resolve(&self.config.library_path)?);
        self.symbols = Some(Arc::clone(&symbols));
        Ok(symbols)
    }
}

impl Drop for LogStreamHost {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::testing::{FakeActivitySystem, FakeRecord};

    fn config(pid: i32) -> StreamConfig {
        StreamConfig {
            process_id: Some(pid),
            ..StreamConfig::default()
        }
    }

    fn host(pid: i32) -> LogStreamHost {
        LogStreamHost::with_symbols(config(pid), Arc::new(FakeActivitySystem::symbols()))
    }

    #[test]
    fn test_start_with_symbols_resumes() {
        let pid = FakeActivitySystem::unique_pid();
        let (bridge, mut queue) = DispatchBridge::channel(|_| {});
        let session = LogStream::start_with_symbols(
            Arc::new(FakeActivitySystem::symbols()),
            &config(pid),
            bridge,
        )
        .unwrap();
        assert_eq!(session.state(), StreamState::Resumed);
        assert_eq!(session.pid(), pid);

        FakeActivitySystem::emit(pid, FakeRecord::log("live", 1));
        assert_eq!(session.posted(), 1);
        assert_eq!(queue.drain(), 1);
    }

    #[test]
    fn test_start_from_missing_library() {
        let (bridge, _queue) = DispatchBridge::channel(|_| {});
        let cfg = StreamConfig {
            library_path: "/nonexistent/LoggingSupport".into(),
            ..StreamConfig::default()
        };
        let err = LogStream::start(&cfg, bridge).unwrap_err();
        assert!(err.is_resolve());
    }

    #[test]
    fn test_setup_is_idempotent() {
        let pid = FakeActivitySystem::unique_pid();
        let mut host = host(pid);
        assert!(host.setup(|_| {}).unwrap());
        let id = host.session().unwrap().id();
        assert!(!host.setup(|_| {}).unwrap());
        assert_eq!(host.session().unwrap().id(), id);
        assert_eq!(FakeActivitySystem::stats(pid).unwrap().streams_opened, 1);
    }

    #[test]
    fn test_setup_delivers_on_delivery_thread() {
        let pid = FakeActivitySystem::unique_pid();
        let mut host = host(pid);
        let (tx, rx) = mpsc::channel();
        host.setup(move |m: LogMessage| {
            let _ = tx.send(m.text);
        })
        .unwrap();

        FakeActivitySystem::emit(pid, FakeRecord::log("Error log message", 1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "Error log message");
    }

    #[test]
    fn test_setup_replaces_stopped_session() {
        let pid = FakeActivitySystem::unique_pid();
        let mut host = host(pid);
        host.setup(|_| {}).unwrap();
        FakeActivitySystem::emit(pid, FakeRecord::undecodable(1));
        assert!(!host.is_active());

        assert!(host.setup(|_| {}).unwrap());
        assert!(host.is_active());
        assert_eq!(FakeActivitySystem::stats(pid).unwrap().streams_opened, 2);
    }

    #[test]
    fn test_setup_failure_leaves_no_session() {
        let pid = FakeActivitySystem::unique_pid();
        FakeActivitySystem::refuse(pid, true);
        let mut host = host(pid);
        let err = host.setup(|_| {}).unwrap_err();
        assert!(err.is_retryable());
        assert!(host.session().is_none());

        FakeActivitySystem::refuse(pid, false);
        assert!(host.setup(|_| {}).unwrap());
    }

    #[test]
    fn test_setup_rejects_closed_bridge() {
        let pid = FakeActivitySystem::unique_pid();
        let mut host = host(pid);
        let (bridge, _queue) = DispatchBridge::channel(|_| {});
        assert!(host.setup_with_bridge(bridge.clone()).unwrap());
        host.teardown();
        assert!(bridge.is_closed());

        let err = host.setup_with_bridge(bridge).unwrap_err();
        assert!(err.is_dispatch());
        assert!(host.session().is_none());
        assert_eq!(FakeActivitySystem::stats(pid).unwrap().streams_opened, 1);
    }

    #[test]
    fn test_teardown_cancels() {
        let pid = FakeActivitySystem::unique_pid();
        let mut host = host(pid);
        host.teardown();
        host.setup(|_| {}).unwrap();
        host.teardown();
        assert!(!host.is_active());
        assert!(FakeActivitySystem::stats(pid).unwrap().cancelled);
    }
}
