//! Delivery of decoded messages to the consumer's execution context.
//!
//! The trampoline runs on whatever queue the logging system picks. It posts
//! each message into an unbounded channel and returns immediately; the
//! consumer callback only ever runs on the delivery context, either a
//! dedicated thread ([`DispatchBridge::spawn`]) or a loop the owner pumps
//! itself ([`DispatchBridge::channel`]).

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::error::DispatchError;
use crate::message::LogMessage;

/// Receiver of decoded messages, called from the trampoline.
pub trait MessageSink: Send + Sync {
    /// Hands off one message without blocking.
    ///
    /// An error tells the trampoline that nobody is listening anymore.
    fn deliver(&self, message: LogMessage) -> Result<(), DispatchError>;

    /// Stops all further deliveries.
    fn close(&self) {}
}

/// Consumer callback type.
pub type MessageHandler = Box<dyn FnMut(LogMessage) + Send + 'static>;

thread_local! {
    static DELIVERING: Cell<*const Gate> = const { Cell::new(ptr::null()) };
}

/// Open/closed switch shared by a bridge and its queue.
///
/// Handler invocations hold `in_flight`, so `close` can wait out a
/// delivery that is already running on another thread.
#[derive(Debug)]
struct Gate {
    open: AtomicBool,
    in_flight: Mutex<()>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            in_flight: Mutex::new(()),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);

        // Inside our own handler the lock is already held by this thread.
        let reentrant = DELIVERING.with(|current| ptr::eq(current.get(), self));
        if !reentrant {
            drop(self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

/// Marks `gate` as the one being delivered on this thread.
///
/// Handlers may pump another queue, so the outer gate is restored on drop.
struct DeliveringGuard {
    previous: *const Gate,
}

impl DeliveringGuard {
    fn enter(gate: &Gate) -> Self {
        let previous = DELIVERING.with(|current| current.replace(gate));
        Self { previous }
    }
}

impl Drop for DeliveringGuard {
    fn drop(&mut self) {
        DELIVERING.with(|current| current.set(self.previous));
    }
}

/// Sending half: cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct DispatchBridge {
    tx: Sender<LogMessage>,
    gate: Arc<Gate>,
    posted: Arc<AtomicU64>,
}

impl DispatchBridge {
    /// Creates a bridge whose handler runs wherever the returned queue is pumped.
    pub fn channel<F>(handler: F) -> (Self, DeliveryQueue)
    where
        F: FnMut(LogMessage) + Send + 'static,
    {
        let (tx, rx) = unbounded::<LogMessage>();
        let gate = Arc::new(Gate::new());
        let bridge = Self {
            tx,
            gate: Arc::clone(&gate),
            posted: Arc::new(AtomicU64::new(0)),
        };
        let queue = DeliveryQueue {
            rx,
            gate,
            handler: Box::new(handler),
            delivered: 0,
        };
        (bridge, queue)
    }

    /// Creates a bridge whose handler runs on a dedicated delivery thread.
    ///
    /// The thread exits once every clone of the bridge has been dropped.
    pub fn spawn<F>(handler: F) -> Result<Self, DispatchError>
    where
        F: FnMut(LogMessage) + Send + 'static,
    {
        let (bridge, queue) = Self::channel(handler);
        let join = thread::Builder::new()
            .name("oslog-delivery".to_string())
            .spawn(move || {
                let delivered = queue.run();
                debug!(delivered, "delivery thread finished");
            })
            .map_err(|e| DispatchError::SpawnFailed {
                message: e.to_string(),
            })?;

        // Detached: joining here could wait on a sender we still hold.
        drop(join);
        Ok(bridge)
    }

    /// Posts one message to the delivery context.
    pub fn post(&self, message: LogMessage) -> Result<(), DispatchError> {
        if !self.gate.is_open() {
            return Err(DispatchError::Disconnected {
                path: "delivery_gate".to_string(),
            });
        }
        self.tx.send(message).map_err(|_| DispatchError::Disconnected {
            path: "delivery_queue".to_string(),
        })?;
        self.posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Closes the gate: once this returns the handler is never called again.
    ///
    /// Waits for a handler invocation running on another thread to finish.
    /// Idempotent.
    pub fn close(&self) {
        self.gate.close();
    }

    /// True after [`DispatchBridge::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.gate.is_open()
    }

    /// Number of messages accepted by [`DispatchBridge::post`].
    #[must_use]
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }
}

impl MessageSink for DispatchBridge {
    fn deliver(&self, message: LogMessage) -> Result<(), DispatchError> {
        self.post(message)
    }

    fn close(&self) {
        DispatchBridge::close(self);
    }
}

/// Receiving half: owns the consumer callback.
pub struct DeliveryQueue {
    rx: Receiver<LogMessage>,
    gate: Arc<Gate>,
    handler: MessageHandler,
    delivered: u64,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("pending", &self.rx.len())
            .field("delivered", &self.delivered)
            .field("open", &self.gate.is_open())
            .finish()
    }
}

impl DeliveryQueue {
    /// Delivers everything already queued, in order. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(message) = self.rx.try_recv() {
            if !self.dispatch(message) {
                break;
            }
            count += 1;
        }
        count
    }

    /// Delivers messages as they arrive for up to `timeout`.
    ///
    /// A timeout too large to represent waits without a deadline.
    pub fn run_for(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = 0;
        loop {
            let next = match deadline {
                Some(deadline) => self
                    .rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(message) => {
                    if !self.dispatch(message) {
                        break;
                    }
                    count += 1;
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        count
    }

    /// Delivers until every bridge is dropped or the gate closes.
    ///
    /// Returns the total number of messages this queue delivered.
    pub fn run(mut self) -> u64 {
        while let Ok(message) = self.rx.recv() {
            if !self.dispatch(message) {
                break;
            }
        }
        self.delivered
    }

    /// Messages waiting to be delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Messages delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn dispatch(&mut self, message: LogMessage) -> bool {
        let _in_flight = self.gate.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.gate.is_open() {
            return false;
        }
        let _delivering = DeliveringGuard::enter(&self.gate);
        (self.handler)(message);
        self.delivered += 1;
        true
    }
}
