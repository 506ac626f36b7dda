//! Callback dispatch.
//!
//! Selector loops never run application code in-line; every ready event is
//! packaged as a [`Callback`] and submitted to a [`Dispatcher`]. Submission
//! is non-blocking and may be rejected under saturation, in which case the
//! callback is handed back so the loop can apply its backpressure policy.

use crate::handle::SocketHandle;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use tracing::{error, trace};

/// Which event-sink method a callback invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Accepted,
    Connected,
    ReadReady,
    WriteReady,
    Closing,
}

/// A deferred event-sink invocation for one connection handle.
///
/// Tagged record rather than a closure: the dispatcher queue carries only
/// the handle and the kind, and `run` does the method selection.
pub struct Callback {
    handle: Arc<SocketHandle>,
    kind: CallbackKind,
}

impl Callback {
    pub(crate) fn new(handle: Arc<SocketHandle>, kind: CallbackKind) -> Self {
        Self { handle, kind }
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    pub(crate) fn into_handle(self) -> Arc<SocketHandle> {
        self.handle
    }

    /// Invoke the sink method this callback stands for.
    ///
    /// Readiness and connect callbacks queued behind a `close` are
    /// suppressed here; only the final `closing` notification survives.
    pub fn run(self) {
        if self.kind != CallbackKind::Closing && self.handle.is_closed() {
            trace!(kind = ?self.kind, "suppressing callback for closed handle");
            return;
        }
        match self.kind {
            CallbackKind::Accepted => self.handle.sink().accepted(&self.handle),
            CallbackKind::Connected => self.handle.sink().connected(&self.handle),
            CallbackKind::ReadReady => self.handle.sink().read_ready(),
            CallbackKind::WriteReady => self.handle.sink().write_ready(),
            CallbackKind::Closing => {
                let reason = self.handle.take_close_reason();
                self.handle.sink().closing(reason);
            }
        }
    }
}

/// A callback refused by a saturated dispatcher, handed back to the caller.
pub struct RejectedCallback(Callback);

impl RejectedCallback {
    /// Recover the rejected callback.
    pub fn into_inner(self) -> Callback {
        self.0
    }
}

impl From<Callback> for RejectedCallback {
    fn from(callback: Callback) -> Self {
        Self(callback)
    }
}

/// Bounded execution resource that runs application callbacks.
///
/// `submit` must not block; a saturated implementation rejects and returns
/// the callback. The multiplexer then closes (connect/accept) or re-arms
/// (read/write) per its backpressure policy.
pub trait Dispatcher: Send + Sync {
    fn submit(&self, callback: Callback) -> Result<(), RejectedCallback>;
}

/// Default dispatcher: a fixed-size worker pool over a bounded queue.
///
/// A panic inside a callback is contained at the pool boundary and logged;
/// the worker thread keeps running. Workers exit once the pool is dropped
/// and the queue has drained.
pub struct FixedThreadPool {
    tx: Sender<Callback>,
}

impl FixedThreadPool {
    /// Spawn `threads` named workers feeding off a queue of `queue_depth`
    /// pending callbacks. A depth of zero makes submission succeed only
    /// when a worker is parked waiting for work.
    pub fn new(name: &str, threads: usize, queue_depth: usize) -> Self {
        let (tx, rx) = bounded::<Callback>(queue_depth);
        for id in 0..threads.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("{name}-worker-{id}"))
                .spawn(move || worker(rx))
                .expect("failed to spawn worker thread");
        }
        Self { tx }
    }
}

impl Dispatcher for FixedThreadPool {
    fn submit(&self, callback: Callback) -> Result<(), RejectedCallback> {
        self.tx.try_send(callback).map_err(|err| match err {
            TrySendError::Full(cb) | TrySendError::Disconnected(cb) => RejectedCallback(cb),
        })
    }
}

fn worker(rx: Receiver<Callback>) {
    while let Ok(callback) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(|| callback.run())).is_err() {
            error!("application callback panicked");
        }
    }
}
