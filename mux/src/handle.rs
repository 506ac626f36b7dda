//! Per-connection handle and the application event contract.

use crate::dispatch::CallbackKind;
use crate::mux::MuxCore;
use crate::selector::{Ops, Registration};
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;

/// Registry slot value for a handle that is not (or no longer) linked.
pub(crate) const UNLINKED: usize = usize::MAX;

/// Event sink the embedder supplies per connection.
///
/// `accepted` or `connected` fires once when the socket comes up and hands
/// over the handle; `read_ready` / `write_ready` fire at most once per armed
/// readiness event; `closing` fires exactly once over the handle's life.
/// All methods run on dispatcher workers, never on a selector thread.
pub trait EventSink: Send + Sync {
    /// An inbound socket was adopted and is ready for use.
    fn accepted(&self, handle: &Arc<SocketHandle>);

    /// An outbound connect completed and the socket is ready for use.
    fn connected(&self, handle: &Arc<SocketHandle>);

    /// The socket is ready to read; re-arm with `select_for_read` for more.
    fn read_ready(&self);

    /// The socket is ready to write; re-arm with `select_for_write` for more.
    fn write_ready(&self);

    /// The handle has been closed. `reason` carries the triggering error,
    /// if any.
    fn closing(&self, reason: Option<io::Error>);
}

/// Per-connection object tying a socket, an event sink, and a selector-loop
/// identity together.
///
/// The loop index is fixed at creation: every readiness registration for
/// this socket goes to read loop `index` or write loop `index`, which
/// serializes all traffic for one connection through one loop pair.
pub struct SocketHandle {
    stream: TcpStream,
    sink: Arc<dyn EventSink>,
    index: usize,
    core: Arc<MuxCore>,
    closed: AtomicBool,
    slot: AtomicUsize,
    close_reason: Mutex<Option<io::Error>>,
}

impl SocketHandle {
    pub(crate) fn new(
        stream: TcpStream,
        sink: Arc<dyn EventSink>,
        index: usize,
        core: Arc<MuxCore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream,
            sink,
            index,
            core,
            closed: AtomicBool::new(false),
            slot: AtomicUsize::new(UNLINKED),
            close_reason: Mutex::new(None),
        })
    }

    /// The underlying non-blocking stream.
    ///
    /// Reads and writes go through `&TcpStream`, so the channel can be used
    /// from a read worker and a write worker at the same time.
    pub fn channel(&self) -> &TcpStream {
        &self.stream
    }

    /// Selector loop pair this handle is bound to.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The application event sink for this connection.
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Release);
    }

    /// Arm a one-shot read registration on this handle's read loop.
    ///
    /// Safe to call from any thread, including inside a `read_ready`
    /// callback. Dropped silently once the handle is closed.
    pub fn select_for_read(self: &Arc<Self>) {
        if self.is_closed() {
            trace!(index = self.index, "dropping read registration for closed handle");
            return;
        }
        trace!(index = self.index, "registering read");
        self.core
            .read_front(self.index)
            .push(Registration::new(self.clone(), Ops::Read));
    }

    /// Arm a one-shot write registration on this handle's write loop.
    pub fn select_for_write(self: &Arc<Self>) {
        if self.is_closed() {
            trace!(index = self.index, "dropping write registration for closed handle");
            return;
        }
        trace!(index = self.index, "registering write");
        self.core
            .write_front(self.index)
            .push(Registration::new(self.clone(), Ops::Write));
    }

    /// Arm a one-shot connect registration; used while a non-blocking
    /// connect is still in flight.
    pub(crate) fn select_for_connect(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        trace!(index = self.index, "registering connect");
        self.core
            .read_front(self.index)
            .push(Registration::new(self.clone(), Ops::Connect));
    }

    /// Close the handle with no reason attached.
    pub fn close(self: &Arc<Self>) {
        self.close_with(None);
    }

    /// Close the handle.
    ///
    /// Idempotent: the first call unlinks the handle from the live set,
    /// shuts the socket down, and schedules exactly one `closing(reason)`
    /// callback; later calls are no-ops. In-flight callbacks are neither
    /// awaited nor interrupted, but no further readiness callbacks will be
    /// dispatched.
    pub fn close_with(self: &Arc<Self>, reason: Option<io::Error>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.registry().remove(self.slot.load(Ordering::Acquire));
        // errors here mean the peer beat us to it
        let _ = self.stream.shutdown(Shutdown::Both);
        *self.close_reason.lock() = reason;
        trace!(index = self.index, "handle closed");
        self.core.dispatch(self.clone(), CallbackKind::Closing);
    }

    pub(crate) fn take_close_reason(&self) -> Option<io::Error> {
        self.close_reason.lock().take()
    }
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("index", &self.index)
            .field("closed", &self.is_closed())
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}
