//! chanmux-buffer - Buffered bidirectional binary-protocol adapter.
//!
//! A thin convenience over the chanmux event contract: it owns one read and
//! one write buffer per connection and performs a single non-blocking read
//! or write per readiness event, re-arming itself until a buffer boundary
//! is reached and only then notifying the protocol layer above.
//!
//! With `read_full_buffer` set (the default), `read_ready` is delivered
//! upward only once the read buffer is full; otherwise every non-empty read
//! is delivered. The write side mirrors this with `write_full_buffer`.
//!
//! This adapter is the canonical client of the chanmux core, not part of
//! its contract.

use chanmux::{EventSink, SocketHandle};
use parking_lot::{Mutex, MutexGuard};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

/// Answer true if the error is a form of a closed connection.
pub fn is_closed_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Protocol layer above the adapter.
///
/// `read_ready` / `write_ready` report buffer progress per the full-buffer
/// toggles; `read_error` / `write_error` report I/O failures that are not
/// plain closed-connection conditions (those close silently). The buffers
/// returned by `new_read_buffer` / `new_write_buffer` fix each direction's
/// capacity for the connection's life.
pub trait BufferProtocolHandler: Send + Sync {
    fn accepted(&self, socket: &BufferProtocol);
    fn connected(&self, socket: &BufferProtocol);
    fn closing(&self, reason: Option<io::Error>);
    fn read_ready(&self);
    fn write_ready(&self);
    fn read_error(&self, error: &io::Error);
    fn write_error(&self, error: &io::Error);
    fn new_read_buffer(&self) -> Box<[u8]>;
    fn new_write_buffer(&self) -> Box<[u8]>;
}

/// Fixed-capacity buffer with a consume position and a fill position.
///
/// `[.. pos)` has been consumed, `[pos .. end)` is unread, `[end .. cap)`
/// is spare space.
pub struct IoCursor {
    buf: Box<[u8]>,
    pos: usize,
    end: usize,
}

impl IoCursor {
    pub fn new(buf: Box<[u8]>) -> Self {
        Self { buf, pos: 0, end: 0 }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(vec![0u8; capacity].into_boxed_slice())
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes filled but not yet consumed.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.pos..self.end]
    }

    /// Writable tail of the buffer.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    pub fn has_spare(&self) -> bool {
        self.end < self.buf.len()
    }

    /// Record `n` bytes read into the spare space.
    pub fn fill(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end += n;
    }

    /// Record `n` unread bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.end);
        self.pos += n;
    }

    /// Copy bytes into the spare space; returns how many fit.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(bytes.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.end += n;
        n
    }

    pub fn len(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.end
    }

    /// Reset to an empty buffer, reusing the storage.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.end = 0;
    }
}

struct Shared {
    protocol: Arc<dyn BufferProtocolHandler>,
    read: Mutex<IoCursor>,
    write: Mutex<IoCursor>,
    read_full: AtomicBool,
    write_full: AtomicBool,
    handle: OnceLock<Arc<SocketHandle>>,
}

enum ReadOutcome {
    Deliver,
    Partial,
    Rearm,
    Eof,
    Failed(io::Error),
}

enum WriteOutcome {
    Deliver,
    Partial,
    Rearm,
    Failed(io::Error),
}

impl Shared {
    fn on_read_ready(self: &Arc<Self>) {
        let Some(handle) = self.handle.get() else {
            return;
        };
        let outcome = {
            let mut cursor = self.read.lock();
            if !cursor.has_spare() {
                // buffer already full; nothing to read into
                ReadOutcome::Deliver
            } else {
                let mut channel = handle.channel();
                match channel.read(cursor.spare_mut()) {
                    Ok(0) => ReadOutcome::Eof,
                    Ok(n) => {
                        cursor.fill(n);
                        trace!(bytes = n, "read");
                        if cursor.has_spare() {
                            ReadOutcome::Partial
                        } else {
                            ReadOutcome::Deliver
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        ReadOutcome::Rearm
                    }
                    Err(err) => ReadOutcome::Failed(err),
                }
            }
        };
        match outcome {
            ReadOutcome::Deliver => self.protocol.read_ready(),
            ReadOutcome::Partial => {
                if self.read_full.load(Ordering::Relaxed) {
                    trace!("read buffer still needs bytes, reselecting for read");
                    handle.select_for_read();
                } else {
                    self.protocol.read_ready();
                }
            }
            ReadOutcome::Rearm => handle.select_for_read(),
            ReadOutcome::Eof => {
                debug!("socket closed during read");
                handle.close_with(Some(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            ReadOutcome::Failed(err) => {
                if is_closed_connection(&err) {
                    debug!(error = %err, "socket closed during read");
                } else {
                    debug!(error = %err, "socket errored during read");
                    self.protocol.read_error(&err);
                }
                handle.close_with(Some(err));
            }
        }
    }

    fn on_write_ready(self: &Arc<Self>) {
        let Some(handle) = self.handle.get() else {
            return;
        };
        let outcome = {
            let mut cursor = self.write.lock();
            if cursor.is_empty() {
                WriteOutcome::Deliver
            } else {
                let mut channel = handle.channel();
                match channel.write(cursor.unread()) {
                    Ok(0) => WriteOutcome::Rearm,
                    Ok(n) => {
                        cursor.consume(n);
                        trace!(bytes = n, "wrote");
                        if cursor.is_empty() {
                            WriteOutcome::Deliver
                        } else {
                            WriteOutcome::Partial
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        WriteOutcome::Rearm
                    }
                    Err(err) => WriteOutcome::Failed(err),
                }
            }
        };
        match outcome {
            WriteOutcome::Deliver => self.protocol.write_ready(),
            WriteOutcome::Partial => {
                if self.write_full.load(Ordering::Relaxed) {
                    trace!("write buffer still has bytes, reselecting for write");
                    handle.select_for_write();
                } else {
                    self.protocol.write_ready();
                }
            }
            WriteOutcome::Rearm => handle.select_for_write(),
            WriteOutcome::Failed(err) => {
                if is_closed_connection(&err) {
                    debug!(error = %err, "socket closed during write");
                } else {
                    debug!(error = %err, "socket errored during write");
                    self.protocol.write_error(&err);
                }
                handle.close_with(Some(err));
            }
        }
    }
}

/// The adapter's face toward the multiplexer.
struct CommsAdapter {
    shared: Arc<Shared>,
}

impl EventSink for CommsAdapter {
    fn accepted(&self, handle: &Arc<SocketHandle>) {
        if self.shared.handle.set(handle.clone()).is_err() {
            debug!("handle already bound, ignoring accepted");
            return;
        }
        debug!(peer = ?handle.peer_addr().ok(), "socket accepted");
        self.shared.protocol.accepted(&BufferProtocol {
            shared: self.shared.clone(),
        });
    }

    fn connected(&self, handle: &Arc<SocketHandle>) {
        if self.shared.handle.set(handle.clone()).is_err() {
            debug!("handle already bound, ignoring connected");
            return;
        }
        debug!(peer = ?handle.peer_addr().ok(), "socket connected");
        self.shared.protocol.connected(&BufferProtocol {
            shared: self.shared.clone(),
        });
    }

    fn read_ready(&self) {
        self.shared.on_read_ready();
    }

    fn write_ready(&self) {
        self.shared.on_write_ready();
    }

    fn closing(&self, reason: Option<io::Error>) {
        debug!("socket closing");
        self.shared.protocol.closing(reason);
    }
}

/// A buffered bidirectional binary protocol endpoint.
///
/// Construct one per connection, hand its [`sink`](BufferProtocol::sink) to
/// `ChannelMux::connect_to` or `ChannelMux::accept`, and drive it from the
/// [`BufferProtocolHandler`] callbacks.
#[derive(Clone)]
pub struct BufferProtocol {
    shared: Arc<Shared>,
}

impl BufferProtocol {
    pub fn new(protocol: Arc<dyn BufferProtocolHandler>) -> Self {
        let read = IoCursor::new(protocol.new_read_buffer());
        let write = IoCursor::new(protocol.new_write_buffer());
        Self {
            shared: Arc::new(Shared {
                protocol,
                read: Mutex::new(read),
                write: Mutex::new(write),
                read_full: AtomicBool::new(true),
                write_full: AtomicBool::new(true),
                handle: OnceLock::new(),
            }),
        }
    }

    /// The event sink to register with the multiplexer.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::new(CommsAdapter {
            shared: self.shared.clone(),
        })
    }

    /// Kick off reading from the socket into the read buffer.
    pub fn select_for_read(&self) {
        if let Some(handle) = self.shared.handle.get() {
            handle.select_for_read();
        }
    }

    /// Kick off writing the write buffer's unread bytes to the socket.
    pub fn select_for_write(&self) {
        if let Some(handle) = self.shared.handle.get() {
            handle.select_for_write();
        }
    }

    pub fn close(&self) {
        self.close_with(None);
    }

    pub fn close_with(&self, reason: Option<io::Error>) {
        if let Some(handle) = self.shared.handle.get() {
            handle.close_with(reason);
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.handle.get().and_then(|h| h.peer_addr().ok())
    }

    /// The buffer the socket is read into.
    pub fn read_buffer(&self) -> MutexGuard<'_, IoCursor> {
        self.shared.read.lock()
    }

    /// The buffer written out to the socket.
    pub fn write_buffer(&self) -> MutexGuard<'_, IoCursor> {
        self.shared.write.lock()
    }

    /// When true (the default), `read_ready` is delivered only once the
    /// read buffer fills; when false, every non-empty read is delivered.
    pub fn set_read_full_buffer(&self, read_full: bool) {
        self.shared.read_full.store(read_full, Ordering::Relaxed);
    }

    /// When true (the default), `write_ready` is delivered only once the
    /// write buffer empties; when false, every non-zero write is delivered.
    pub fn set_write_full_buffer(&self, write_full: bool) {
        self.shared.write_full.store(write_full, Ordering::Relaxed);
    }
}
