//! Channel multiplexer facade and lifecycle.

use crate::dispatch::{Callback, CallbackKind, Dispatcher};
use crate::error::Error;
use crate::handle::{EventSink, SocketHandle};
use crate::metrics::{CONNECTS_FAILED, CONNECTS_INITIATED, DISPATCH_REJECTED, SOCKETS_ADOPTED};
use crate::options::SocketOptions;
use crate::registry::Registry;
use crate::selector::{self, LoopFront, Seed};
use mio::net::TcpStream;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{info, trace, warn};

/// Shared core behind the facade: loop fronts, live set, dispatcher, and
/// the lifecycle flags. Handles keep an `Arc` to this so they can re-arm
/// and close from any thread.
pub(crate) struct MuxCore {
    name: String,
    options: SocketOptions,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Registry,
    started: AtomicBool,
    running: AtomicBool,
    next_queue: AtomicUsize,
    read_fronts: Box<[LoopFront]>,
    write_fronts: Box<[LoopFront]>,
    seeds: Mutex<Vec<Seed>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MuxCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn read_front(&self, index: usize) -> &LoopFront {
        &self.read_fronts[index]
    }

    pub(crate) fn write_front(&self, index: usize) -> &LoopFront {
        &self.write_fronts[index]
    }

    /// Round-robin loop assignment. The counter is unsigned, so wraparound
    /// keeps the result in `[0, queues)`.
    fn next_queue_index(&self) -> usize {
        self.next_queue.fetch_add(1, Ordering::Relaxed) % self.read_fronts.len()
    }

    /// Submit a callback, applying the saturation policy on rejection:
    /// connect/accept callbacks close the handle, read/write callbacks
    /// re-arm and retry on a later poll cycle, and a rejected closing
    /// notification is dropped.
    pub(crate) fn dispatch(&self, handle: Arc<SocketHandle>, kind: CallbackKind) {
        match self.dispatcher.submit(Callback::new(handle, kind)) {
            Ok(()) => {}
            Err(rejected) => {
                DISPATCH_REJECTED.increment();
                let handle = rejected.into_inner().into_handle();
                match kind {
                    CallbackKind::Accepted | CallbackKind::Connected => {
                        info!(name = %self.name, "dispatcher saturated, dropping connection");
                        handle.close_with(Some(io::Error::other("dispatcher saturated")));
                    }
                    CallbackKind::ReadReady => {
                        info!(name = %self.name, "dispatcher saturated, reselecting for read");
                        handle.select_for_read();
                    }
                    CallbackKind::WriteReady => {
                        info!(name = %self.name, "dispatcher saturated, reselecting for write");
                        handle.select_for_write();
                    }
                    CallbackKind::Closing => {
                        warn!(name = %self.name, "dispatcher saturated, dropping closing notification");
                    }
                }
            }
        }
    }
}

/// Reactive TCP connection multiplexer.
///
/// Owns `queues` read-side and `queues` write-side selector loops, the
/// live set of open handles, and the dispatcher seam. Construct with
/// [`ChannelMux::builder`], then [`start`](ChannelMux::start) it.
pub struct ChannelMux {
    core: Arc<MuxCore>,
}

impl ChannelMux {
    /// Start building a multiplexer with the given name; the name tags
    /// selector threads and log lines.
    pub fn builder(name: impl Into<String>) -> crate::builder::MuxBuilder {
        crate::builder::MuxBuilder::new(name)
    }

    pub(crate) fn from_parts(
        name: String,
        options: SocketOptions,
        dispatcher: Arc<dyn Dispatcher>,
        read_fronts: Vec<LoopFront>,
        write_fronts: Vec<LoopFront>,
        seeds: Vec<Seed>,
    ) -> Self {
        Self {
            core: Arc::new(MuxCore {
                name,
                options,
                dispatcher,
                registry: Registry::new(),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                next_queue: AtomicUsize::new(0),
                read_fronts: read_fronts.into_boxed_slice(),
                write_fronts: write_fronts.into_boxed_slice(),
                seeds: Mutex::new(seeds),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Launch the selector loops. At-most-once: concurrent and repeated
    /// calls launch exactly one set of threads.
    pub fn start(&self) {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.running.store(true, Ordering::Release);
        let seeds: Vec<Seed> = std::mem::take(&mut *self.core.seeds.lock());
        let mut threads = self.core.threads.lock();
        for seed in seeds {
            let core = self.core.clone();
            let thread_name = format!("{}-{}-{}", core.name, seed.side.label(), seed.index);
            threads.push(
                thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || selector::run(core, seed))
                    .expect("failed to spawn selector thread"),
            );
        }
        info!(name = %self.core.name, queues = self.queues(), "channel mux started");
    }

    /// Stop the selector loops and close every open handle. At-most-once;
    /// a second call is a no-op. Each open handle receives its single
    /// `closing` callback through the dispatcher.
    pub fn terminate(&self) {
        if self
            .core
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // pull every loop out of its poll so the flag is observed promptly
        for index in 0..self.queues() {
            self.core.read_front(index).wake();
            self.core.write_front(index).wake();
        }
        self.core.registry.close_open_handles();
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.core.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        info!(name = %self.core.name, "channel mux terminated");
    }

    pub fn is_running(&self) -> bool {
        self.core.running()
    }

    /// Number of selector queue pairs.
    pub fn queues(&self) -> usize {
        self.core.read_fronts.len()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The socket option policy applied to new sockets.
    pub fn options(&self) -> &SocketOptions {
        &self.core.options
    }

    /// Connect to a remote address without blocking.
    ///
    /// The sink's `connected` fires once the connect completes; a failed
    /// connect (synchronous or asynchronous) surfaces as one
    /// `closing(reason)` instead.
    pub fn connect_to(&self, remote: SocketAddr, sink: Arc<dyn EventSink>) -> Result<(), Error> {
        let index = self.core.next_queue_index();
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        self.core.options.configure(&socket)?;
        socket.set_nonblocking(true)?;
        let outcome = match socket.connect(&remote.into()) {
            Ok(()) => Ok(()),
            Err(err) if connect_in_progress(&err) => Ok(()),
            Err(err) => Err(err),
        };
        let stream = TcpStream::from_std(socket.into());
        let handle = SocketHandle::new(stream, sink, index, self.core.clone());
        self.core.registry.add(&handle);
        CONNECTS_INITIATED.increment();
        match outcome {
            Ok(()) => {
                trace!(name = %self.core.name, %remote, index, "connect initiated");
                handle.select_for_connect();
                Ok(())
            }
            Err(err) => {
                warn!(name = %self.core.name, %remote, error = %err, "cannot connect");
                CONNECTS_FAILED.increment();
                handle.close_with(Some(err));
                Ok(())
            }
        }
    }

    /// Adopt an inbound socket produced by an external listener.
    ///
    /// Applies the socket-option policy, binds the connection to a loop
    /// pair, links it into the live set, and dispatches `accepted`.
    pub fn accept(
        &self,
        stream: std::net::TcpStream,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), Error> {
        let index = self.core.next_queue_index();
        let socket = Socket::from(stream);
        self.core.options.configure(&socket)?;
        socket.set_nonblocking(true)?;
        let stream = TcpStream::from_std(socket.into());
        let handle = SocketHandle::new(stream, sink, index, self.core.clone());
        self.core.registry.add(&handle);
        SOCKETS_ADOPTED.increment();
        trace!(name = %self.core.name, index, "adopted inbound socket");
        self.core.dispatch(handle, CallbackKind::Accepted);
        Ok(())
    }

    /// Snapshot of the event sinks attached to currently open handles.
    pub fn open_handlers(&self) -> Vec<Arc<dyn EventSink>> {
        self.core
            .registry
            .snapshot()
            .iter()
            .map(|handle| handle.sink().clone())
            .collect()
    }

    /// Number of handles currently in the live set.
    pub fn open_handle_count(&self) -> usize {
        self.core.registry.len()
    }
}

impl Drop for ChannelMux {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.kind() == io::ErrorKind::Interrupted
        || err.raw_os_error() == Some(libc::EINPROGRESS)
}
