//! Selector loops.
//!
//! Each loop owns one poller and one registration queue. Producer threads
//! enqueue registration actions and wake the poller; the loop drains the
//! queue, polls with a bounded timeout, and dispatches ready events with
//! one-shot semantics: the registration is removed before the event is
//! handed to the dispatcher, so nothing fires again for that socket and
//! event class until the handle re-arms.

use crate::dispatch::CallbackKind;
use crate::handle::SocketHandle;
use crate::metrics::CONNECTS_FAILED;
use crate::mux::MuxCore;
use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};

/// Upper bound on one poll; terminate latency is at most this plus one
/// dispatch pass.
pub(crate) const SELECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Reserved waker token; slab keys grow from zero and never reach it.
const WAKE: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// Which event class a loop serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Read,
    Write,
}

impl Side {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Side::Read => "read",
            Side::Write => "write",
        }
    }
}

/// Readiness interest carried by a registration action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ops {
    Connect,
    Read,
    Write,
}

impl Ops {
    /// Non-blocking connect completion surfaces as writability.
    fn interest(self) -> Interest {
        match self {
            Ops::Read => Interest::READABLE,
            Ops::Connect | Ops::Write => Interest::WRITABLE,
        }
    }
}

/// Deferred (socket, interest, handle) binding request.
///
/// A plain tagged record: the loop dispatches on `ops`, no per-registration
/// closure is allocated.
pub(crate) struct Registration {
    pub(crate) handle: Arc<SocketHandle>,
    pub(crate) ops: Ops,
}

impl Registration {
    pub(crate) fn new(handle: Arc<SocketHandle>, ops: Ops) -> Self {
        Self { handle, ops }
    }
}

/// Producer-side face of one selector loop: the registration queue plus the
/// wakeup capability. Shared by every thread that posts registrations.
pub(crate) struct LoopFront {
    tx: Sender<Registration>,
    waker: Arc<Waker>,
}

impl LoopFront {
    /// Enqueue a registration action.
    ///
    /// The wakeup happens strictly after the push, so the loop either sees
    /// the entry in its drain step or is pulled out of its poll.
    pub(crate) fn push(&self, registration: Registration) {
        if self.tx.send(registration).is_err() {
            trace!("registration dropped, selector loop is gone");
            return;
        }
        self.wake();
    }

    /// Wake the loop's poller. Idempotent; safe before any poll is in
    /// progress. Failures are trace-logged and swallowed.
    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            trace!(error = %err, "selector wakeup failed");
        }
    }
}

/// Loop-thread state handed to `run` by `start`.
pub(crate) struct Seed {
    pub(crate) side: Side,
    pub(crate) index: usize,
    pub(crate) poll: Poll,
    pub(crate) rx: Receiver<Registration>,
}

/// Allocate the poller, waker, and registration queue for one loop.
pub(crate) fn loop_parts(side: Side, index: usize) -> io::Result<(LoopFront, Seed)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
    let (tx, rx) = unbounded();
    Ok((
        LoopFront { tx, waker },
        Seed {
            side,
            index,
            poll,
            rx,
        },
    ))
}

struct SelectorLoop {
    side: Side,
    index: usize,
    poll: Poll,
    events: Events,
    registrations: Slab<Registration>,
    by_fd: HashMap<RawFd, usize>,
    rx: Receiver<Registration>,
}

impl SelectorLoop {
    /// Run every queued registration action. A failing action closes its
    /// own handle and never takes the loop down.
    fn drain(&mut self) {
        while let Ok(registration) = self.rx.try_recv() {
            self.arm(registration);
        }
    }

    fn arm(&mut self, registration: Registration) {
        let handle = registration.handle.clone();
        if handle.is_closed() {
            trace!(
                side = self.side.label(),
                index = self.index,
                "dropping registration for closed handle"
            );
            return;
        }
        let fd = handle.raw_fd();
        let interest = registration.ops.interest();
        let result = if let Some(&key) = self.by_fd.get(&fd) {
            // re-armed before the previous registration fired; replace it
            self.registrations[key] = registration;
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), Token(key), interest)
        } else {
            let key = self.registrations.insert(registration);
            self.by_fd.insert(fd, key);
            match self
                .poll
                .registry()
                .register(&mut SourceFd(&fd), Token(key), interest)
            {
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => self
                    .poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(key), interest),
                other => other,
            }
        };
        if let Err(err) = result {
            // the descriptor is gone or refused; the connection is over
            self.drop_fd(fd);
            trace!(
                side = self.side.label(),
                index = self.index,
                error = %err,
                "cannot register channel, closing handle"
            );
            handle.close_with(Some(err));
        }
    }

    /// Remove a fired registration, clearing its interest before anything
    /// is dispatched (the one-shot step).
    fn take(&mut self, token: Token) -> Option<Registration> {
        let registration = self.registrations.try_remove(token.0)?;
        let fd = registration.handle.raw_fd();
        self.by_fd.remove(&fd);
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        Some(registration)
    }

    fn drop_fd(&mut self, fd: RawFd) {
        if let Some(key) = self.by_fd.remove(&fd) {
            let _ = self.registrations.try_remove(key);
        }
    }
}

/// Selector loop body; one dedicated thread per (side, index).
pub(crate) fn run(core: Arc<MuxCore>, seed: Seed) {
    let Seed {
        side,
        index,
        poll,
        rx,
    } = seed;
    let mut selector = SelectorLoop {
        side,
        index,
        poll,
        events: Events::with_capacity(EVENTS_CAPACITY),
        registrations: Slab::new(),
        by_fd: HashMap::new(),
        rx,
    };
    trace!(name = %core.name(), side = side.label(), index, "selector loop running");

    while core.running() {
        selector.drain();

        match selector
            .poll
            .poll(&mut selector.events, Some(SELECT_TIMEOUT))
        {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(
                    name = %core.name(),
                    side = side.label(),
                    index,
                    error = %err,
                    "selector poll failed, exiting loop"
                );
                break;
            }
        }

        // tokens are collected first so the fired registrations can be
        // removed while iterating
        let ready: Vec<Token> = selector.events.iter().map(|event| event.token()).collect();
        for token in ready {
            if token == WAKE {
                continue;
            }
            if !core.running() {
                break;
            }
            let Some(registration) = selector.take(token) else {
                trace!(side = side.label(), index, "spurious readiness token");
                continue;
            };
            let Registration { handle, ops } = registration;
            if handle.is_closed() {
                trace!(side = side.label(), index, "dropping readiness for closed handle");
                continue;
            }
            // any readiness on the token (including hang-up or error)
            // dispatches the armed operation; the application observes the
            // failure on its next read or write
            match (side, ops) {
                (Side::Read, Ops::Connect) => finish_connect(&core, handle),
                (Side::Read, Ops::Read) => core.dispatch(handle, CallbackKind::ReadReady),
                (Side::Write, Ops::Write) => core.dispatch(handle, CallbackKind::WriteReady),
                (side, ops) => {
                    error!(side = side.label(), ?ops, "invalid readiness operation");
                }
            }
        }
    }

    trace!(name = %core.name(), side = side.label(), index, "selector loop exited");
}

enum ConnectOutcome {
    Connected,
    Pending,
    Failed(io::Error),
}

/// Resolve an in-flight non-blocking connect after its writability fired.
fn connect_outcome(stream: &TcpStream) -> ConnectOutcome {
    match stream.take_error() {
        Ok(Some(err)) => ConnectOutcome::Failed(err),
        Err(err) => ConnectOutcome::Failed(err),
        Ok(None) => match stream.peer_addr() {
            Ok(_) => ConnectOutcome::Connected,
            Err(err) if err.kind() == io::ErrorKind::NotConnected => ConnectOutcome::Pending,
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => ConnectOutcome::Pending,
            Err(err) => ConnectOutcome::Failed(err),
        },
    }
}

fn finish_connect(core: &Arc<MuxCore>, handle: Arc<SocketHandle>) {
    trace!(name = %core.name(), "handling connect");
    match connect_outcome(handle.channel()) {
        ConnectOutcome::Connected => {
            trace!(name = %core.name(), "dispatching connected action");
            core.dispatch(handle, CallbackKind::Connected);
        }
        ConnectOutcome::Pending => {
            // not expected for a one-shot connect arm, but harmless
            handle.select_for_connect();
        }
        ConnectOutcome::Failed(err) => {
            info!(
                name = %core.name(),
                error = %err,
                "unable to finish connection"
            );
            CONNECTS_FAILED.increment();
            handle.close_with(Some(err));
        }
    }
}
