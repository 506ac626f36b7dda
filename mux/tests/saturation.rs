//! Integration tests for the dispatcher saturation policy.
//!
//! A rejected read dispatch must re-arm and retry on a later poll cycle
//! instead of dropping the event or killing the loop.

use chanmux::{
    Callback, CallbackKind, ChannelMux, Dispatcher, EventSink, FixedThreadPool, RejectedCallback,
    SocketHandle,
};
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Route selector and worker logs through RUST_LOG when debugging.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Sink whose `connected` callback occupies its worker until released,
/// wedging a single-threaded pool.
#[derive(Default)]
struct BlockingSink {
    handle: OnceLock<Arc<SocketHandle>>,
    connected: AtomicUsize,
    read_ready: AtomicUsize,
    closing: AtomicUsize,
    release: AtomicBool,
}

impl EventSink for BlockingSink {
    fn accepted(&self, _handle: &Arc<SocketHandle>) {}

    fn connected(&self, handle: &Arc<SocketHandle>) {
        self.handle.set(handle.clone()).ok();
        handle.select_for_read();
        self.connected.fetch_add(1, Ordering::SeqCst);
        // occupy the only worker until the test releases us
        while !self.release.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_ready(&self) {
        let handle = self.handle.get().unwrap();
        let mut channel = handle.channel();
        let mut buf = [0u8; 16];
        loop {
            match channel.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        self.read_ready.fetch_add(1, Ordering::SeqCst);
    }

    fn write_ready(&self) {}

    fn closing(&self, _reason: Option<io::Error>) {
        self.closing.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_saturated_pool_defers_read_dispatch() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"x").unwrap();
        let _ = done_rx.recv_timeout(Duration::from_secs(10));
        // second payload verifies the loop survived the rejection storm
        let _ = stream.write_all(b"y");
        thread::sleep(Duration::from_millis(500));
    });

    // one worker, rendezvous queue: submits succeed only when the worker
    // is parked waiting
    let pool = Arc::new(FixedThreadPool::new("sat", 1, 0));
    let mux = ChannelMux::builder("sat").dispatcher(pool).build().unwrap();
    mux.start();

    let sink = Arc::new(BlockingSink::default());
    mux.connect_to(addr, sink.clone()).unwrap();

    // the worker is now inside connected(); read readiness for the peer's
    // byte keeps getting rejected and re-armed
    assert!(wait_until(Duration::from_secs(3), || {
        sink.connected.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(sink.read_ready.load(Ordering::SeqCst), 0);
    assert!(mux.is_running());

    // free the worker; the deferred read must now be delivered
    sink.release.store(true, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(3), || {
        sink.read_ready.load(Ordering::SeqCst) == 1
    }));

    // the loop is still serving this connection
    let _ = done_tx.send(());
    sink.handle.get().unwrap().select_for_read();
    assert!(wait_until(Duration::from_secs(3), || {
        sink.read_ready.load(Ordering::SeqCst) >= 2
    }));

    mux.terminate();
    assert!(wait_until(Duration::from_secs(3), || {
        sink.closing.load(Ordering::SeqCst) == 1
    }));
    server.join().unwrap();
}

/// A panicking callback must be contained by the pool and must not affect
/// the selector loops or later callbacks.
#[derive(Default)]
struct PanickingSink {
    handle: OnceLock<Arc<SocketHandle>>,
    read_ready: AtomicUsize,
    closing: AtomicUsize,
}

impl EventSink for PanickingSink {
    fn accepted(&self, _handle: &Arc<SocketHandle>) {}

    fn connected(&self, handle: &Arc<SocketHandle>) {
        self.handle.set(handle.clone()).ok();
        handle.select_for_read();
        panic!("connected handler exploded");
    }

    fn read_ready(&self) {
        let handle = self.handle.get().unwrap();
        let mut channel = handle.channel();
        let mut buf = [0u8; 16];
        while let Ok(n) = channel.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
        self.read_ready.fetch_add(1, Ordering::SeqCst);
    }

    fn write_ready(&self) {}

    fn closing(&self, _reason: Option<io::Error>) {
        self.closing.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_callback_panic_is_contained() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"z").unwrap();
        let _ = done_rx.recv_timeout(Duration::from_secs(5));
    });

    let pool = Arc::new(FixedThreadPool::new("panic", 1, 16));
    let mux = ChannelMux::builder("panic")
        .dispatcher(pool)
        .build()
        .unwrap();
    mux.start();

    let sink = Arc::new(PanickingSink::default());
    mux.connect_to(addr, sink.clone()).unwrap();

    // the connected callback panicked after arming a read; the event must
    // still be delivered by the surviving worker
    assert!(wait_until(Duration::from_secs(3), || {
        sink.read_ready.load(Ordering::SeqCst) >= 1
    }));

    mux.terminate();
    assert!(wait_until(Duration::from_secs(3), || {
        sink.closing.load(Ordering::SeqCst) == 1
    }));
    let _ = done_tx.send(());
    server.join().unwrap();
}

/// Embedder-supplied dispatcher that refuses everything.
#[derive(Default)]
struct RejectingDispatcher {
    rejected: AtomicUsize,
    closing_rejected: AtomicUsize,
}

impl Dispatcher for RejectingDispatcher {
    fn submit(&self, callback: Callback) -> Result<(), RejectedCallback> {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        if callback.kind() == CallbackKind::Closing {
            self.closing_rejected.fetch_add(1, Ordering::SeqCst);
        }
        Err(RejectedCallback::from(callback))
    }
}

#[test]
fn test_always_rejecting_dispatcher_closes_connects() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (_stream, _) = listener.accept().unwrap();
        let _ = done_rx.recv_timeout(Duration::from_secs(5));
    });

    let dispatcher = Arc::new(RejectingDispatcher::default());
    let mux = ChannelMux::builder("reject")
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();
    mux.start();

    let sink = Arc::new(BlockingSink::default());
    mux.connect_to(addr, sink.clone()).unwrap();

    // the rejected connected callback closes the handle; its closing
    // notification is rejected too and dropped
    assert!(wait_until(Duration::from_secs(3), || {
        mux.open_handle_count() == 0
    }));
    assert!(dispatcher.rejected.load(Ordering::SeqCst) >= 2);
    assert_eq!(dispatcher.closing_rejected.load(Ordering::SeqCst), 1);
    assert_eq!(sink.connected.load(Ordering::SeqCst), 0);

    let _ = done_tx.send(());
    mux.terminate();
    server.join().unwrap();
}
