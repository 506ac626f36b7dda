//! Integration tests for outbound connects.

use chanmux::{ChannelMux, EventSink, FixedThreadPool, SocketHandle};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Route selector and worker logs through RUST_LOG when debugging.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll `cond` until it holds or the deadline passes.
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

/// Get an address that refuses connections.
fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[derive(Default)]
struct CountingSink {
    connected: AtomicUsize,
    closing: AtomicUsize,
    reasons: Mutex<Vec<String>>,
}

impl EventSink for CountingSink {
    fn accepted(&self, _handle: &Arc<SocketHandle>) {}

    fn connected(&self, _handle: &Arc<SocketHandle>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn read_ready(&self) {}

    fn write_ready(&self) {}

    fn closing(&self, reason: Option<io::Error>) {
        if let Some(err) = &reason {
            self.reasons.lock().unwrap().push(err.to_string());
        }
        self.closing.fetch_add(1, Ordering::SeqCst);
    }
}

fn new_mux(name: &str) -> ChannelMux {
    let pool = Arc::new(FixedThreadPool::new(name, 2, 64));
    ChannelMux::builder(name).dispatcher(pool).build().unwrap()
}

#[test]
fn test_connect_success() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (_stream, _) = listener.accept().unwrap();
        // hold the connection open until the test is done
        let _ = done_rx.recv_timeout(Duration::from_secs(5));
    });

    let mux = new_mux("connect-ok");
    mux.start();
    let sink = Arc::new(CountingSink::default());
    mux.connect_to(addr, sink.clone()).unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        sink.connected.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(mux.open_handle_count(), 1);
    assert_eq!(sink.closing.load(Ordering::SeqCst), 0);

    mux.terminate();
    assert!(wait_until(Duration::from_secs(3), || {
        sink.closing.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(sink.connected.load(Ordering::SeqCst), 1);
    assert_eq!(mux.open_handle_count(), 0);

    let _ = done_tx.send(());
    server.join().unwrap();
}

#[test]
fn test_connect_refused() {
    init_logging();
    let addr = refused_addr();

    let mux = new_mux("connect-refused");
    mux.start();
    let sink = Arc::new(CountingSink::default());
    mux.connect_to(addr, sink.clone()).unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        sink.closing.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(sink.connected.load(Ordering::SeqCst), 0);
    assert!(!sink.reasons.lock().unwrap().is_empty());
    assert_eq!(mux.open_handle_count(), 0);

    // no duplicate closing later
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.closing.load(Ordering::SeqCst), 1);

    mux.terminate();
}

/// Sink that drains the channel and re-arms from inside its own
/// `read_ready` callback.
#[derive(Default)]
struct RearmingSink {
    handle: OnceLock<Arc<SocketHandle>>,
    read_ready: AtomicUsize,
    bytes: AtomicUsize,
    closing: AtomicUsize,
}

impl EventSink for RearmingSink {
    fn accepted(&self, _handle: &Arc<SocketHandle>) {}

    fn connected(&self, handle: &Arc<SocketHandle>) {
        self.handle.set(handle.clone()).ok();
        handle.select_for_read();
    }

    fn read_ready(&self) {
        let handle = self.handle.get().unwrap();
        let mut channel = handle.channel();
        let mut buf = [0u8; 64];
        loop {
            match channel.read(&mut buf) {
                Ok(0) => {
                    handle.close();
                    return;
                }
                Ok(n) => {
                    self.bytes.fetch_add(n, Ordering::SeqCst);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    handle.close();
                    return;
                }
            }
        }
        self.read_ready.fetch_add(1, Ordering::SeqCst);
        handle.select_for_read();
    }

    fn write_ready(&self) {}

    fn closing(&self, _reason: Option<io::Error>) {
        self.closing.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_rearm_from_read_callback() {
    use std::io::Write;

    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"a").unwrap();
        thread::sleep(Duration::from_millis(200));
        stream.write_all(b"b").unwrap();
        let _ = done_rx.recv_timeout(Duration::from_secs(5));
    });

    let mux = new_mux("rearm");
    mux.start();
    let sink = Arc::new(RearmingSink::default());
    mux.connect_to(addr, sink.clone()).unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        sink.bytes.load(Ordering::SeqCst) == 2
    }));
    assert!(sink.read_ready.load(Ordering::SeqCst) >= 2);

    let _ = done_tx.send(());
    mux.terminate();
    assert!(wait_until(Duration::from_secs(3), || {
        sink.closing.load(Ordering::SeqCst) == 1
    }));
    server.join().unwrap();
}
