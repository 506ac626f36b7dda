//! chanmux - Reactive TCP connection multiplexer.
//!
//! This crate watches many non-blocking TCP connections for readiness and
//! hands ready events to application-supplied handlers without ever running
//! application code on an I/O thread.
//!
//! # Architecture
//!
//! A [`ChannelMux`] owns `2 × Q` selector loops: `Q` read-side loops that
//! handle connect and read readiness, and `Q` write-side loops that handle
//! write readiness. Each loop is a dedicated thread that drains a
//! cross-thread registration queue, polls the OS for readiness, and submits
//! ready events to a bounded worker pool (the [`Dispatcher`]).
//!
//! Every connection is pinned to one loop pair for its whole life, so all
//! readiness traffic for a socket is serialized through one read loop and
//! one write loop. Interest is **one-shot**: when an event fires the loop
//! drops the registration before dispatching, and the application re-arms
//! with [`SocketHandle::select_for_read`] / [`SocketHandle::select_for_write`]
//! when it wants another event.
//!
//! # Quick Start
//!
//! ```ignore
//! use chanmux::{ChannelMux, FixedThreadPool};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(FixedThreadPool::new("app", 4, 1024));
//! let mux = ChannelMux::builder("app").dispatcher(pool).queues(2).build()?;
//! mux.start();
//!
//! // sink implements EventSink; connected() fires once the socket is up
//! mux.connect_to("127.0.0.1:9000".parse()?, sink)?;
//! ```
//!
//! The protocol layer that interprets bytes is out of scope; see the
//! `chanmux-buffer` crate for a buffered binary-protocol adapter built on
//! this contract.

mod builder;
mod dispatch;
mod error;
mod handle;
mod mux;
mod options;
mod registry;
mod selector;

pub mod metrics;

pub use builder::MuxBuilder;
pub use dispatch::{Callback, CallbackKind, Dispatcher, FixedThreadPool, RejectedCallback};
pub use error::Error;
pub use handle::{EventSink, SocketHandle};
pub use mux::ChannelMux;
pub use options::SocketOptions;
