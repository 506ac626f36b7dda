//! Multiplexer builder with fluent API.

use crate::dispatch::{Dispatcher, FixedThreadPool};
use crate::error::Error;
use crate::mux::ChannelMux;
use crate::options::SocketOptions;
use crate::selector::{self, Side};
use std::sync::Arc;
use std::thread;

const DEFAULT_POOL_DEPTH: usize = 1024;

/// Builder for a [`ChannelMux`].
///
/// # Example
///
/// ```ignore
/// use chanmux::{ChannelMux, FixedThreadPool, SocketOptions};
/// use std::sync::Arc;
///
/// let mux = ChannelMux::builder("app")
///     .options(SocketOptions::default())
///     .dispatcher(Arc::new(FixedThreadPool::new("app", 4, 1024)))
///     .queues(2)
///     .build()?;
/// ```
pub struct MuxBuilder {
    name: String,
    options: SocketOptions,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    queues: usize,
}

impl MuxBuilder {
    /// Create a builder. `name` tags selector threads and log lines.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: SocketOptions::default(),
            dispatcher: None,
            queues: 1,
        }
    }

    /// Set the socket option policy for new sockets.
    pub fn options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the worker pool that runs application callbacks.
    ///
    /// Defaults to a [`FixedThreadPool`] sized to the machine's
    /// parallelism.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the number of selector queue pairs (`queues` read loops plus
    /// `queues` write loops). Must be at least 1. Default: 1.
    pub fn queues(mut self, queues: usize) -> Self {
        self.queues = queues;
        self
    }

    /// Allocate the pollers and registration queues and assemble the
    /// multiplexer. Loops are not launched until `start()`.
    pub fn build(self) -> Result<ChannelMux, Error> {
        if self.queues == 0 {
            return Err(Error::InvalidQueues);
        }
        let dispatcher = self.dispatcher.unwrap_or_else(|| {
            let threads = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            Arc::new(FixedThreadPool::new(&self.name, threads, DEFAULT_POOL_DEPTH))
        });

        let mut read_fronts = Vec::with_capacity(self.queues);
        let mut write_fronts = Vec::with_capacity(self.queues);
        let mut seeds = Vec::with_capacity(self.queues * 2);
        for index in 0..self.queues {
            let (front, seed) = selector::loop_parts(Side::Read, index)?;
            read_fronts.push(front);
            seeds.push(seed);
            let (front, seed) = selector::loop_parts(Side::Write, index)?;
            write_fronts.push(front);
            seeds.push(seed);
        }

        Ok(ChannelMux::from_parts(
            self.name,
            self.options,
            dispatcher,
            read_fronts,
            write_fronts,
            seeds,
        ))
    }
}
