/// Errors surfaced by the multiplexer's public operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The builder was given zero selector queues.
    #[error("selector queue count must be > 0")]
    InvalidQueues,
    /// An underlying socket or poller operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
