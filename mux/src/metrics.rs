//! Multiplexer metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "mux_handles_open",
    description = "Number of connection handles currently in the live set"
)]
pub static HANDLES_OPEN: Gauge = Gauge::new();

#[metric(
    name = "mux_connects_initiated",
    description = "Total outbound connects initiated"
)]
pub static CONNECTS_INITIATED: Counter = Counter::new();

#[metric(
    name = "mux_connects_failed",
    description = "Total outbound connects that failed to complete"
)]
pub static CONNECTS_FAILED: Counter = Counter::new();

#[metric(
    name = "mux_sockets_adopted",
    description = "Total inbound sockets adopted from external listeners"
)]
pub static SOCKETS_ADOPTED: Counter = Counter::new();

#[metric(
    name = "mux_dispatch_rejected",
    description = "Total callbacks rejected by a saturated dispatcher"
)]
pub static DISPATCH_REJECTED: Counter = Counter::new();
