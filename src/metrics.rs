//! eventline runtime metrics.
//!
//! Connection lifecycle and byte counters, exposed via metriken for
//! Prometheus exposition by an embedding admin server.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "eventline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "eventline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "eventline/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "eventline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "eventline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "eventline/accept/dropped",
    description = "Accepted sockets dropped because the connection table was full"
)]
pub static ACCEPT_DROPPED: Counter = Counter::new();
