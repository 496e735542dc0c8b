//! Socket statistics.

use metriken::{Counter, Gauge, metric};

#[metric(name = "socket_open", description = "Sockets opened")]
pub static SOCKET_OPEN: Counter = Counter::new();

#[metric(name = "socket_open_fail", description = "Socket open failures")]
pub static SOCKET_OPEN_FAIL: Counter = Counter::new();

#[metric(name = "socket_close", description = "Sockets closed")]
pub static SOCKET_CLOSE: Counter = Counter::new();

#[metric(name = "socket_bind_fail", description = "Bind failures")]
pub static SOCKET_BIND_FAIL: Counter = Counter::new();

#[metric(name = "socket_connect", description = "Connections established")]
pub static SOCKET_CONNECT: Counter = Counter::new();

#[metric(name = "socket_connect_fail", description = "Connect failures")]
pub static SOCKET_CONNECT_FAIL: Counter = Counter::new();

#[metric(name = "socket_accept", description = "Connections accepted")]
pub static SOCKET_ACCEPT: Counter = Counter::new();

#[metric(name = "socket_accept_fail", description = "Accept failures")]
pub static SOCKET_ACCEPT_FAIL: Counter = Counter::new();

#[metric(name = "socket_send_fail", description = "Send failures")]
pub static SOCKET_SEND_FAIL: Counter = Counter::new();

#[metric(name = "socket_recv_fail", description = "Receive failures")]
pub static SOCKET_RECV_FAIL: Counter = Counter::new();

#[metric(name = "sockets_active", description = "Currently open sockets")]
pub static SOCKETS_ACTIVE: Gauge = Gauge::new();
