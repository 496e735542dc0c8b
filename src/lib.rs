//! Asynchronous socket manager.
//!
//! A single-threaded reactor over non-blocking BSD sockets. Callers submit
//! receive, send, connect, and accept requests against sockets owned by a
//! [`SocketManager`]; each request names an owner [`Task`] that receives the
//! completed event. Requests that cannot finish right away are queued per
//! socket and retried in order when the poller reports readiness.
//!
//! # Example
//!
//! ```no_run
//! use sockmgr::{
//!     AddressFamily, BindOptions, Buffer, BufferList, EventQueue, SocketEvent,
//!     SocketManager, SocketType, SubmitFlags, TaskRef,
//! };
//! use std::net::SocketAddr;
//! use std::time::Duration;
//!
//! let mut manager = SocketManager::new()?;
//! let queue = EventQueue::new();
//! let task: TaskRef = queue.clone();
//!
//! let sock = manager.create(AddressFamily::Inet, SocketType::Datagram)?;
//! let addr: SocketAddr = "127.0.0.1:5300".parse().unwrap();
//! manager.bind(sock, &addr.into(), BindOptions::empty())?;
//!
//! let buffers = BufferList::single(Buffer::with_capacity(512));
//! manager.recv(sock, buffers, 1, &task, SubmitFlags::empty())?;
//!
//! loop {
//!     manager.run_once(Some(Duration::from_millis(100)))?;
//!     while let Some(event) = queue.pop() {
//!         if let SocketEvent::Recv(ev) = event {
//!             println!("received {} bytes", ev.n());
//!         }
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod ancillary;
pub mod buffer;
pub mod builder;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod task;
pub mod types;

mod descriptor;
mod doio;
mod manager;
mod socket;

pub use ancillary::{Attributes, Metadata, PacketInfo};
pub use buffer::{Buffer, BufferList, Payload};
pub use builder::SocketManagerBuilder;
pub use config::{ConfigError, ManagerConfig, SocketOptions};
pub use error::{Result, SocketError};
pub use event::{AcceptEvent, ConnectEvent, IoEvent, IoKind, SendMeta, SocketEvent, Submission};
pub use manager::SocketManager;
pub use task::{EventQueue, Task, TaskRef};
pub use types::{
    AddressFamily, BindOptions, CancelFlags, Readiness, ReadySet, SocketId, SocketType,
    SubmitFlags,
};

pub use socket2::SockAddr;
