//! Core types shared by the socket manager and its sockets.

use bitflags::bitflags;
use socket2::{Domain, SockAddr, Type};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque socket identifier.
///
/// Returned when creating a socket or accepting a connection. Used to
/// identify the socket in every subsequent manager operation.
///
/// Internally encodes both a slot index and a generation counter so a stale
/// id never resolves to a socket that later reused the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) u64);

impl SocketId {
    /// Create a socket ID from a raw slot value (generation 0).
    ///
    /// This is primarily useful for testing purposes.
    #[inline]
    pub fn new(slot: usize) -> Self {
        Self(slot as u64)
    }

    #[inline]
    pub(crate) fn with_generation(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xFFFF_FFFF))
    }

    /// Get the slot index from this socket ID.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Get the raw u64 value of the socket ID, generation included.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slot(), self.generation())
    }
}

// ============================================================================
// Socket Kinds
// ============================================================================

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Unix,
}

impl AddressFamily {
    /// Family of a socket address, if it is one the manager handles.
    pub fn of(addr: &SockAddr) -> Option<Self> {
        match addr.family() as libc::c_int {
            libc::AF_INET => Some(AddressFamily::Inet),
            libc::AF_INET6 => Some(AddressFamily::Inet6),
            libc::AF_UNIX => Some(AddressFamily::Unix),
            _ => None,
        }
    }

    pub(crate) fn domain(self) -> Domain {
        match self {
            AddressFamily::Inet => Domain::IPV4,
            AddressFamily::Inet6 => Domain::IPV6,
            AddressFamily::Unix => Domain::UNIX,
        }
    }

    /// True for the IP families.
    #[inline]
    pub fn is_inet(self) -> bool {
        matches!(self, AddressFamily::Inet | AddressFamily::Inet6)
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "inet"),
            AddressFamily::Inet6 => write!(f, "inet6"),
            AddressFamily::Unix => write!(f, "unix"),
        }
    }
}

/// Transport type of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Connection oriented byte stream (TCP, unix stream).
    Stream,
    /// Message oriented datagrams (UDP, unix datagram).
    Datagram,
}

impl SocketType {
    pub(crate) fn as_type(self) -> Type {
        match self {
            SocketType::Stream => Type::STREAM,
            SocketType::Datagram => Type::DGRAM,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::Stream => write!(f, "stream"),
            SocketType::Datagram => write!(f, "datagram"),
        }
    }
}

impl FromStr for SocketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stream" | "tcp" => Ok(SocketType::Stream),
            "datagram" | "dgram" | "udp" => Ok(SocketType::Datagram),
            _ => Err(format!("unknown socket type: {s}")),
        }
    }
}

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Which queues a cancellation applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CancelFlags: u32 {
        const RECV = 1 << 0;
        const SEND = 1 << 1;
        const CONNECT = 1 << 2;
        const ACCEPT = 1 << 3;
        const ALL = Self::RECV.bits() | Self::SEND.bits() | Self::CONNECT.bits() | Self::ACCEPT.bits();
    }
}

bitflags! {
    /// Options for submitting receive, send and accept requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubmitFlags: u32 {
        /// Hand a synchronously completed event back to the caller instead
        /// of posting it to the owner task.
        const IMMEDIATE = 1 << 0;
        /// Sends only: make a single attempt and fail with `WouldBlock`
        /// rather than queueing.
        const NORETRY = 1 << 1;
    }
}

bitflags! {
    /// Options applied when binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindOptions: u32 {
        /// Set `SO_REUSEADDR` before binding a non-zero port.
        const REUSE_ADDRESS = 1 << 0;
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// One ready socket as reported by [`SocketManager::wait`].
///
/// [`SocketManager::wait`]: crate::SocketManager::wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub socket: SocketId,
    pub readable: bool,
    pub writable: bool,
}

/// Snapshot of the ready sets returned by a single `wait`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySet {
    pub(crate) ready: Vec<Readiness>,
}

impl ReadySet {
    pub fn iter(&self) -> impl Iterator<Item = &Readiness> {
        self.ready.iter()
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Whether the socket was reported readable.
    pub fn is_readable(&self, id: SocketId) -> bool {
        self.ready.iter().any(|r| r.socket == id && r.readable)
    }

    /// Whether the socket was reported writable.
    pub fn is_writable(&self, id: SocketId) -> bool {
        self.ready.iter().any(|r| r.socket == id && r.writable)
    }
}
