//! Socket events: submitted requests and their completions.

use crate::ancillary::{Metadata, PacketInfo};
use crate::buffer::Payload;
use crate::error::SocketError;
use crate::task::TaskRef;
use crate::types::SocketId;
use socket2::SockAddr;
use std::fmt;

/// Direction of an I/O event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Recv,
    Send,
}

/// A receive or send request.
///
/// While queued the event belongs to its socket; once finished it is posted
/// to the owner task (or handed back to the caller in immediate mode) with
/// its result, byte count, address and metadata filled in.
pub struct IoEvent {
    pub(crate) kind: IoKind,
    pub(crate) socket: SocketId,
    pub(crate) task: TaskRef,
    pub(crate) payload: Payload,
    pub(crate) n: usize,
    pub(crate) minimum: usize,
    pub(crate) address: Option<SockAddr>,
    pub(crate) metadata: Metadata,
    pub(crate) result: Result<(), SocketError>,
    /// Set while the event sits on a socket queue and holds a socket
    /// reference.
    pub(crate) attached: bool,
}

impl IoEvent {
    pub(crate) fn new(
        kind: IoKind,
        socket: SocketId,
        task: TaskRef,
        payload: Payload,
        minimum: usize,
    ) -> Self {
        Self {
            kind,
            socket,
            task,
            payload,
            n: 0,
            minimum,
            address: None,
            metadata: Metadata::default(),
            result: Ok(()),
            attached: false,
        }
    }

    pub fn kind(&self) -> IoKind {
        self.kind
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Bytes transferred so far.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Bytes a receive needs before it completes.
    pub fn minimum(&self) -> usize {
        self.minimum
    }

    pub fn result(&self) -> Result<(), SocketError> {
        self.result
    }

    /// Source address of a receive, destination of a send.
    pub fn address(&self) -> Option<&SockAddr> {
        self.address.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// The bytes this event carried: everything received into a region or
    /// buffer list, or the data of a send.
    pub fn data(&self) -> Vec<u8> {
        match &self.payload {
            Payload::List(list) => list.to_vec(),
            Payload::Region(region) => match self.kind {
                IoKind::Recv => region[..self.n.min(region.len())].to_vec(),
                IoKind::Send => region.clone(),
            },
        }
    }
}

impl fmt::Debug for IoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoEvent")
            .field("kind", &self.kind)
            .field("socket", &self.socket)
            .field("n", &self.n)
            .field("minimum", &self.minimum)
            .field("address", &self.address.as_ref().and_then(SockAddr::as_socket))
            .field("metadata", &self.metadata)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// A connect request.
pub struct ConnectEvent {
    pub(crate) socket: SocketId,
    pub(crate) task: TaskRef,
    pub(crate) address: SockAddr,
    pub(crate) result: Result<(), SocketError>,
}

impl ConnectEvent {
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn address(&self) -> &SockAddr {
        &self.address
    }

    pub fn result(&self) -> Result<(), SocketError> {
        self.result
    }
}

impl fmt::Debug for ConnectEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectEvent")
            .field("socket", &self.socket)
            .field("address", &self.address.as_socket())
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// An accept request on a listening socket.
pub struct AcceptEvent {
    pub(crate) socket: SocketId,
    pub(crate) task: TaskRef,
    pub(crate) accepted: Option<SocketId>,
    pub(crate) address: Option<SockAddr>,
    pub(crate) result: Result<(), SocketError>,
}

impl AcceptEvent {
    /// The listening socket.
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// The new connection, on success.
    pub fn accepted(&self) -> Option<SocketId> {
        self.accepted
    }

    /// Peer address of the new connection.
    pub fn address(&self) -> Option<&SockAddr> {
        self.address.as_ref()
    }

    pub fn result(&self) -> Result<(), SocketError> {
        self.result
    }
}

impl fmt::Debug for AcceptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptEvent")
            .field("socket", &self.socket)
            .field("accepted", &self.accepted)
            .field("address", &self.address.as_ref().and_then(SockAddr::as_socket))
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// A completed request as delivered to its owner task.
#[derive(Debug)]
pub enum SocketEvent {
    Recv(IoEvent),
    Send(IoEvent),
    Connect(ConnectEvent),
    Accept(AcceptEvent),
}

impl SocketEvent {
    pub fn socket(&self) -> SocketId {
        match self {
            SocketEvent::Recv(ev) | SocketEvent::Send(ev) => ev.socket,
            SocketEvent::Connect(ev) => ev.socket,
            SocketEvent::Accept(ev) => ev.socket,
        }
    }

    pub fn result(&self) -> Result<(), SocketError> {
        match self {
            SocketEvent::Recv(ev) | SocketEvent::Send(ev) => ev.result,
            SocketEvent::Connect(ev) => ev.result,
            SocketEvent::Accept(ev) => ev.result,
        }
    }

    /// The I/O event, if this is a receive or send completion.
    pub fn into_io(self) -> Option<IoEvent> {
        match self {
            SocketEvent::Recv(ev) | SocketEvent::Send(ev) => Some(ev),
            _ => None,
        }
    }
}

impl From<IoEvent> for SocketEvent {
    fn from(ev: IoEvent) -> Self {
        match ev.kind {
            IoKind::Recv => SocketEvent::Recv(ev),
            IoKind::Send => SocketEvent::Send(ev),
        }
    }
}

/// Outcome of submitting a request.
#[derive(Debug)]
pub enum Submission {
    /// The request is queued; its completion will be posted later.
    InProgress,
    /// The request completed and was posted to the owner task.
    Delivered,
    /// The request completed synchronously and is returned to the caller
    /// (immediate mode).
    Done(IoEvent),
}

impl Submission {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Submission::InProgress)
    }
}

/// Per-request options for a send.
#[derive(Debug, Clone, Default)]
pub struct SendMeta {
    /// Destination for an unconnected datagram socket.
    pub dest: Option<SockAddr>,
    /// Source address and outgoing interface (IPv6 datagrams).
    pub pktinfo: Option<PacketInfo>,
    /// DSCP to mark the packet with.
    pub dscp: Option<u8>,
    /// Send at the IPv6 minimum MTU.
    pub use_min_mtu: bool,
}

impl SendMeta {
    /// Send metadata with just a destination address.
    #[inline]
    pub fn new(dest: SockAddr) -> Self {
        Self {
            dest: Some(dest),
            ..Self::default()
        }
    }

    #[inline]
    pub fn with_pktinfo(mut self, pktinfo: PacketInfo) -> Self {
        self.pktinfo = Some(pktinfo);
        self
    }

    #[inline]
    pub fn with_dscp(mut self, dscp: u8) -> Self {
        self.dscp = Some(dscp);
        self
    }

    #[inline]
    pub fn with_min_mtu(mut self) -> Self {
        self.use_min_mtu = true;
        self
    }
}
