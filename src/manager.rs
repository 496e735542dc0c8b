//! The socket manager: a single-threaded readiness reactor.
//!
//! The manager owns every socket in a slab indexed by [`SocketId`] slot,
//! tracks which sockets want read or write readiness, and turns readiness
//! into I/O rounds:
//!
//! ```text
//! submit ──► attempt now (queue empty) ──► done ──► post to owner
//!                │ would block
//!                ▼
//!          queue + arm interest ──► wait() ──► dispatch() ──► attempt ...
//! ```
//!
//! Closing is two-phase. When a socket's last reference goes away its
//! interest is dropped at once and the slot becomes a tombstone holding the
//! descriptor; the descriptor is closed and the slot freed at the start of
//! the next [`dispatch`](SocketManager::dispatch).

use crate::buffer::{BufferList, Payload};
use crate::builder::SocketManagerBuilder;
use crate::config::{ManagerConfig, SocketOptions};
use crate::doio::{self, Classified, IoStatus};
use crate::error::{Result, SocketError};
use crate::event::{AcceptEvent, ConnectEvent, IoEvent, IoKind, SendMeta, SocketEvent, Submission};
use crate::ancillary::Attributes;
use crate::metrics::*;
use crate::socket::{Socket, SocketFlags};
use crate::task::{TaskRef, same_task};
use crate::types::{
    AddressFamily, BindOptions, CancelFlags, Readiness, ReadySet, SocketId, SocketType,
    SubmitFlags,
};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::SockAddr;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// One table entry.
struct Slot {
    /// Generation counter to detect stale SocketIds after slot reuse.
    generation: u32,
    /// The live socket; `None` once close is pending.
    socket: Option<Box<Socket>>,
    /// Descriptor awaiting close at the next dispatch pass.
    pending_close: Option<socket2::Socket>,
    /// Interest currently registered with the poller.
    registered: Option<Interest>,
    /// Queued for an interest sync before the next poll.
    dirty: bool,
    /// Force a reregister even if the interest is unchanged.
    rearm: bool,
}

/// Single-threaded socket reactor.
///
/// All socket operations take `&mut self` and run to completion. The only
/// call that blocks is [`wait`](Self::wait). Sockets and owner tasks are
/// bound to the thread that created the manager.
pub struct SocketManager {
    poll: Poll,
    events: Events,
    table: Slab<Slot>,
    next_generation: u32,
    /// Slots whose interest must be synced before the next poll.
    dirty: Vec<usize>,
    /// Tombstoned slots to reclaim at the next dispatch.
    closing: Vec<usize>,
    /// Highest descriptor of a live socket.
    maxfd: Option<RawFd>,
    config: ManagerConfig,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketManager")
            .field("sockets", &self.len())
            .field("close_pending", &self.closing.len())
            .field("max_fd", &self.maxfd)
            .finish_non_exhaustive()
    }
}

impl SocketManager {
    /// Create a manager with default settings.
    pub fn new() -> io::Result<Self> {
        Self::with_config(ManagerConfig::default())
    }

    pub fn builder() -> SocketManagerBuilder {
        SocketManagerBuilder::new()
    }

    pub fn with_config(config: ManagerConfig) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(config.events_capacity),
            table: Slab::with_capacity(config.max_sockets.min(4096)),
            next_generation: 0,
            dirty: Vec::new(),
            closing: Vec::new(),
            maxfd: None,
            config,
            _not_send: PhantomData,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ========================================================================
    // Table
    // ========================================================================

    fn socket_mut(&mut self, id: SocketId) -> Result<&mut Socket> {
        self.table
            .get_mut(id.slot())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.socket.as_deref_mut())
            .ok_or(SocketError::InvalidSocket)
    }

    fn socket_ref(&self, id: SocketId) -> Result<&Socket> {
        self.table
            .get(id.slot())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.socket.as_deref())
            .ok_or(SocketError::InvalidSocket)
    }

    /// Schedule an interest sync for a slot.
    fn touch(&mut self, key: usize) {
        if let Some(slot) = self.table.get_mut(key)
            && !slot.dirty
        {
            slot.dirty = true;
            self.dirty.push(key);
        }
    }

    fn insert(
        &mut self,
        inner: socket2::Socket,
        family: AddressFamily,
        kind: SocketType,
        options: &SocketOptions,
    ) -> Result<SocketId> {
        if self.len() >= self.config.max_sockets {
            tracing::warn!(max = self.config.max_sockets, "socket table full");
            return Err(SocketError::NoResources);
        }

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let entry = self.table.vacant_entry();
        let id = SocketId::with_generation(entry.key(), generation);
        let sock = Socket::new(id, inner, family, kind, options);
        let fd = sock.fd();

        entry.insert(Slot {
            generation,
            socket: Some(Box::new(sock)),
            pending_close: None,
            registered: None,
            dirty: false,
            rearm: false,
        });

        self.maxfd = Some(self.maxfd.map_or(fd, |max| max.max(fd)));
        SOCKET_OPEN.increment();
        SOCKETS_ACTIVE.increment();
        Ok(id)
    }

    /// Last reference gone: drop interest now, close the descriptor at the
    /// next dispatch pass.
    fn destroy(&mut self, key: usize) {
        let Some(slot) = self.table.get_mut(key) else {
            return;
        };
        let Some(sock) = slot.socket.take() else {
            return;
        };
        debug_assert!(sock.is_idle(), "destroying a socket with queued events");

        let fd = sock.fd();
        if slot.registered.take().is_some()
            && let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd))
        {
            tracing::warn!(fd, error = %e, "failed to deregister closing socket");
        }

        if sock.flags.contains(SocketFlags::ACTIVE) {
            SOCKETS_ACTIVE.decrement();
        }

        let Socket { id, inner, .. } = *sock;
        slot.pending_close = Some(inner);
        slot.rearm = false;
        self.closing.push(key);
        SOCKET_CLOSE.increment();

        if self.maxfd == Some(fd) {
            self.maxfd = self
                .table
                .iter()
                .filter_map(|(_, slot)| slot.socket.as_ref().map(|s| s.fd()))
                .max();
        }

        tracing::debug!(socket = %id, fd, "socket close pending");
    }

    /// Close descriptors and free slots tombstoned since the last pass.
    fn reclaim(&mut self) {
        for key in self.closing.drain(..) {
            if let Some(slot) = self.table.try_remove(key) {
                tracing::trace!(slot = key, "reclaimed socket slot");
                drop(slot.pending_close);
            }
        }
    }

    /// Bring the poller's registrations in line with what sockets want.
    fn sync_interest(&mut self) {
        let registry = self.poll.registry();

        for key in self.dirty.drain(..) {
            let Some(slot) = self.table.get_mut(key) else {
                continue;
            };
            slot.dirty = false;
            let rearm = std::mem::take(&mut slot.rearm);
            let Some(sock) = slot.socket.as_ref() else {
                continue;
            };

            let desired = match sock.desired_interest() {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };
            let fd = sock.fd();
            let mut source = SourceFd(&fd);

            let result = match (slot.registered, desired) {
                (None, None) => Ok(()),
                (None, Some(interest)) => registry.register(&mut source, Token(key), interest),
                (Some(_), None) => registry.deregister(&mut source),
                (Some(current), Some(interest)) if rearm || current != interest => {
                    registry.reregister(&mut source, Token(key), interest)
                }
                (Some(_), Some(_)) => Ok(()),
            };

            match result {
                Ok(()) => slot.registered = desired,
                Err(e) => {
                    tracing::error!(socket = %sock.id, fd, error = %e, "failed to update interest");
                }
            }
        }
    }

    // ========================================================================
    // Reactor
    // ========================================================================

    /// Block until at least one socket is ready or the timeout elapses.
    ///
    /// Returns a snapshot of the ready sockets; an interrupted wait returns
    /// an empty set.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<ReadySet> {
        self.sync_interest();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ReadySet::default()),
            Err(e) => return Err(e),
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            let key = event.token().0;
            let Some(slot) = self.table.get(key) else {
                continue;
            };
            if slot.socket.is_none() {
                continue;
            }
            ready.push(Readiness {
                socket: SocketId::with_generation(key, slot.generation),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed() || event.is_error(),
            });
        }

        Ok(ReadySet { ready })
    }

    /// Run one I/O round for every ready socket.
    ///
    /// Sockets closed earlier are reclaimed first. Stale or close-pending
    /// entries in `ready` are skipped.
    pub fn dispatch(&mut self, ready: &ReadySet) {
        self.reclaim();

        for readiness in ready.iter() {
            if readiness.readable {
                self.service_read(readiness.socket);
            }
            if readiness.writable {
                self.service_write(readiness.socket);
            }
        }
    }

    /// `wait` followed by `dispatch`. Returns the number of ready sockets.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let ready = self.wait(timeout)?;
        self.dispatch(&ready);
        Ok(ready.len())
    }

    fn service_read(&mut self, id: SocketId) {
        let Ok(sock) = self.socket_mut(id) else {
            tracing::trace!(socket = %id, "readable event for closed socket");
            return;
        };
        if !sock.flags.contains(SocketFlags::PENDING_RECV) || sock.is_connecting() {
            return;
        }
        sock.flags.remove(SocketFlags::PENDING_RECV);

        if sock.flags.contains(SocketFlags::LISTENER) {
            self.internal_accept(id);
        } else {
            self.internal_recv(id);
        }
        self.rearm(id);
    }

    fn service_write(&mut self, id: SocketId) {
        let Ok(sock) = self.socket_mut(id) else {
            tracing::trace!(socket = %id, "writable event for closed socket");
            return;
        };
        if !sock.flags.contains(SocketFlags::PENDING_SEND) {
            return;
        }
        sock.flags.remove(SocketFlags::PENDING_SEND);

        if sock.is_connecting() {
            self.internal_connect(id);
        } else {
            self.internal_send(id);
        }
        self.rearm(id);
    }

    /// After servicing: resync interest, or destroy the socket if the round
    /// released its last reference.
    fn rearm(&mut self, id: SocketId) {
        let key = id.slot();
        let Ok(sock) = self.socket_mut(id) else {
            return;
        };
        if sock.references == 0 {
            self.destroy(key);
            return;
        }
        if let Some(slot) = self.table.get_mut(key) {
            slot.rearm = true;
        }
        self.touch(key);
    }

    fn internal_recv(&mut self, id: SocketId) {
        let Ok(sock) = self.socket_mut(id) else {
            return;
        };

        while let Some(mut ev) = sock.recv_queue.pop_front() {
            match doio::doio_recv(sock, &mut ev) {
                IoStatus::Soft => {
                    sock.recv_queue.push_front(ev);
                    break;
                }
                IoStatus::Eof => {
                    tracing::debug!(socket = %id, queued = sock.recv_queue.len() + 1, "eof");
                    ev.result = Err(SocketError::Eof);
                    complete_io(sock, ev);
                    while let Some(mut ev) = sock.recv_queue.pop_front() {
                        ev.result = Err(SocketError::Eof);
                        complete_io(sock, ev);
                    }
                    break;
                }
                IoStatus::Success | IoStatus::Hard => complete_io(sock, ev),
            }
        }

        if !sock.recv_queue.is_empty() {
            sock.flags |= SocketFlags::PENDING_RECV;
        }
    }

    fn internal_send(&mut self, id: SocketId) {
        let Ok(sock) = self.socket_mut(id) else {
            return;
        };

        while let Some(mut ev) = sock.send_queue.pop_front() {
            match doio::doio_send(sock, &mut ev) {
                IoStatus::Soft => {
                    sock.send_queue.push_front(ev);
                    break;
                }
                _ => complete_io(sock, ev),
            }
        }

        if !sock.send_queue.is_empty() {
            sock.flags |= SocketFlags::PENDING_SEND;
        }
    }

    /// Deferred completion of a non-blocking connect.
    fn internal_connect(&mut self, id: SocketId) {
        let Ok(sock) = self.socket_mut(id) else {
            return;
        };
        let Some(mut ev) = sock.connect.take() else {
            sock.flags.remove(SocketFlags::CONNECTING);
            return;
        };

        let errno = match sock.inner.take_error() {
            Ok(None) => 0,
            Ok(Some(e)) | Err(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
        };

        if errno == 0 {
            sock.flags.remove(SocketFlags::CONNECTING);
            sock.flags |= SocketFlags::CONNECTED | SocketFlags::BOUND;
            SOCKET_CONNECT.increment();
            tracing::debug!(socket = %id, "connected");
        } else {
            let err = match doio::classify_connect(errno) {
                Some(Classified::Soft) => {
                    sock.connect = Some(ev);
                    sock.flags |= SocketFlags::PENDING_SEND;
                    return;
                }
                Some(Classified::Hard(err)) => err,
                None => {
                    tracing::error!(socket = %id, errno, "unexpected connect error");
                    SocketError::Unexpected(errno)
                }
            };
            sock.flags.remove(SocketFlags::CONNECTING);
            SOCKET_CONNECT_FAIL.increment();
            tracing::debug!(socket = %id, error = %err, "connect failed");
            ev.result = Err(err);
        }

        sock.references -= 1;
        if !sock.send_queue.is_empty() {
            sock.flags |= SocketFlags::PENDING_SEND;
        }
        let task = ev.task.clone();
        task.post(SocketEvent::Connect(ev));
    }

    fn internal_accept(&mut self, id: SocketId) {
        let options = self.config.socket.clone();

        loop {
            let Ok(sock) = self.socket_mut(id) else {
                return;
            };
            let Some(mut ev) = sock.accept_queue.pop_front() else {
                break;
            };
            let family = sock.family;

            let (conn, peer) = match sock.inner.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(0);
                    match doio::classify_accept(errno) {
                        Classified::Soft => {
                            if !doio::is_soft(errno) {
                                tracing::warn!(socket = %id, errno, "transient accept failure");
                            }
                            sock.accept_queue.push_front(ev);
                            sock.flags |= SocketFlags::PENDING_RECV;
                            break;
                        }
                        Classified::Hard(err) => {
                            tracing::error!(socket = %id, errno, "accept failed");
                            SOCKET_ACCEPT_FAIL.increment();
                            ev.result = Err(err);
                            sock.references -= 1;
                            let task = ev.task.clone();
                            task.post(SocketEvent::Accept(ev));
                            continue;
                        }
                    }
                }
            };

            let accepted = conn
                .set_nonblocking(true)
                .map_err(|e| SocketError::from_io(&e))
                .and_then(|()| self.insert(conn, family, SocketType::Stream, &options));

            match accepted {
                Ok(new_id) => {
                    if let Ok(new_sock) = self.socket_mut(new_id) {
                        new_sock.flags |= SocketFlags::CONNECTED | SocketFlags::BOUND;
                        new_sock.peer = Some(peer.clone());
                    }
                    SOCKET_ACCEPT.increment();
                    tracing::debug!(socket = %id, accepted = %new_id, "accepted connection");
                    ev.accepted = Some(new_id);
                    ev.address = Some(peer);
                }
                Err(err) => {
                    SOCKET_ACCEPT_FAIL.increment();
                    ev.result = Err(err);
                }
            }

            if let Ok(sock) = self.socket_mut(id) {
                sock.references -= 1;
            }
            let task = ev.task.clone();
            task.post(SocketEvent::Accept(ev));
        }

        if let Ok(sock) = self.socket_mut(id)
            && !sock.accept_queue.is_empty()
        {
            sock.flags |= SocketFlags::PENDING_RECV;
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a socket with the manager's default options. The caller holds
    /// the initial reference.
    pub fn create(&mut self, family: AddressFamily, kind: SocketType) -> Result<SocketId> {
        let options = self.config.socket.clone();
        self.create_with(family, kind, &options)
    }

    pub fn create_with(
        &mut self,
        family: AddressFamily,
        kind: SocketType,
        options: &SocketOptions,
    ) -> Result<SocketId> {
        let inner = Socket::open(family, kind, options).inspect_err(|_| {
            SOCKET_OPEN_FAIL.increment();
        })?;
        let id = self.insert(inner, family, kind, options)?;
        tracing::debug!(socket = %id, %family, %kind, "socket created");
        Ok(id)
    }

    /// Take another reference to a socket.
    pub fn attach(&mut self, id: SocketId) -> Result<SocketId> {
        let sock = self.socket_mut(id)?;
        sock.external += 1;
        sock.references += 1;
        Ok(id)
    }

    /// Release a caller reference. The socket closes once no references
    /// remain; every queued event holds one of its own, which only its
    /// completion releases.
    pub fn detach(&mut self, id: SocketId) -> Result<()> {
        let sock = self.socket_mut(id)?;
        if sock.external == 0 {
            return Err(SocketError::InvalidState("no external reference to release"));
        }
        sock.external -= 1;
        sock.references -= 1;
        if sock.references == 0 {
            self.destroy(id.slot());
        }
        Ok(())
    }

    pub fn bind(&mut self, id: SocketId, addr: &SockAddr, options: BindOptions) -> Result<()> {
        let sock = self.socket_mut(id)?;
        if sock.flags.contains(SocketFlags::BOUND) {
            return Err(SocketError::AlreadyBound);
        }
        if AddressFamily::of(addr) != Some(sock.family) {
            return Err(SocketError::FamilyMismatch);
        }

        let port = addr.as_socket().map_or(0, |a| a.port());
        if options.contains(BindOptions::REUSE_ADDRESS)
            && port != 0
            && let Err(e) = sock.inner.set_reuse_address(true)
        {
            tracing::warn!(socket = %id, error = %e, "failed to set SO_REUSEADDR");
        }

        if let Err(e) = sock.inner.bind(addr) {
            SOCKET_BIND_FAIL.increment();
            let err = doio::classify_bind(e.raw_os_error().unwrap_or(0));
            tracing::debug!(socket = %id, error = %err, "bind failed");
            return Err(err);
        }

        sock.flags |= SocketFlags::BOUND;
        tracing::debug!(socket = %id, addr = ?addr.as_socket(), "bound");
        Ok(())
    }

    /// Put a bound stream socket into the listening state. A backlog of 0
    /// selects the system maximum.
    pub fn listen(&mut self, id: SocketId, backlog: u32) -> Result<()> {
        let sock = self.socket_mut(id)?;
        if sock.kind != SocketType::Stream {
            return Err(SocketError::InvalidState("only stream sockets listen"));
        }
        if sock.flags.contains(SocketFlags::LISTENER) {
            return Err(SocketError::InvalidState("socket is already listening"));
        }

        let backlog = if backlog == 0 {
            libc::SOMAXCONN
        } else {
            backlog.min(i32::MAX as u32) as i32
        };
        sock.inner
            .listen(backlog)
            .map_err(|e| SocketError::from_io(&e))?;
        sock.flags |= SocketFlags::LISTENER;
        Ok(())
    }

    /// Queue an accept on a listening socket. The completion carries the
    /// new connection's id, which starts with one reference owned by the
    /// receiver of the event.
    pub fn accept(&mut self, id: SocketId, task: &TaskRef) -> Result<()> {
        let sock = self.socket_mut(id)?;
        if !sock.flags.contains(SocketFlags::LISTENER) {
            return Err(SocketError::InvalidState("socket is not listening"));
        }

        sock.accept_queue.push_back(AcceptEvent {
            socket: id,
            task: task.clone(),
            accepted: None,
            address: None,
            result: Ok(()),
        });
        sock.references += 1;
        sock.flags |= SocketFlags::PENDING_RECV;
        self.touch(id.slot());
        Ok(())
    }

    /// Start connecting to `addr`. The outcome is posted to `task` as a
    /// connect event, either right away or once the handshake resolves.
    ///
    /// Errors the connect table does not know are returned directly and no
    /// event is posted.
    pub fn connect(&mut self, id: SocketId, addr: &SockAddr, task: &TaskRef) -> Result<()> {
        let sock = self.socket_mut(id)?;
        if AddressFamily::of(addr) != Some(sock.family) {
            return Err(SocketError::FamilyMismatch);
        }
        if addr.as_socket().is_some_and(|a| a.ip().is_multicast()) {
            return Err(SocketError::Multicast);
        }
        if sock.is_connecting() || sock.connect.is_some() {
            return Err(SocketError::InvalidState("connect already in progress"));
        }
        if sock.flags.contains(SocketFlags::LISTENER) {
            return Err(SocketError::InvalidState("socket is listening"));
        }

        sock.peer = Some(addr.clone());
        let mut ev = ConnectEvent {
            socket: id,
            task: task.clone(),
            address: addr.clone(),
            result: Ok(()),
        };

        let errno = match sock.inner.connect(addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
        };

        // A datagram connect has no handshake to wait for.
        if errno == 0 || (sock.is_datagram() && errno == libc::EINPROGRESS) {
            sock.flags |= SocketFlags::CONNECTED | SocketFlags::BOUND;
            SOCKET_CONNECT.increment();
            tracing::debug!(socket = %id, "connected");
        } else {
            match doio::classify_connect(errno) {
                Some(Classified::Soft) => {
                    sock.flags |= SocketFlags::CONNECTING | SocketFlags::PENDING_SEND;
                    sock.connect = Some(ev);
                    sock.references += 1;
                    tracing::trace!(socket = %id, "connect in progress");
                    self.touch(id.slot());
                    return Ok(());
                }
                Some(Classified::Hard(err)) => {
                    SOCKET_CONNECT_FAIL.increment();
                    tracing::debug!(socket = %id, error = %err, "connect failed");
                    ev.result = Err(err);
                }
                None => {
                    SOCKET_CONNECT_FAIL.increment();
                    tracing::error!(socket = %id, errno, "unexpected connect error");
                    return Err(SocketError::Unexpected(errno));
                }
            }
        }

        let task = ev.task.clone();
        task.post(SocketEvent::Connect(ev));
        Ok(())
    }

    // ========================================================================
    // Receive / Send
    // ========================================================================

    /// Receive into a buffer list.
    ///
    /// `minimum` is the byte count the event must reach before it completes.
    /// Datagram sockets always use 1. For stream sockets 0 means the whole
    /// available space of `buffers`, and larger values are clamped to it.
    pub fn recv(
        &mut self,
        id: SocketId,
        buffers: BufferList,
        minimum: usize,
        task: &TaskRef,
        flags: SubmitFlags,
    ) -> Result<Submission> {
        self.submit_recv(id, Payload::List(buffers), minimum, task, flags)
    }

    /// Receive into a single flat region; the completed event's `n` says how
    /// much of it was filled.
    pub fn recv_region(
        &mut self,
        id: SocketId,
        region: Vec<u8>,
        minimum: usize,
        task: &TaskRef,
        flags: SubmitFlags,
    ) -> Result<Submission> {
        self.submit_recv(id, Payload::Region(region), minimum, task, flags)
    }

    fn submit_recv(
        &mut self,
        id: SocketId,
        payload: Payload,
        minimum: usize,
        task: &TaskRef,
        flags: SubmitFlags,
    ) -> Result<Submission> {
        let sock = self.socket_mut(id)?;
        if sock.flags.contains(SocketFlags::LISTENER) {
            return Err(SocketError::InvalidState("socket is listening"));
        }

        let capacity = payload.recv_capacity(0);
        let minimum = match sock.kind {
            SocketType::Datagram => 1,
            SocketType::Stream if minimum == 0 => capacity,
            SocketType::Stream => minimum.min(capacity),
        };
        let mut ev = IoEvent::new(IoKind::Recv, id, task.clone(), payload, minimum);

        if sock.recv_queue.is_empty() && !sock.is_connecting() {
            match doio::doio_recv(sock, &mut ev) {
                IoStatus::Soft => {}
                IoStatus::Eof => {
                    ev.result = Err(SocketError::Eof);
                    return Ok(finish(ev, flags));
                }
                IoStatus::Success | IoStatus::Hard => return Ok(finish(ev, flags)),
            }
        }

        ev.attached = true;
        sock.references += 1;
        sock.recv_queue.push_back(ev);
        sock.flags |= SocketFlags::PENDING_RECV;
        tracing::trace!(socket = %id, queued = sock.recv_queue.len(), "recv queued");
        self.touch(id.slot());
        Ok(Submission::InProgress)
    }

    /// Send a buffer list to the connected peer.
    pub fn send(
        &mut self,
        id: SocketId,
        buffers: BufferList,
        task: &TaskRef,
        flags: SubmitFlags,
    ) -> Result<Submission> {
        self.submit_send(id, Payload::List(buffers), &SendMeta::default(), task, flags)
    }

    /// Send a buffer list with a destination and per-packet options.
    pub fn send_to(
        &mut self,
        id: SocketId,
        buffers: BufferList,
        meta: &SendMeta,
        task: &TaskRef,
        flags: SubmitFlags,
    ) -> Result<Submission> {
        self.submit_send(id, Payload::List(buffers), meta, task, flags)
    }

    /// Send a single flat region.
    pub fn send_region(
        &mut self,
        id: SocketId,
        region: Vec<u8>,
        meta: &SendMeta,
        task: &TaskRef,
        flags: SubmitFlags,
    ) -> Result<Submission> {
        self.submit_send(id, Payload::Region(region), meta, task, flags)
    }

    fn submit_send(
        &mut self,
        id: SocketId,
        payload: Payload,
        meta: &SendMeta,
        task: &TaskRef,
        flags: SubmitFlags,
    ) -> Result<Submission> {
        let sock = self.socket_mut(id)?;
        if sock.flags.contains(SocketFlags::LISTENER) {
            return Err(SocketError::InvalidState("socket is listening"));
        }

        if meta.dscp.is_some_and(|dscp| dscp > 0x3f) {
            return Err(SocketError::InvalidState("dscp must fit in six bits"));
        }

        let mut ev = IoEvent::new(IoKind::Send, id, task.clone(), payload, 0);

        ev.address = match (sock.kind, meta.dest.as_ref()) {
            (SocketType::Stream, Some(_)) => {
                return Err(SocketError::InvalidState("stream sockets send to their peer"));
            }
            (SocketType::Stream, None) => sock.peer.clone(),
            (SocketType::Datagram, Some(dest)) => {
                if AddressFamily::of(dest) != Some(sock.family) {
                    return Err(SocketError::FamilyMismatch);
                }
                Some(dest.clone())
            }
            (SocketType::Datagram, None) if sock.is_connected() => sock.peer.clone(),
            (SocketType::Datagram, None) => {
                return Err(SocketError::InvalidState("destination address required"));
            }
        };

        if let Some(mut info) = meta.pktinfo {
            let scoped = ev
                .address
                .as_ref()
                .and_then(SockAddr::as_socket)
                .is_some_and(|a| is_site_or_link_local(&a));
            if !scoped {
                tracing::trace!(socket = %id, ifindex = info.ifindex, "pktinfo ifindex set to 0");
                info.ifindex = 0;
            }
            ev.metadata.attributes |= Attributes::PKTINFO;
            ev.metadata.pktinfo = Some(info);
        }
        if let Some(dscp) = meta.dscp {
            ev.metadata.attributes |= Attributes::DSCP;
            ev.metadata.dscp = dscp;
        }
        if meta.use_min_mtu {
            ev.metadata.attributes |= Attributes::USE_MIN_MTU;
        }

        let idle = sock.send_queue.is_empty() && !sock.is_connecting();
        let status = if idle {
            doio::doio_send(sock, &mut ev)
        } else {
            IoStatus::Soft
        };

        match status {
            IoStatus::Soft if flags.contains(SubmitFlags::NORETRY) => {
                ev.result = Err(SocketError::WouldBlock);
                Ok(finish(ev, flags))
            }
            IoStatus::Soft => {
                ev.attached = true;
                sock.references += 1;
                sock.send_queue.push_back(ev);
                sock.flags |= SocketFlags::PENDING_SEND;
                tracing::trace!(socket = %id, queued = sock.send_queue.len(), "send queued");
                self.touch(id.slot());
                Ok(Submission::InProgress)
            }
            _ => Ok(finish(ev, flags)),
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel queued requests. With `owner` set only that task's requests
    /// are cancelled; others keep their place. Each cancelled request is
    /// posted with `Canceled`.
    pub fn cancel(&mut self, id: SocketId, owner: Option<&TaskRef>, how: CancelFlags) -> Result<()> {
        let sock = self.socket_mut(id)?;
        let owned = |task: &TaskRef| owner.is_none_or(|o| same_task(o, task));

        if how.contains(CancelFlags::RECV) {
            for mut ev in std::mem::take(&mut sock.recv_queue) {
                if owned(&ev.task) {
                    ev.result = Err(SocketError::Canceled);
                    complete_io(sock, ev);
                } else {
                    sock.recv_queue.push_back(ev);
                }
            }
        }

        if how.contains(CancelFlags::SEND) {
            for mut ev in std::mem::take(&mut sock.send_queue) {
                if owned(&ev.task) {
                    ev.result = Err(SocketError::Canceled);
                    complete_io(sock, ev);
                } else {
                    sock.send_queue.push_back(ev);
                }
            }
        }

        if how.contains(CancelFlags::CONNECT)
            && let Some(mut ev) = sock.connect.take()
        {
            if owned(&ev.task) {
                sock.flags.remove(SocketFlags::CONNECTING);
                sock.references -= 1;
                ev.result = Err(SocketError::Canceled);
                let task = ev.task.clone();
                task.post(SocketEvent::Connect(ev));
            } else {
                sock.connect = Some(ev);
            }
        }

        if how.contains(CancelFlags::ACCEPT) {
            for mut ev in std::mem::take(&mut sock.accept_queue) {
                if owned(&ev.task) {
                    sock.references -= 1;
                    ev.result = Err(SocketError::Canceled);
                    let task = ev.task.clone();
                    task.post(SocketEvent::Accept(ev));
                } else {
                    sock.accept_queue.push_back(ev);
                }
            }
        }

        if sock.recv_queue.is_empty() && sock.accept_queue.is_empty() {
            sock.flags.remove(SocketFlags::PENDING_RECV);
        }
        if sock.send_queue.is_empty() && sock.connect.is_none() {
            sock.flags.remove(SocketFlags::PENDING_SEND);
        }

        if sock.references == 0 {
            self.destroy(id.slot());
        } else {
            self.touch(id.slot());
        }
        Ok(())
    }

    // ========================================================================
    // Options and Queries
    // ========================================================================

    /// Mark all traffic of an IP socket with a DSCP value.
    pub fn set_dscp(&mut self, id: SocketId, dscp: u8) -> Result<()> {
        if dscp > 0x3f {
            return Err(SocketError::InvalidState("dscp must fit in six bits"));
        }
        let sock = self.socket_mut(id)?;
        if !sock.family.is_inet() {
            return Err(SocketError::FamilyNotSupported);
        }
        sock.apply_dscp(dscp).map_err(|e| SocketError::from_io(&e))
    }

    /// Restrict an IPv6 socket to IPv6 traffic.
    pub fn set_ipv6_only(&mut self, id: SocketId, only_v6: bool) -> Result<()> {
        let sock = self.socket_mut(id)?;
        if sock.family != AddressFamily::Inet6 {
            return Err(SocketError::FamilyMismatch);
        }
        sock.inner
            .set_only_v6(only_v6)
            .map_err(|e| SocketError::from_io(&e))
    }

    /// Local address (`getsockname`).
    pub fn local_addr(&self, id: SocketId) -> Result<SockAddr> {
        let sock = self.socket_ref(id)?;
        sock.inner.local_addr().map_err(|e| SocketError::from_io(&e))
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self, id: SocketId) -> Result<SockAddr> {
        let sock = self.socket_ref(id)?;
        if !sock.is_connected() {
            return Err(SocketError::NotConnected);
        }
        sock.peer.clone().ok_or(SocketError::NotConnected)
    }

    pub fn socket_type(&self, id: SocketId) -> Result<SocketType> {
        Ok(self.socket_ref(id)?.kind)
    }

    pub fn family(&self, id: SocketId) -> Result<AddressFamily> {
        Ok(self.socket_ref(id)?.family)
    }

    pub fn is_bound(&self, id: SocketId) -> Result<bool> {
        Ok(self.socket_ref(id)?.flags.contains(SocketFlags::BOUND))
    }

    pub fn is_connected(&self, id: SocketId) -> Result<bool> {
        Ok(self.socket_ref(id)?.is_connected())
    }

    pub fn raw_fd(&self, id: SocketId) -> Result<RawFd> {
        Ok(self.socket_ref(id)?.fd())
    }

    /// Current reference count, queued events included.
    pub fn references(&self, id: SocketId) -> Result<u32> {
        Ok(self.socket_ref(id)?.references)
    }

    /// Queued (receive, send) events.
    pub fn queued(&self, id: SocketId) -> Result<(usize, usize)> {
        let sock = self.socket_ref(id)?;
        Ok((sock.recv_queue.len(), sock.send_queue.len()))
    }

    /// Whether the socket is armed for (read, write) readiness.
    pub fn interest(&self, id: SocketId) -> Result<(bool, bool)> {
        Ok(self.socket_ref(id)?.desired_interest())
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        self.table.len() - self.closing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sockets whose descriptor will be closed at the next dispatch.
    pub fn close_pending(&self) -> usize {
        self.closing.len()
    }

    /// Highest descriptor among live sockets.
    pub fn max_fd(&self) -> Option<RawFd> {
        self.maxfd
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        let mut live = 0;
        for (_, slot) in self.table.iter() {
            if let Some(sock) = slot.socket.as_ref() {
                live += 1;
                if sock.flags.contains(SocketFlags::ACTIVE) {
                    SOCKETS_ACTIVE.decrement();
                }
            }
        }
        if live > 0 {
            tracing::warn!(live, "socket manager dropped with open sockets");
        }
    }
}

/// Complete a dequeued I/O event: release its socket reference and post it.
fn complete_io(sock: &mut Socket, mut ev: IoEvent) {
    if ev.attached {
        ev.attached = false;
        sock.references -= 1;
    }
    let task = ev.task.clone();
    task.post(SocketEvent::from(ev));
}

/// Deliver a synchronously completed event: back to the caller in immediate
/// mode, otherwise to the owner task.
fn finish(ev: IoEvent, flags: SubmitFlags) -> Submission {
    if flags.contains(SubmitFlags::IMMEDIATE) {
        return Submission::Done(ev);
    }
    let task = ev.task.clone();
    task.post(SocketEvent::from(ev));
    Submission::Delivered
}

fn is_site_or_link_local(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V6(ip) => {
            let prefix = ip.segments()[0] & 0xffc0;
            prefix == 0xfe80 || prefix == 0xfec0
        }
        IpAddr::V4(_) => false,
    }
}
