//! The per-socket entity owned by the manager's table.

use crate::config::SocketOptions;
use crate::doio;
use crate::error::SocketError;
use crate::event::{AcceptEvent, ConnectEvent, IoEvent};
use crate::types::{AddressFamily, SocketId, SocketType};
use bitflags::bitflags;
use socket2::{Protocol, SockAddr};
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

/// MSS for IPv6 stream sockets sending at the minimum MTU:
/// 1280 - 40 (IPv6 header) - 20 (TCP header).
pub(crate) const IPV6_MIN_MSS: libc::c_int = 1220;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct SocketFlags: u32 {
        /// Read interest armed for a queued receive or accept.
        const PENDING_RECV = 1 << 0;
        /// Write interest armed for a queued send or pending connect.
        const PENDING_SEND = 1 << 1;
        const CONNECTED = 1 << 2;
        const CONNECTING = 1 << 3;
        const BOUND = 1 << 4;
        /// Open and counted in the active gauge.
        const ACTIVE = 1 << 5;
        const LISTENER = 1 << 6;
        /// Mark DSCP per packet through control messages.
        const PKT_DSCP = 1 << 7;
    }
}

pub(crate) struct Socket {
    pub(crate) id: SocketId,
    pub(crate) inner: socket2::Socket,
    pub(crate) family: AddressFamily,
    pub(crate) kind: SocketType,
    pub(crate) flags: SocketFlags,
    /// DSCP last applied through socket options.
    pub(crate) dscp: u8,
    pub(crate) peer: Option<SockAddr>,
    pub(crate) recv_queue: VecDeque<IoEvent>,
    pub(crate) send_queue: VecDeque<IoEvent>,
    pub(crate) connect: Option<ConnectEvent>,
    pub(crate) accept_queue: VecDeque<AcceptEvent>,
    pub(crate) references: u32,
    /// References held by callers (create, attach, accept); the rest of
    /// `references` belongs to queued events.
    pub(crate) external: u32,
}

impl Socket {
    /// Open a non-blocking native socket and apply the per-socket options.
    pub(crate) fn open(
        family: AddressFamily,
        kind: SocketType,
        options: &SocketOptions,
    ) -> Result<socket2::Socket, SocketError> {
        let protocol = match (family, kind) {
            (AddressFamily::Unix, _) => None,
            (_, SocketType::Stream) => Some(Protocol::TCP),
            (_, SocketType::Datagram) => Some(Protocol::UDP),
        };

        let inner = socket2::Socket::new(family.domain(), kind.as_type(), protocol)
            .map_err(|e| doio::classify_open(e.raw_os_error().unwrap_or(0)))?;

        if let Err(e) = inner.set_nonblocking(true) {
            tracing::error!(error = %e, "failed to make socket non-blocking");
            return Err(SocketError::from_io(&e));
        }

        configure(&inner, family, kind, options);
        Ok(inner)
    }

    pub(crate) fn new(
        id: SocketId,
        inner: socket2::Socket,
        family: AddressFamily,
        kind: SocketType,
        options: &SocketOptions,
    ) -> Self {
        let mut flags = SocketFlags::ACTIVE;
        if options.packet_dscp.unwrap_or(kind == SocketType::Datagram) {
            flags |= SocketFlags::PKT_DSCP;
        }

        Self {
            id,
            inner,
            family,
            kind,
            flags,
            dscp: 0,
            peer: None,
            recv_queue: VecDeque::new(),
            send_queue: VecDeque::new(),
            connect: None,
            accept_queue: VecDeque::new(),
            references: 1,
            external: 1,
        }
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.flags.contains(SocketFlags::CONNECTED)
    }

    #[inline]
    pub(crate) fn is_connecting(&self) -> bool {
        self.flags.contains(SocketFlags::CONNECTING)
    }

    #[inline]
    pub(crate) fn is_datagram(&self) -> bool {
        self.kind == SocketType::Datagram
    }

    /// Read and write interest this socket wants from the poller.
    ///
    /// Reads are held back while a connect is outstanding.
    pub(crate) fn desired_interest(&self) -> (bool, bool) {
        let read = self.flags.contains(SocketFlags::PENDING_RECV) && !self.is_connecting();
        let write = self.flags.contains(SocketFlags::PENDING_SEND);
        (read, write)
    }

    /// True when nothing is queued in any direction.
    pub(crate) fn is_idle(&self) -> bool {
        self.recv_queue.is_empty()
            && self.send_queue.is_empty()
            && self.connect.is_none()
            && self.accept_queue.is_empty()
    }

    /// Apply a DSCP value through socket options and remember it.
    pub(crate) fn apply_dscp(&mut self, dscp: u8) -> io::Result<()> {
        let tos = (dscp << 2) as libc::c_int;
        match self.family {
            AddressFamily::Inet => setsockopt_int(self.fd(), libc::IPPROTO_IP, libc::IP_TOS, tos)?,
            AddressFamily::Inet6 => {
                setsockopt_int(self.fd(), libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tos)?
            }
            AddressFamily::Unix => {
                return Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
            }
        }
        self.dscp = dscp;
        Ok(())
    }
}

/// Per-socket options applied right after open. Each one is optional: a
/// failure is logged and the socket stays usable.
fn configure(
    inner: &socket2::Socket,
    family: AddressFamily,
    kind: SocketType,
    options: &SocketOptions,
) {
    let fd = inner.as_raw_fd();

    if family == AddressFamily::Inet6 && kind == SocketType::Stream && options.use_min_mtu {
        if let Err(e) = set_min_mtu(fd) {
            tracing::warn!(fd, error = %e, "failed to set IPv6 minimum MTU");
        }
        if let Err(e) = setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_MAXSEG, IPV6_MIN_MSS) {
            tracing::warn!(fd, error = %e, "failed to clamp TCP_MAXSEG");
        }
    }

    if kind != SocketType::Datagram {
        return;
    }

    if options.timestamps
        && let Err(e) = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP, 1)
        && e.raw_os_error() != Some(libc::ENOPROTOOPT)
    {
        tracing::warn!(fd, error = %e, "failed to enable SO_TIMESTAMP");
    }

    if family == AddressFamily::Inet6
        && options.packet_info
        && let Err(e) = setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)
    {
        tracing::warn!(fd, error = %e, "failed to enable IPV6_RECVPKTINFO");
    }

    if options.receive_dscp {
        let result = match family {
            AddressFamily::Inet => setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_RECVTOS, 1),
            AddressFamily::Inet6 => setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVTCLASS, 1),
            AddressFamily::Unix => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(fd, error = %e, "failed to enable ingress DSCP");
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn set_min_mtu(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_IPV6, crate::ancillary::IPV6_USE_MIN_MTU, 1)
}

/// Linux has no minimum-MTU switch; pin the path MTU to the IPv6 minimum.
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn set_min_mtu(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MTU, 1280)
}

pub(crate) fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
