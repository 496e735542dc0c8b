//! Single I/O attempts and the errno classification tables.
//!
//! Every attempt ends in one of four states:
//!
//! - `Success`: the event is complete
//! - `Soft`: retry later; the event stays queued
//! - `Hard`: the event failed; its result holds the classification
//! - `Eof`: a stream peer closed its write side
//!
//! Classification happens only here. Callers forward the result unchanged.

use crate::ancillary::{self, Attributes, ControlBlock, ControlBuffer, RECV_CONTROL_LEN};
use crate::descriptor::{recv_fragments, send_fragments};
use crate::error::SocketError;
use crate::event::IoEvent;
use crate::metrics::{SOCKET_RECV_FAIL, SOCKET_SEND_FAIL};
use crate::socket::{Socket, SocketFlags};
use crate::types::{AddressFamily, SocketType};
use socket2::SockAddr;
use std::io;
use std::mem;

/// Immediate retries of a send interrupted by a signal.
pub(crate) const NRETRIES: usize = 10;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStatus {
    Success,
    Soft,
    Hard,
    Eof,
}

/// Verdict of a classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classified {
    Soft,
    Hard(SocketError),
}

#[inline]
pub(crate) fn is_soft(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR || errno == 0
}

#[inline]
fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Soft unless the socket is connected. An unconnected datagram socket can
/// see asynchronous errors caused by some earlier peer; they say nothing
/// about the current request.
#[inline]
fn soft_or_hard(connected: bool, err: SocketError) -> Classified {
    if connected {
        Classified::Hard(err)
    } else {
        Classified::Soft
    }
}

pub(crate) fn classify_recv(errno: i32, connected: bool) -> Classified {
    if is_soft(errno) {
        return Classified::Soft;
    }
    match errno {
        libc::ECONNREFUSED => soft_or_hard(connected, SocketError::ConnectionRefused),
        libc::ENETUNREACH => soft_or_hard(connected, SocketError::NetworkUnreachable),
        libc::EHOSTUNREACH => soft_or_hard(connected, SocketError::HostUnreachable),
        libc::EHOSTDOWN => soft_or_hard(connected, SocketError::HostDown),
        libc::EADDRNOTAVAIL => soft_or_hard(connected, SocketError::AddressNotAvailable),
        libc::ENOBUFS => Classified::Hard(SocketError::NoResources),
        // ICMP parameter problems and friends.
        libc::ENOPROTOOPT | libc::EPROTO | libc::EINVAL => {
            soft_or_hard(connected, SocketError::HostUnreachable)
        }
        other => Classified::Hard(SocketError::from_errno(other)),
    }
}

pub(crate) fn classify_send(errno: i32, connected: bool) -> Classified {
    if is_soft(errno) {
        return Classified::Soft;
    }
    match errno {
        libc::ECONNREFUSED => soft_or_hard(connected, SocketError::ConnectionRefused),
        other => match writer_error(other) {
            Some(err) => Classified::Hard(err),
            None => Classified::Hard(SocketError::from_errno(other)),
        },
    }
}

/// Conditions that always end a write.
fn writer_error(errno: i32) -> Option<SocketError> {
    let err = match errno {
        libc::EACCES => SocketError::PermissionDenied,
        libc::EAFNOSUPPORT => SocketError::AddressNotAvailable,
        libc::EADDRNOTAVAIL => SocketError::AddressNotAvailable,
        libc::EHOSTUNREACH => SocketError::HostUnreachable,
        libc::EHOSTDOWN => SocketError::HostUnreachable,
        libc::ENETUNREACH => SocketError::NetworkUnreachable,
        libc::ENOBUFS => SocketError::NoResources,
        libc::EPERM => SocketError::HostUnreachable,
        libc::EPIPE => SocketError::NotConnected,
        libc::ECONNRESET => SocketError::ConnectionReset,
        _ => return None,
    };
    Some(err)
}

/// Connect outcome for an errno, `None` when the value is not one connect
/// is expected to produce.
pub(crate) fn classify_connect(errno: i32) -> Option<Classified> {
    if is_soft(errno) || errno == libc::EINPROGRESS {
        return Some(Classified::Soft);
    }
    match errno {
        libc::ECONNREFUSED => Some(Classified::Hard(SocketError::ConnectionRefused)),
        libc::ETIMEDOUT => Some(Classified::Hard(SocketError::TimedOut)),
        other => writer_error(other).map(Classified::Hard),
    }
}

pub(crate) fn classify_accept(errno: i32) -> Classified {
    if is_soft(errno) {
        return Classified::Soft;
    }
    match errno {
        libc::ENFILE
        | libc::EMFILE
        | libc::ENOBUFS
        | libc::ENOMEM
        | libc::ECONNRESET
        | libc::ECONNABORTED
        | libc::EHOSTUNREACH
        | libc::EHOSTDOWN
        | libc::ENETUNREACH
        | libc::ENETDOWN
        | libc::ECONNREFUSED
        | libc::EPROTO => Classified::Soft,
        other => Classified::Hard(SocketError::Unexpected(other)),
    }
}

pub(crate) fn classify_open(errno: i32) -> SocketError {
    match errno {
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS => SocketError::NoResources,
        libc::EPROTONOSUPPORT | libc::EPFNOSUPPORT | libc::EAFNOSUPPORT | libc::EINVAL => {
            SocketError::FamilyNotSupported
        }
        other => SocketError::Unexpected(other),
    }
}

pub(crate) fn classify_bind(errno: i32) -> SocketError {
    match errno {
        libc::EACCES => SocketError::PermissionDenied,
        libc::EADDRNOTAVAIL => SocketError::AddressNotAvailable,
        libc::EADDRINUSE => SocketError::AddressInUse,
        libc::EINVAL => SocketError::AlreadyBound,
        other => SocketError::Unexpected(other),
    }
}

fn hard(ev: &mut IoEvent, err: SocketError) -> IoStatus {
    if let SocketError::Unexpected(errno) = err {
        tracing::error!(socket = %ev.socket, errno, "unexpected socket error");
    }
    ev.result = Err(err);
    IoStatus::Hard
}

/// One receive attempt for the event at the head of the receive queue.
pub(crate) fn doio_recv(sock: &mut Socket, ev: &mut IoEvent) -> IoStatus {
    let datagram = sock.is_datagram();
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut control = ControlBuffer::new();
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };

    let mut frags = recv_fragments(&mut ev.payload, ev.n);
    let read_count = frags.total();
    if read_count == 0 {
        ev.result = Ok(());
        return IoStatus::Success;
    }

    if datagram {
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    }
    msg.msg_iov = frags.as_mut_ptr();
    msg.msg_iovlen = frags.count() as _;
    msg.msg_control = control.as_mut_ptr();
    msg.msg_controllen = RECV_CONTROL_LEN as _;

    let cc = unsafe { libc::recvmsg(sock.fd(), &mut msg, 0) };

    if cc < 0 {
        let errno = last_errno();
        return match classify_recv(errno, sock.is_connected()) {
            Classified::Soft => {
                tracing::trace!(socket = %ev.socket, errno, "recv soft error");
                IoStatus::Soft
            }
            Classified::Hard(err) => {
                SOCKET_RECV_FAIL.increment();
                hard(ev, err)
            }
        };
    }

    if sock.kind == SocketType::Stream && cc == 0 {
        return IoStatus::Eof;
    }

    if datagram {
        let addr = unsafe { SockAddr::new(storage, msg.msg_namelen) };
        if sock.family.is_inet() && addr.as_socket().is_some_and(|a| a.port() == 0) {
            tracing::debug!(socket = %ev.socket, "dropping datagram from port 0");
            return IoStatus::Soft;
        }
        ev.address = Some(addr);
    } else {
        ev.address = sock.peer.clone();
    }

    ev.metadata.apply_msg_flags(msg.msg_flags);
    for message in ancillary::parse(&msg) {
        ev.metadata.absorb(message);
    }

    let cc = cc as usize;
    ev.payload.commit_recv(cc);
    ev.n += cc;

    tracing::trace!(socket = %ev.socket, cc, n = ev.n, minimum = ev.minimum, "recv");

    if cc != read_count && ev.n < ev.minimum {
        return IoStatus::Soft;
    }

    ev.result = Ok(());
    IoStatus::Success
}

/// Counts a failed `sendmsg` call and says whether to issue another. At most
/// `NRETRIES` calls are made in total.
fn retry_interrupted(errno: i32, attempts: &mut usize) -> bool {
    *attempts += 1;
    errno == libc::EINTR && *attempts < NRETRIES
}

/// One send attempt for the event at the head of the send queue.
pub(crate) fn doio_send(sock: &mut Socket, ev: &mut IoEvent) -> IoStatus {
    let datagram = sock.is_datagram();
    let mut control = ControlBlock::new();
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };

    // Per-socket marking happens before the fragments borrow the payload.
    if ev.metadata.attributes.contains(Attributes::DSCP) {
        let dscp = ev.metadata.dscp;
        if datagram && sock.flags.contains(SocketFlags::PKT_DSCP) {
            if !control.push_dscp(sock.family, dscp) {
                tracing::debug!(socket = %ev.socket, "no room for DSCP control message");
            }
        } else if sock.dscp != dscp
            && let Err(e) = sock.apply_dscp(dscp)
        {
            tracing::warn!(socket = %ev.socket, dscp, error = %e, "failed to set DSCP");
        }
    }

    if datagram && sock.family == AddressFamily::Inet6 {
        if ev.metadata.attributes.contains(Attributes::PKTINFO)
            && let Some(info) = ev.metadata.pktinfo.as_ref()
        {
            control.push_pktinfo(info);
        }
        if ev.metadata.attributes.contains(Attributes::USE_MIN_MTU) {
            control.push_use_min_mtu();
        }
    }

    let mut frags = send_fragments(&ev.payload, ev.n);
    let write_count = frags.total();
    if write_count == 0 && !datagram {
        ev.result = Ok(());
        return IoStatus::Success;
    }

    if !sock.is_connected()
        && let Some(addr) = ev.address.as_ref()
    {
        msg.msg_name = addr.as_ptr() as *mut libc::c_void;
        msg.msg_namelen = addr.len();
    }
    msg.msg_iov = frags.as_mut_ptr();
    msg.msg_iovlen = frags.count() as _;
    if !control.is_empty() {
        msg.msg_control = control.as_mut_ptr();
        msg.msg_controllen = control.len() as _;
    }

    let mut attempts = 0;
    let cc = loop {
        let cc = unsafe { libc::sendmsg(sock.fd(), &msg, SEND_FLAGS) };
        if cc >= 0 {
            break cc as usize;
        }

        let errno = last_errno();
        if retry_interrupted(errno, &mut attempts) {
            continue;
        }

        return match classify_send(errno, sock.is_connected()) {
            Classified::Soft => {
                tracing::trace!(socket = %ev.socket, errno, "send soft error");
                IoStatus::Soft
            }
            Classified::Hard(err) => {
                SOCKET_SEND_FAIL.increment();
                hard(ev, err)
            }
        };
    };

    ev.n += cc;
    tracing::trace!(socket = %ev.socket, cc, n = ev.n, write_count, "send");

    if cc != write_count {
        return IoStatus::Soft;
    }

    ev.result = Ok(());
    IoStatus::Success
}
