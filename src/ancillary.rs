//! Ancillary (control message) metadata.
//!
//! Receive side: the kernel returns control messages alongside a datagram.
//! [`parse`] walks them and yields typed [`ControlMessage`] values which are
//! folded into the event's [`Metadata`].
//!
//! Send side: [`ControlBlock`] assembles the control messages that travel
//! with an outgoing datagram (destination interface, minimum MTU hint,
//! DSCP marking).

use crate::types::AddressFamily;
use bitflags::bitflags;
use std::mem;
use std::net::Ipv6Addr;
use std::ptr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Room the send path needs: pktinfo, min-MTU and traffic class messages,
/// each counted twice for alignment slack.
pub(crate) const SEND_CONTROL_LEN: usize = 2 * (40 + 24 + 24) + 1;

/// Room the receive path reserves: pktinfo, timestamp and traffic class.
pub(crate) const RECV_CONTROL_LEN: usize = 2 * (40 + 32 + 24) + 1;

const CONTROL_CAPACITY: usize = 256;

const _: () = assert!(SEND_CONTROL_LEN <= CONTROL_CAPACITY);
const _: () = assert!(RECV_CONTROL_LEN <= CONTROL_CAPACITY);

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) const IPV6_USE_MIN_MTU: libc::c_int = 42;

bitflags! {
    /// Metadata items present on an event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Attributes: u32 {
        /// The datagram was larger than the receive buffers.
        const TRUNC = 1 << 0;
        /// Control data was truncated.
        const CTRUNC = 1 << 1;
        const PKTINFO = 1 << 2;
        const TIMESTAMP = 1 << 3;
        const DSCP = 1 << 4;
        /// The datagram was addressed to a multicast group.
        const MULTICAST = 1 << 5;
        /// Send with the IPv6 minimum MTU.
        const USE_MIN_MTU = 1 << 6;
    }
}

/// IPv6 packet information: the local address and interface of a received
/// datagram, or the source address and outgoing interface of a sent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub addr: Ipv6Addr,
    pub ifindex: u32,
}

/// Side-channel values attached to one I/O event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub attributes: Attributes,
    pub pktinfo: Option<PacketInfo>,
    pub timestamp: Option<SystemTime>,
    /// Differentiated services code point (upper six bits of the ToS byte).
    pub dscp: u8,
}

impl Metadata {
    /// Interface index the datagram arrived on, when known.
    pub fn ifindex(&self) -> Option<u32> {
        self.pktinfo.map(|p| p.ifindex)
    }

    pub fn is_multicast(&self) -> bool {
        self.attributes.contains(Attributes::MULTICAST)
    }

    pub fn is_truncated(&self) -> bool {
        self.attributes.contains(Attributes::TRUNC)
    }

    pub(crate) fn apply_msg_flags(&mut self, flags: libc::c_int) {
        if flags & libc::MSG_TRUNC != 0 {
            self.attributes |= Attributes::TRUNC;
        }
        if flags & libc::MSG_CTRUNC != 0 {
            self.attributes |= Attributes::CTRUNC;
        }
    }

    pub(crate) fn absorb(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::PacketInfo(info) => {
                self.attributes |= Attributes::PKTINFO;
                if info.addr.is_multicast() {
                    self.attributes |= Attributes::MULTICAST;
                }
                self.pktinfo = Some(info);
            }
            ControlMessage::Timestamp(at) => {
                self.attributes |= Attributes::TIMESTAMP;
                self.timestamp = Some(at);
            }
            ControlMessage::Dscp(dscp) => {
                self.attributes |= Attributes::DSCP;
                self.dscp = dscp;
            }
        }
    }
}

/// A recognised control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    PacketInfo(PacketInfo),
    Timestamp(SystemTime),
    Dscp(u8),
}

/// Aligned storage for a control message block.
#[repr(C, align(8))]
pub(crate) struct ControlBuffer {
    bytes: [u8; CONTROL_CAPACITY],
}

impl ControlBuffer {
    pub(crate) fn new() -> Self {
        Self {
            bytes: [0u8; CONTROL_CAPACITY],
        }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.bytes.as_mut_ptr() as *mut libc::c_void
    }
}

/// Walk the control messages of a completed `recvmsg`.
///
/// `msg` must describe a control block this crate owns.
pub(crate) fn parse(msg: &libc::msghdr) -> Vec<ControlMessage> {
    let mut found = Vec::new();
    if msg.msg_control.is_null() || (msg.msg_controllen as usize) < mem::size_of::<libc::cmsghdr>()
    {
        return found;
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = ptr::read_unaligned(cmsg);
            let data = libc::CMSG_DATA(cmsg);

            match (hdr.cmsg_level, hdr.cmsg_type) {
                (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                    let info = ptr::read_unaligned(data as *const libc::in6_pktinfo);
                    found.push(ControlMessage::PacketInfo(PacketInfo {
                        addr: Ipv6Addr::from(info.ipi6_addr.s6_addr),
                        ifindex: info.ipi6_ifindex as u32,
                    }));
                }
                (libc::SOL_SOCKET, libc::SCM_TIMESTAMP) => {
                    let tv = ptr::read_unaligned(data as *const libc::timeval);
                    let at = UNIX_EPOCH
                        + Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32).saturating_mul(1000));
                    found.push(ControlMessage::Timestamp(at));
                }
                (libc::IPPROTO_IPV6, libc::IPV6_TCLASS) => {
                    let tclass = ptr::read_unaligned(data as *const libc::c_int);
                    found.push(ControlMessage::Dscp(((tclass as u32 & 0xff) >> 2) as u8));
                }
                (libc::IPPROTO_IP, libc::IP_TOS) => {
                    let tos = *data;
                    found.push(ControlMessage::Dscp(tos >> 2));
                }
                _ => {}
            }

            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }

    found
}

/// Control messages for one outgoing datagram.
pub(crate) struct ControlBlock {
    buf: ControlBuffer,
    len: usize,
}

impl ControlBlock {
    pub(crate) fn new() -> Self {
        Self {
            buf: ControlBuffer::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.buf.as_mut_ptr()
    }

    /// Append one control message carrying `value`. Returns false when the
    /// block has no room left.
    pub(crate) fn push<T: Copy>(&mut self, level: libc::c_int, kind: libc::c_int, value: T) -> bool {
        let size = mem::size_of::<T>() as libc::c_uint;
        let space = unsafe { libc::CMSG_SPACE(size) } as usize;
        if self.len + space > CONTROL_CAPACITY {
            return false;
        }

        unsafe {
            let cmsg = self.buf.bytes.as_mut_ptr().add(self.len) as *mut libc::cmsghdr;
            (*cmsg).cmsg_level = level;
            (*cmsg).cmsg_type = kind;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size) as _;
            ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                libc::CMSG_DATA(cmsg),
                size as usize,
            );
        }

        self.len += space;
        true
    }

    /// Destination packet information (IPv6 only).
    pub(crate) fn push_pktinfo(&mut self, info: &PacketInfo) -> bool {
        let mut raw: libc::in6_pktinfo = unsafe { mem::zeroed() };
        raw.ipi6_addr.s6_addr = info.addr.octets();
        raw.ipi6_ifindex = info.ifindex as _;
        self.push(libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, raw)
    }

    /// Per-packet DSCP marking through the ToS byte or traffic class.
    pub(crate) fn push_dscp(&mut self, family: AddressFamily, dscp: u8) -> bool {
        let tos = dscp << 2;
        match family {
            AddressFamily::Inet => self.push(libc::IPPROTO_IP, libc::IP_TOS, tos),
            AddressFamily::Inet6 => {
                self.push(libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tos as libc::c_int)
            }
            AddressFamily::Unix => false,
        }
    }

    /// Ask for the IPv6 minimum MTU on this packet. Only the BSD stacks
    /// support this per packet.
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    pub(crate) fn push_use_min_mtu(&mut self) -> bool {
        let on: libc::c_int = 1;
        self.push(libc::IPPROTO_IPV6, IPV6_USE_MIN_MTU, on)
    }

    #[cfg(not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    pub(crate) fn push_use_min_mtu(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msghdr_for(block: &mut ControlBlock) -> libc::msghdr {
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = block.as_mut_ptr();
        msg.msg_controllen = block.len() as _;
        msg
    }

    #[test]
    fn control_lengths_match_reserved_space() {
        assert_eq!(SEND_CONTROL_LEN, 177);
        assert_eq!(RECV_CONTROL_LEN, 193);
    }

    #[test]
    fn outgoing_block_parses_back() {
        let mut block = ControlBlock::new();
        let info = PacketInfo {
            addr: "ff02::1".parse().unwrap(),
            ifindex: 3,
        };
        assert!(block.push_pktinfo(&info));
        assert!(block.push_dscp(AddressFamily::Inet6, 46));
        assert!(!block.is_empty());

        let msg = msghdr_for(&mut block);
        let parsed = parse(&msg);
        assert_eq!(
            parsed,
            vec![ControlMessage::PacketInfo(info), ControlMessage::Dscp(46)]
        );

        let mut meta = Metadata::default();
        for m in parsed {
            meta.absorb(m);
        }
        assert!(meta.attributes.contains(Attributes::PKTINFO | Attributes::DSCP));
        assert!(meta.is_multicast());
        assert_eq!(meta.ifindex(), Some(3));
        assert_eq!(meta.dscp, 46);
    }

    #[test]
    fn ipv4_tos_byte_is_shifted() {
        let mut block = ControlBlock::new();
        assert!(block.push_dscp(AddressFamily::Inet, 10));
        let msg = msghdr_for(&mut block);
        assert_eq!(parse(&msg), vec![ControlMessage::Dscp(10)]);
    }

    #[test]
    fn timestamp_message() {
        let mut block = ControlBlock::new();
        let mut tv: libc::timeval = unsafe { mem::zeroed() };
        tv.tv_sec = 1_700_000_000;
        tv.tv_usec = 250_000;
        assert!(block.push(libc::SOL_SOCKET, libc::SCM_TIMESTAMP, tv));

        let msg = msghdr_for(&mut block);
        let mut meta = Metadata::default();
        for m in parse(&msg) {
            meta.absorb(m);
        }
        assert!(meta.attributes.contains(Attributes::TIMESTAMP));
        assert_eq!(
            meta.timestamp,
            Some(UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000))
        );
    }

    #[test]
    fn unix_family_has_no_dscp() {
        let mut block = ControlBlock::new();
        assert!(!block.push_dscp(AddressFamily::Unix, 1));
        assert!(block.is_empty());
    }

    #[test]
    fn empty_block_parses_to_nothing() {
        let mut block = ControlBlock::new();
        let msg = msghdr_for(&mut block);
        assert!(parse(&msg).is_empty());
    }

    #[test]
    fn message_flags_mark_truncation() {
        let mut meta = Metadata::default();
        meta.apply_msg_flags(libc::MSG_TRUNC);
        assert!(meta.is_truncated());
        assert!(!meta.attributes.contains(Attributes::CTRUNC));
        meta.apply_msg_flags(libc::MSG_CTRUNC);
        assert!(meta.attributes.contains(Attributes::CTRUNC));
    }

    #[test]
    fn block_refuses_overflow() {
        let mut block = ControlBlock::new();
        let mut pushed = 0;
        while block.push(libc::IPPROTO_IPV6, libc::IPV6_TCLASS, 0 as libc::c_int) {
            pushed += 1;
        }
        assert!(pushed > 0);
        assert!(block.len() <= CONTROL_CAPACITY);
    }
}
