//! Scatter/gather descriptor builders.
//!
//! Each I/O attempt turns its event's payload into a list of `iovec`
//! fragments covering exactly the bytes still to be transferred:
//!
//! - send: the used bytes of every buffer, minus the `n` bytes an earlier
//!   partial write already consumed
//! - receive: the available space of every buffer that is not yet full
//!
//! The fragments borrow the payload, so it cannot move or be dropped while
//! the descriptor is alive.

use crate::buffer::Payload;
use std::marker::PhantomData;

/// Upper bound on fragments handed to a single system call. Anything past
/// this is picked up by the next attempt once the first part is consumed.
pub(crate) const MAX_FRAGMENTS: usize = 1024;

/// The `iovec` list for one system call.
pub(crate) struct Fragments<'a> {
    iov: Vec<libc::iovec>,
    total: usize,
    _payload: PhantomData<&'a mut ()>,
}

impl Fragments<'_> {
    fn new() -> Self {
        Self {
            iov: Vec::new(),
            total: 0,
            _payload: PhantomData,
        }
    }

    fn push(&mut self, base: *mut u8, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        if self.iov.len() == MAX_FRAGMENTS {
            return false;
        }
        self.iov.push(libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: len,
        });
        self.total += len;
        true
    }

    /// Number of fragments.
    pub(crate) fn count(&self) -> usize {
        self.iov.len()
    }

    /// Bytes covered by all fragments.
    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::iovec {
        self.iov.as_mut_ptr()
    }

    #[cfg(test)]
    fn slices(&self) -> Vec<&[u8]> {
        self.iov
            .iter()
            .map(|v| unsafe { std::slice::from_raw_parts(v.iov_base as *const u8, v.iov_len) })
            .collect()
    }
}

/// Fragments for a send that already moved `skip` bytes.
pub(crate) fn send_fragments(payload: &Payload, mut skip: usize) -> Fragments<'_> {
    let mut frags = Fragments::new();

    match payload {
        Payload::List(list) => {
            for buffer in list.iter() {
                let used = buffer.used();
                if skip >= used.len() {
                    skip -= used.len();
                    continue;
                }
                let rest = &used[skip..];
                skip = 0;
                if !frags.push(rest.as_ptr() as *mut u8, rest.len()) {
                    break;
                }
            }
        }
        Payload::Region(region) => {
            let start = skip.min(region.len());
            let rest = &region[start..];
            frags.push(rest.as_ptr() as *mut u8, rest.len());
        }
    }

    frags
}

/// Fragments for a receive into the space not yet filled. `n` is the byte
/// count already received into a single region; buffer lists track their
/// own fill level.
pub(crate) fn recv_fragments(payload: &mut Payload, n: usize) -> Fragments<'_> {
    let mut frags = Fragments::new();

    match payload {
        Payload::List(list) => {
            for buffer in list.iter_mut() {
                let avail = buffer.available_mut();
                if avail.is_empty() {
                    continue;
                }
                if !frags.push(avail.as_mut_ptr(), avail.len()) {
                    break;
                }
            }
        }
        Payload::Region(region) => {
            let start = n.min(region.len());
            let rest = &mut region[start..];
            frags.push(rest.as_mut_ptr(), rest.len());
        }
    }

    frags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferList};

    fn list(parts: &[&[u8]]) -> Payload {
        Payload::List(parts.iter().map(|p| Buffer::from_slice(p)).collect())
    }

    #[test]
    fn send_starts_at_first_unconsumed_byte() {
        let payload = list(&[b"abcd", b"efg", b"hij"]);

        let frags = send_fragments(&payload, 0);
        assert_eq!(frags.count(), 3);
        assert_eq!(frags.total(), 10);

        let frags = send_fragments(&payload, 5);
        assert_eq!(frags.slices(), vec![&b"fg"[..], &b"hij"[..]]);
        assert_eq!(frags.total(), 5);

        // Skip lands exactly on a buffer boundary.
        let frags = send_fragments(&payload, 7);
        assert_eq!(frags.slices(), vec![&b"hij"[..]]);
    }

    #[test]
    fn send_fully_consumed_is_empty() {
        let payload = list(&[b"ab", b"cd"]);
        let frags = send_fragments(&payload, 4);
        assert_eq!(frags.count(), 0);
        assert_eq!(frags.total(), 0);
    }

    #[test]
    fn send_skips_empty_buffers() {
        let mut l = BufferList::new();
        l.push(Buffer::with_capacity(16));
        l.push(Buffer::from_slice(b"xy"));
        let payload = Payload::List(l);
        let frags = send_fragments(&payload, 0);
        assert_eq!(frags.slices(), vec![&b"xy"[..]]);
    }

    #[test]
    fn send_region_applies_skip() {
        let payload = Payload::Region(b"0123456789".to_vec());
        assert_eq!(send_fragments(&payload, 6).slices(), vec![&b"6789"[..]]);
        assert_eq!(send_fragments(&payload, 42).count(), 0);
    }

    #[test]
    fn recv_skips_full_buffers() {
        let mut l = BufferList::new();
        l.push(Buffer::from_slice(b"full"));
        let mut partial = Buffer::with_capacity(8);
        partial.add(3);
        l.push(partial);
        l.push(Buffer::with_capacity(4));
        let mut payload = Payload::List(l);

        let frags = recv_fragments(&mut payload, 0);
        assert_eq!(frags.count(), 2);
        assert_eq!(frags.total(), 9);
    }

    #[test]
    fn recv_region_resumes_at_n() {
        let mut payload = Payload::Region(vec![0u8; 16]);
        let frags = recv_fragments(&mut payload, 10);
        assert_eq!(frags.total(), 6);
    }

    #[test]
    fn zero_length_requests_build_empty_descriptors() {
        let mut empty = Payload::List(BufferList::new());
        assert_eq!(recv_fragments(&mut empty, 0).count(), 0);
        assert_eq!(send_fragments(&empty, 0).count(), 0);

        let mut region = Payload::Region(Vec::new());
        assert_eq!(recv_fragments(&mut region, 0).total(), 0);
    }

    #[test]
    fn fragment_count_is_capped() {
        let payload = Payload::List((0..MAX_FRAGMENTS + 5).map(|_| Buffer::from_slice(b"z")).collect());
        let frags = send_fragments(&payload, 0);
        assert_eq!(frags.count(), MAX_FRAGMENTS);
        assert_eq!(frags.total(), MAX_FRAGMENTS);
    }
}
