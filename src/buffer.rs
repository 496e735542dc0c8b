//! Buffers and buffer lists for scatter/gather socket I/O.
//!
//! A [`Buffer`] is a fixed allocation split into a *used* prefix (bytes that
//! hold data) and an *available* suffix (spare capacity). Sends transmit the
//! used bytes; receives fill the available space and move the split forward.
//!
//! The allocation never moves while a buffer sits in a queued event, so the
//! descriptor builder can hand raw pointers into it to the kernel for the
//! duration of one system call.

use std::collections::VecDeque;

/// A fixed-size byte buffer with a used/available split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Box<[u8]>,
    used: usize,
}

impl Buffer {
    /// Create an empty buffer; all of its capacity is available.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    /// Create a buffer holding a copy of `bytes`, fully used.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            used: bytes.len(),
        }
    }

    /// Returns the total capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes holding data.
    #[inline]
    pub fn used_len(&self) -> usize {
        self.used
    }

    /// Number of bytes of spare capacity.
    #[inline]
    pub fn available_len(&self) -> usize {
        self.data.len() - self.used
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The bytes holding data.
    #[inline]
    pub fn used(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The spare capacity.
    #[inline]
    pub fn available_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    /// Mark `n` bytes of the available space as used.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the available space.
    #[inline]
    pub fn add(&mut self, n: usize) {
        assert!(
            n <= self.available_len(),
            "add({}) exceeds available space ({})",
            n,
            self.available_len()
        );
        self.used += n;
    }

    /// Forget all data; the whole capacity becomes available again.
    #[inline]
    pub fn clear(&mut self) {
        self.used = 0;
    }

    pub fn into_vec(self) -> Vec<u8> {
        let mut v = self.data.into_vec();
        v.truncate(self.used);
        v
    }
}

impl From<Vec<u8>> for Buffer {
    /// The vector's contents become the used region.
    fn from(v: Vec<u8>) -> Self {
        let used = v.len();
        Self {
            data: v.into_boxed_slice(),
            used,
        }
    }
}

/// Ordered sequence of buffers making up one logical transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferList {
    buffers: VecDeque<Buffer>,
}

impl BufferList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list holding a single buffer.
    pub fn single(buffer: Buffer) -> Self {
        let mut list = Self::new();
        list.push(buffer);
        list
    }

    pub fn push(&mut self, buffer: Buffer) {
        self.buffers.push_back(buffer);
    }

    /// Number of buffers in the list.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total used bytes across every buffer.
    pub fn used_len(&self) -> usize {
        self.buffers.iter().map(Buffer::used_len).sum()
    }

    /// Total spare capacity across every buffer.
    pub fn available_len(&self) -> usize {
        self.buffers.iter().map(Buffer::available_len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Buffer> {
        self.buffers.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index)
    }

    /// Record `n` freshly received bytes, filling available regions in
    /// order and skipping full buffers.
    pub(crate) fn commit(&mut self, mut n: usize) {
        for buffer in self.buffers.iter_mut() {
            if n == 0 {
                break;
            }
            let take = buffer.available_len().min(n);
            buffer.add(take);
            n -= take;
        }
        debug_assert_eq!(n, 0, "committed more bytes than were available");
    }

    /// Copy of every used byte, concatenated.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.used_len());
        for buffer in &self.buffers {
            out.extend_from_slice(buffer.used());
        }
        out
    }

    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers.into()
    }
}

impl From<Vec<Buffer>> for BufferList {
    fn from(buffers: Vec<Buffer>) -> Self {
        Self {
            buffers: buffers.into(),
        }
    }
}

impl FromIterator<Buffer> for BufferList {
    fn from_iter<I: IntoIterator<Item = Buffer>>(iter: I) -> Self {
        Self {
            buffers: iter.into_iter().collect(),
        }
    }
}

/// The data carried by one I/O event.
///
/// `Region` is a single flat byte range. For sends the whole region is the
/// data; for receives the whole region is capacity and the event's byte
/// count says how much of it was filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    List(BufferList),
    Region(Vec<u8>),
}

impl Payload {
    /// Bytes a send of this payload transmits in total.
    pub fn send_len(&self) -> usize {
        match self {
            Payload::List(list) => list.used_len(),
            Payload::Region(region) => region.len(),
        }
    }

    /// Bytes a receive may place into this payload, counting from the first
    /// byte not yet filled.
    pub(crate) fn recv_capacity(&self, n: usize) -> usize {
        match self {
            Payload::List(list) => list.available_len(),
            Payload::Region(region) => region.len().saturating_sub(n),
        }
    }

    pub(crate) fn commit_recv(&mut self, cc: usize) {
        if let Payload::List(list) = self {
            list.commit(cc);
        }
    }

    pub fn as_list(&self) -> Option<&BufferList> {
        match self {
            Payload::List(list) => Some(list),
            Payload::Region(_) => None,
        }
    }

    pub fn as_region(&self) -> Option<&[u8]> {
        match self {
            Payload::List(_) => None,
            Payload::Region(region) => Some(region),
        }
    }
}

impl From<BufferList> for Payload {
    fn from(list: BufferList) -> Self {
        Payload::List(list)
    }
}
