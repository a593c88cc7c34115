//! Byte buffering over a queue of packets.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// Accumulates packet payloads and serves fixed-size reads across packet
/// boundaries.
///
/// Reads are all-or-nothing: [`read`](Self::read) fills the destination
/// completely or not at all, which lets the mixer consume exactly one
/// tick's worth of bytes per call. [`skip`](Self::skip) discards buffered
/// bytes without copying (used by flow control).
#[derive(Debug, Default)]
pub struct Bufferizer {
    chunks: VecDeque<Bytes>,
    available: usize,
}

impl Bufferizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one packet's payload.
    pub fn put(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.available += data.len();
        self.chunks.push_back(data);
    }

    /// Drain `queue` into the buffer.
    pub fn put_from_queue(&mut self, queue: &mut VecDeque<Bytes>) {
        while let Some(data) = queue.pop_front() {
            self.put(data);
        }
    }

    /// Number of buffered bytes.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Fill `dst` completely, returning false (and consuming nothing) when
    /// fewer than `dst.len()` bytes are buffered.
    pub fn read(&mut self, dst: &mut [u8]) -> bool {
        if self.available < dst.len() {
            return false;
        }
        let mut filled = 0;
        while filled < dst.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                self.chunks.pop_front();
            }
            filled += n;
        }
        self.available -= dst.len();
        true
    }

    /// Discard up to `count` buffered bytes; returns the number discarded.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.available);
        let mut remaining = count;
        while remaining > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(remaining);
            front.advance(n);
            if front.is_empty() {
                self.chunks.pop_front();
            }
            remaining -= n;
        }
        self.available -= count;
        count
    }

    /// Drop all buffered bytes.
    pub fn flush(&mut self) {
        self.chunks.clear();
        self.available = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_spans_packet_boundaries() {
        let mut b = Bufferizer::new();
        b.put(Bytes::from_static(&[1, 2, 3]));
        b.put(Bytes::from_static(&[4, 5]));
        let mut dst = [0u8; 4];
        assert!(b.read(&mut dst));
        assert_eq!(dst, [1, 2, 3, 4]);
        assert_eq!(b.available(), 1);
    }

    #[test]
    fn short_read_consumes_nothing() {
        let mut b = Bufferizer::new();
        b.put(Bytes::from_static(&[1, 2]));
        let mut dst = [0u8; 4];
        assert!(!b.read(&mut dst));
        assert_eq!(b.available(), 2);
    }

    #[test]
    fn skip_discards_across_packets() {
        let mut b = Bufferizer::new();
        b.put(Bytes::from_static(&[1, 2, 3]));
        b.put(Bytes::from_static(&[4, 5, 6]));
        assert_eq!(b.skip(4), 4);
        let mut dst = [0u8; 2];
        assert!(b.read(&mut dst));
        assert_eq!(dst, [5, 6]);
    }

    #[test]
    fn skip_clamped_to_available() {
        let mut b = Bufferizer::new();
        b.put(Bytes::from_static(&[1, 2]));
        assert_eq!(b.skip(10), 2);
        assert_eq!(b.available(), 0);
    }

    #[test]
    fn flush_empties_buffer() {
        let mut b = Bufferizer::new();
        b.put(Bytes::from_static(&[1, 2, 3]));
        b.flush();
        assert_eq!(b.available(), 0);
        let mut dst = [0u8; 1];
        assert!(!b.read(&mut dst));
    }

    #[test]
    fn put_from_queue_drains_queue() {
        let mut b = Bufferizer::new();
        let mut q = VecDeque::new();
        q.push_back(Bytes::from_static(&[1]));
        q.push_back(Bytes::from_static(&[2, 3]));
        b.put_from_queue(&mut q);
        assert!(q.is_empty());
        assert_eq!(b.available(), 3);
    }
}
