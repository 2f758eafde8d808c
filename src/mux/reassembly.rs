//! Per-circuit reassembly of blocks into an ordered bytestream.
//!
//! Blocks for one circuit arrive interleaved across several downstream
//! connections, so they can show up in any order. The queue holds the
//! segments received so far, sorted by offset, with gaps between them.
//! A new block either merges into an adjacent segment (possibly bridging a
//! gap and cascading further merges) or becomes a segment of its own.
//! Anything that overlaps existing data, duplicates a SYN or FIN, or lands
//! on the wrong side of one is a protocol error and kills the circuit.

use std::collections::VecDeque;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::mux::header::flags;
use crate::mux::seq::{mod32_le, mod32_lt};

/// A contiguous run of received payload bytes awaiting delivery.
#[derive(Debug)]
pub struct Segment {
    /// Stream position of the first byte, modulo 2^32
    pub offset: u32,
    /// Accumulated SYN/FIN bits of the blocks merged into this segment
    pub flags: u16,
    /// Payload bytes
    pub data: BytesMut,
}

impl Segment {
    /// Byte length of this segment.
    ///
    /// Tracked as the buffer length rather than the wire field's u16:
    /// cascaded merges routinely grow a segment past 65535 bytes.
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// True if the segment holds no payload (a bare SYN/FIN marker).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last byte, modulo 2^32.
    pub fn end(&self) -> u32 {
        self.offset.wrapping_add(self.len())
    }

    fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Ordered, gap-aware queue of received segments for one circuit.
#[derive(Debug, Default)]
pub struct ReassemblyQueue {
    segments: VecDeque<Segment>,
}

impl ReassemblyQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint segments currently buffered.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Insert a received block at its sequence position.
    ///
    /// Chaff payloads are discarded here: a chaff block that carries SYN or
    /// FIN stays on the queue as a zero-length marker so the flag is handled
    /// in sequence, and plain chaff disappears entirely. Any rejection is
    /// fatal to the circuit.
    pub fn insert(&mut self, offset: u32, block_flags: u16, mut data: BytesMut) -> Result<()> {
        let mut block_flags = block_flags;
        if block_flags & flags::CHAFF != 0 {
            if block_flags & (flags::SYN | flags::FIN) == 0 {
                return Ok(());
            }
            data.clear();
            block_flags &= !flags::CHAFF;
        }

        let len = data.len() as u32;
        let end = offset.wrapping_add(len);

        // SYN must occur at offset zero, may not be duplicated, and must come
        // logically before anything already queued.
        if block_flags & flags::SYN != 0 {
            if offset != 0 {
                return Err(Error::protocol(format!("SYN at nonzero offset {offset}")));
            }
            if let Some(first) = self.segments.front() {
                if first.has(flags::SYN) || !mod32_le(end, first.offset) {
                    return Err(Error::protocol("SYN conflicts with queued data"));
                }
            }
        }

        // FIN may not be duplicated and must come logically after everything
        // already queued.
        if block_flags & flags::FIN != 0 {
            if let Some(last) = self.segments.back() {
                if last.has(flags::FIN) || !mod32_le(last.end(), offset) {
                    return Err(Error::protocol("FIN conflicts with queued data"));
                }
            }
        }

        // A plain block must come after any queued SYN and before any queued
        // FIN.
        if block_flags & (flags::SYN | flags::FIN) == 0 && !self.segments.is_empty() {
            let first = self.segments.front().expect("non-empty queue");
            let last = self.segments.back().expect("non-empty queue");
            if (first.has(flags::SYN) && !mod32_le(first.end(), offset))
                || (last.has(flags::FIN) && !mod32_le(end, last.offset))
            {
                return Err(Error::protocol("block outside SYN..FIN extent"));
            }
        }

        // Walk the queue: merge with an adjacent segment, or find the gap
        // this block fits into.
        for i in 0..self.segments.len() {
            let segment = &self.segments[i];

            if end == segment.offset {
                self.grow_front(i, block_flags, data);
                return Ok(());
            }
            if offset == segment.end() {
                self.grow_back(i, block_flags, data);
                return Ok(());
            }

            if mod32_lt(end, segment.offset) {
                // Goes strictly before `segment`; it must also fit strictly
                // after the previous segment, or it overlaps.
                if i > 0 && !mod32_lt(self.segments[i - 1].end(), offset) {
                    return Err(Error::protocol(format!(
                        "block {}+{} overlaps buffered data",
                        offset, len
                    )));
                }
                self.segments.insert(
                    i,
                    Segment {
                        offset,
                        flags: block_flags,
                        data,
                    },
                );
                return Ok(());
            }
        }

        // Goes after the current tail (or the queue is empty).
        if let Some(last) = self.segments.back() {
            if !mod32_lt(last.end(), offset) {
                return Err(Error::protocol(format!(
                    "block {}+{} overlaps buffered data",
                    offset, len
                )));
            }
        }
        self.segments.push_back(Segment {
            offset,
            flags: block_flags,
            data,
        });
        Ok(())
    }

    /// Pop the head segment if it is ready for upstream delivery.
    ///
    /// Only the head can ever be ready: insertion guarantees a gap between
    /// every pair of queued segments, so delivery never cascades. The head
    /// is ready when it sits exactly at `recv_offset` and the direction has
    /// seen its SYN (or the head itself carries it).
    pub fn pop_ready(&mut self, recv_offset: u32, received_syn: bool) -> Option<Segment> {
        let first = self.segments.front()?;
        if first.offset != recv_offset {
            return None;
        }
        if !received_syn && !first.has(flags::SYN) {
            return None;
        }
        self.segments.pop_front()
    }

    /// Offset of the first buffered segment, if any.
    pub fn first_offset(&self) -> Option<u32> {
        self.segments.front().map(|segment| segment.offset)
    }

    /// Prepend-merge `data` into the segment at `i`, then cascade backwards
    /// while the grown segment now abuts its predecessor.
    fn grow_front(&mut self, i: usize, block_flags: u16, mut data: BytesMut) {
        let segment = &mut self.segments[i];
        let added = data.len() as u32;
        data.extend_from_slice(&segment.data);
        segment.data = data;
        segment.offset = segment.offset.wrapping_sub(added);
        segment.flags |= block_flags;

        let mut i = i;
        while i > 0 && self.segments[i - 1].end() == self.segments[i].offset {
            let mut previous = self.segments.remove(i - 1).expect("index in bounds");
            i -= 1;
            let segment = &mut self.segments[i];
            previous.data.extend_from_slice(&segment.data);
            segment.offset = previous.offset;
            segment.flags |= previous.flags;
            segment.data = previous.data;
        }
    }

    /// Append-merge `data` into the segment at `i`, then cascade forwards
    /// while the grown segment now abuts its successor.
    fn grow_back(&mut self, i: usize, block_flags: u16, data: BytesMut) {
        let segment = &mut self.segments[i];
        segment.data.extend_from_slice(&data);
        segment.flags |= block_flags;

        while i + 1 < self.segments.len() && self.segments[i].end() == self.segments[i + 1].offset {
            let next = self.segments.remove(i + 1).expect("index in bounds");
            let segment = &mut self.segments[i];
            segment.data.extend_from_slice(&next.data);
            segment.flags |= next.flags;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    fn insert(
        queue: &mut ReassemblyQueue,
        offset: u32,
        block_flags: u16,
        bytes: &[u8],
    ) -> Result<()> {
        queue.insert(offset, block_flags, block(bytes))
    }

    #[test]
    fn test_in_order_single_segment() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, flags::SYN, b"hello ").unwrap();
        insert(&mut queue, 6, 0, b"world").unwrap();

        assert_eq!(queue.len(), 1);
        let segment = queue.pop_ready(0, false).unwrap();
        assert_eq!(segment.data.as_ref(), b"hello world");
        assert!(segment.flags & flags::SYN != 0);
    }

    #[test]
    fn test_gap_then_merge_cascade() {
        // Offsets 0, 20, then 10 bridges the gap and all three merge.
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, flags::SYN, &[0u8; 10]).unwrap();
        insert(&mut queue, 20, 0, &[2u8; 10]).unwrap();
        assert_eq!(queue.len(), 2);

        insert(&mut queue, 10, 0, &[1u8; 10]).unwrap();
        assert_eq!(queue.len(), 1);

        let segment = queue.pop_ready(0, false).unwrap();
        assert_eq!(segment.len(), 30);
        let mut expected = vec![0u8; 10];
        expected.extend_from_slice(&[1u8; 10]);
        expected.extend_from_slice(&[2u8; 10]);
        assert_eq!(segment.data.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_backward_merge_cascade() {
        // Fill 0 and 20 first, then 10 arriving as a *front*-merge of 20.
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 20, 0, &[2u8; 10]).unwrap();
        insert(&mut queue, 0, flags::SYN, &[0u8; 10]).unwrap();
        insert(&mut queue, 10, 0, &[1u8; 10]).unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.first_offset(), Some(0));
        assert_eq!(queue.segments[0].len(), 30);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, flags::SYN, &[0u8; 10]).unwrap();
        let err = insert(&mut queue, 5, 0, &[1u8; 10]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_overlap_in_gap_rejected() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, 0, &[0u8; 10]).unwrap();
        insert(&mut queue, 20, 0, &[2u8; 10]).unwrap();

        // Fits before the second segment but collides with the first.
        let err = insert(&mut queue, 8, 0, &[1u8; 4]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_overlap_past_tail_rejected() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, 0, &[0u8; 10]).unwrap();
        let err = insert(&mut queue, 9, 0, &[1u8; 10]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_syn_must_be_at_zero() {
        let mut queue = ReassemblyQueue::new();
        let err = insert(&mut queue, 10, flags::SYN, &[0u8; 4]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_duplicate_queued_syn_rejected() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, flags::SYN, &[0u8; 8]).unwrap();
        let err = insert(&mut queue, 0, flags::SYN, &[0u8; 8]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_syn_before_queued_data() {
        // SYN covering 0..8 is fine when the queue starts at 8 or later.
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 8, 0, &[1u8; 8]).unwrap();
        insert(&mut queue, 0, flags::SYN, &[0u8; 8]).unwrap();
        assert_eq!(queue.len(), 1);

        // But a SYN whose extent reaches past the queued head is an overlap.
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 4, 0, &[1u8; 8]).unwrap();
        let err = insert(&mut queue, 0, flags::SYN, &[0u8; 8]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_fin_must_follow_queued_data() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 10, 0, &[1u8; 10]).unwrap();

        let err = insert(&mut queue, 5, flags::FIN, &[0u8; 2]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_duplicate_queued_fin_rejected() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 10, flags::FIN, &[1u8; 4]).unwrap();
        let err = insert(&mut queue, 20, flags::FIN, &[1u8; 4]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_plain_block_after_queued_fin_rejected() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 10, flags::FIN, &[1u8; 4]).unwrap();
        let err = insert(&mut queue, 20, 0, &[1u8; 4]).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_plain_chaff_dropped() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 50, flags::CHAFF, &[9u8; 40]).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_chaff_fin_queued_as_marker() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 30, flags::CHAFF | flags::FIN, &[9u8; 40]).unwrap();

        assert_eq!(queue.len(), 1);
        let segment = &queue.segments[0];
        assert!(segment.is_empty());
        assert_eq!(segment.offset, 30);
        assert!(segment.has(flags::FIN));
        assert!(!segment.has(flags::CHAFF));
    }

    #[test]
    fn test_chaff_syn_is_zero_length_marker() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, flags::CHAFF | flags::SYN, &[9u8; 40]).unwrap();

        let segment = queue.pop_ready(0, false).unwrap();
        assert!(segment.is_empty());
        assert!(segment.has(flags::SYN));
    }

    #[test]
    fn test_chaff_marker_merges_in_sequence() {
        // A chaff FIN marker at the end of the stream merges with the data
        // that precedes it once the gap closes.
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 10, flags::CHAFF | flags::FIN, &[9u8; 32]).unwrap();
        insert(&mut queue, 0, flags::SYN, &[1u8; 10]).unwrap();

        assert_eq!(queue.len(), 1);
        let segment = queue.pop_ready(0, false).unwrap();
        assert_eq!(segment.len(), 10);
        assert!(segment.has(flags::SYN));
        assert!(segment.has(flags::FIN));
    }

    #[test]
    fn test_pop_ready_needs_offset_match() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 10, 0, &[1u8; 10]).unwrap();
        assert!(queue.pop_ready(0, true).is_none());
        assert!(queue.pop_ready(10, true).is_some());
    }

    #[test]
    fn test_pop_ready_waits_for_syn() {
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 0, 0, &[1u8; 10]).unwrap();
        assert!(queue.pop_ready(0, false).is_none());

        // Same head is deliverable once the direction has seen its SYN.
        assert!(queue.pop_ready(0, true).is_some());
    }

    #[test]
    fn test_wraparound_merge() {
        // Two segments straddling the 2^32 wrap merge into one.
        let base = u32::MAX - 4; // 5 bytes before the wrap
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, base, 0, &[1u8; 5]).unwrap();
        insert(&mut queue, 0, 0, &[2u8; 5]).unwrap();

        assert_eq!(queue.len(), 1);
        let segment = queue.pop_ready(base, true).unwrap();
        assert_eq!(segment.len(), 10);
        assert_eq!(segment.end(), 5);
    }

    #[test]
    fn test_wraparound_ordering() {
        // A pre-wrap block sorts before a post-wrap block even though its
        // raw offset is numerically larger.
        let mut queue = ReassemblyQueue::new();
        insert(&mut queue, 10, 0, &[2u8; 4]).unwrap();
        insert(&mut queue, u32::MAX - 20, 0, &[1u8; 4]).unwrap();

        assert_eq!(queue.first_offset(), Some(u32::MAX - 20));
    }
}
