//! Per-circuit state and the block dispatcher.
//!
//! A circuit is one bidirectional logical stream spread over several
//! downstream connections. The transmit side chops pending upstream bytes
//! into blocks of randomly drawn sizes and deals them out round-robin; the
//! receive side funnels blocks through the reassembly queue and hands
//! contiguous bytes to the upstream bridge. Each direction performs a
//! one-shot SYN/FIN handshake carried on ordinary blocks, with chaff
//! standing in when a FIN has no data to ride on.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mux::downstream::Downstream;
use crate::mux::header::{flags, BlockHeader, HEADER_LEN};
use crate::mux::reassembly::ReassemblyQueue;
use crate::mux::{CircuitId, ConnId, MAX_BLOCK, MIN_BLOCK};
use crate::rng;

/// Observable lifecycle of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// No SYN has been sent or delivered in either direction
    Fresh,
    /// At least one direction is open and neither has finished
    Open,
    /// One or both directions have carried their FIN
    HalfClosed,
    /// Both directions finished and no downstream connections remain
    Closed,
}

/// Result of pumping a circuit's transmit side.
#[derive(Debug, Default)]
pub struct PumpOutcome {
    /// Connections whose outbound buffers received new wire bytes
    pub written: Vec<ConnId>,
    /// Connections to send EOF on; set once, when the FIN goes out
    pub eof_conns: Vec<ConnId>,
}

/// One multiplexed circuit.
pub(crate) struct Circuit {
    id: CircuitId,
    send_offset: u32,
    recv_offset: u32,
    next_block_size: u16,
    block_size_range: (u16, u16),
    next_down: usize,
    sent_syn: bool,
    sent_fin: bool,
    received_syn: bool,
    received_fin: bool,
    eof_requested: bool,
    fin_flushed: bool,
    blocked: bool,
    xmit_pending: BytesMut,
    reassembly: ReassemblyQueue,
    downstreams: Vec<ConnId>,
}

impl Circuit {
    pub(crate) fn new(id: CircuitId) -> Self {
        Self {
            id,
            send_offset: 0,
            recv_offset: 0,
            next_block_size: rng::random_range(MIN_BLOCK, MAX_BLOCK),
            block_size_range: (MIN_BLOCK, MAX_BLOCK),
            next_down: 0,
            sent_syn: false,
            sent_fin: false,
            received_syn: false,
            received_fin: false,
            eof_requested: false,
            fin_flushed: false,
            blocked: false,
            xmit_pending: BytesMut::new(),
            reassembly: ReassemblyQueue::new(),
            downstreams: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> CircuitId {
        self.id
    }

    pub(crate) fn state(&self) -> CircuitState {
        if self.is_finished() && self.downstreams.is_empty() {
            CircuitState::Closed
        } else if self.sent_fin || self.received_fin {
            CircuitState::HalfClosed
        } else if self.sent_syn || self.received_syn {
            CircuitState::Open
        } else {
            CircuitState::Fresh
        }
    }

    /// True once both directions have carried their FIN.
    pub(crate) fn is_finished(&self) -> bool {
        self.sent_fin && self.received_fin
    }

    pub(crate) fn sent_fin(&self) -> bool {
        self.sent_fin
    }

    pub(crate) fn downstream_count(&self) -> usize {
        self.downstreams.len()
    }

    pub(crate) fn downstreams(&self) -> &[ConnId] {
        &self.downstreams
    }

    pub(crate) fn attach(&mut self, conn: ConnId) {
        self.downstreams.push(conn);
    }

    pub(crate) fn detach(&mut self, conn: ConnId) {
        self.downstreams.retain(|&id| id != conn);
        if self.downstreams.is_empty() {
            self.next_down = 0;
        } else {
            self.next_down %= self.downstreams.len();
        }
    }

    /// Restrict the block-size draw. Cover modules with narrow plausible
    /// payload sizes use this; tests use it to pin sizes.
    pub(crate) fn set_block_size_range(&mut self, lo: u16, hi: u16) {
        self.block_size_range = (lo, hi);
        self.next_block_size = rng::random_range(lo, hi);
    }

    /// Queue upstream bytes for transmission.
    pub(crate) fn queue_upstream(&mut self, data: &[u8]) {
        self.xmit_pending.extend_from_slice(data);
    }

    /// Record the upstream half-close. The FIN itself goes out on the next
    /// pump, riding the final data block or a chaff block.
    pub(crate) fn request_eof(&mut self) {
        self.eof_requested = true;
    }

    /// True if the last pump was cut short by a full cover channel; the
    /// driver should pump again once a downstream write completes.
    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Drain as many blocks as pending data and cover-channel room allow.
    pub(crate) fn pump(&mut self, conns: &mut HashMap<ConnId, Downstream>) -> Result<PumpOutcome> {
        let mut outcome = PumpOutcome::default();
        self.blocked = false;

        if self.downstreams.is_empty() {
            // Nothing to emit on. A requested EOF is still honored so the
            // circuit can finish; the FIN simply never reaches the wire.
            if self.eof_requested {
                self.sent_fin = true;
            }
        } else {
            self.send_blocks(conns, &mut outcome.written)?;
            if self.eof_requested && !self.sent_fin && self.xmit_pending.is_empty() {
                self.send_chaff_fin(conns, &mut outcome.written)?;
            }
        }

        outcome.written.sort_unstable();
        outcome.written.dedup();

        if self.sent_fin && !self.fin_flushed {
            self.fin_flushed = true;
            outcome.eof_conns = self.downstreams.clone();
        }
        Ok(outcome)
    }

    /// Emit data blocks round-robin while enough pending bytes remain.
    ///
    /// With an EOF requested, the final short block is shrunk to the data
    /// that is left and carries the FIN.
    fn send_blocks(
        &mut self,
        conns: &mut HashMap<ConnId, Downstream>,
        written: &mut Vec<ConnId>,
    ) -> Result<()> {
        loop {
            let avail = self.xmit_pending.len();
            let mut block_flags = if self.sent_syn { 0 } else { flags::SYN };
            let mut size = self.next_block_size as usize;

            if self.eof_requested && avail > 0 && avail <= size {
                size = avail;
                block_flags |= flags::FIN;
            } else if avail < size {
                break;
            }

            let target_id = self.downstreams[self.next_down];
            let target = conns
                .get_mut(&target_id)
                .ok_or(Error::UnknownConnection(target_id))?;

            let need = HEADER_LEN + size;
            if !has_room(target, need) {
                tracing::debug!(conn = target_id, need, "no transmit room, block deferred");
                self.blocked = true;
                break;
            }

            // The pending buffer is only drained after the cover module has
            // accepted the whole block.
            let mut block = BytesMut::with_capacity(need);
            BlockHeader {
                circuit_id: self.id,
                offset: self.send_offset,
                length: size as u16,
                flags: block_flags,
            }
            .encode(&mut block);
            block.extend_from_slice(&self.xmit_pending[..size]);
            target.send_block(&block)?;
            written.push(target_id);

            tracing::debug!(
                circuit = format_args!("{:#018x}", self.id),
                conn = target_id,
                offset = self.send_offset,
                size,
                flags = format_args!("{:#06x}", block_flags),
                "sent block"
            );

            self.xmit_pending.advance(size);
            self.advance_dispatch(size);
            if block_flags & flags::FIN != 0 {
                self.sent_fin = true;
            }
        }
        Ok(())
    }

    /// Emit one chaff block to carry a FIN that has no data to ride on.
    fn send_chaff_fin(
        &mut self,
        conns: &mut HashMap<ConnId, Downstream>,
        written: &mut Vec<ConnId>,
    ) -> Result<()> {
        let size = self.next_block_size as usize;
        let mut block_flags = flags::FIN | flags::CHAFF;
        if !self.sent_syn {
            block_flags |= flags::SYN;
        }

        let target_id = self.downstreams[self.next_down];
        let target = conns
            .get_mut(&target_id)
            .ok_or(Error::UnknownConnection(target_id))?;

        let need = HEADER_LEN + size;
        if !has_room(target, need) {
            tracing::debug!(conn = target_id, need, "no transmit room, chaff FIN deferred");
            self.blocked = true;
            return Ok(());
        }

        let mut block = BytesMut::with_capacity(need);
        BlockHeader {
            circuit_id: self.id,
            offset: self.send_offset,
            length: size as u16,
            flags: block_flags,
        }
        .encode(&mut block);
        block.extend_from_slice(&rng::chaff_bytes(size));
        target.send_block(&block)?;
        written.push(target_id);

        tracing::debug!(
            circuit = format_args!("{:#018x}", self.id),
            conn = target_id,
            offset = self.send_offset,
            size,
            "sent chaff FIN"
        );

        self.advance_dispatch(size);
        self.sent_fin = true;
        Ok(())
    }

    /// Bookkeeping shared by every emission: offsets advance as if the block
    /// were real data (chaff included), the round-robin cursor moves on, and
    /// a fresh size is drawn for the next block.
    fn advance_dispatch(&mut self, size: usize) {
        self.next_down = (self.next_down + 1) % self.downstreams.len();
        self.send_offset = self.send_offset.wrapping_add(size as u32);
        self.next_block_size = rng::random_range(self.block_size_range.0, self.block_size_range.1);
        self.sent_syn = true;
    }

    /// Queue one received block for reassembly.
    pub(crate) fn receive_block(&mut self, header: &BlockHeader, payload: BytesMut) -> Result<()> {
        if self.received_fin {
            return Err(Error::protocol("block received after FIN"));
        }
        if header.has_flag(flags::SYN) && self.received_syn {
            return Err(Error::protocol("duplicate SYN"));
        }
        self.reassembly.insert(header.offset, header.flags, payload)
    }

    /// Move reassembled bytes toward the upstream.
    ///
    /// At most one segment can be ready (insertion leaves gaps between
    /// queued segments), so delivery never cascades. Returns the bytes and
    /// whether they carried the peer's FIN.
    pub(crate) fn deliver_upstream(&mut self) -> Option<(Bytes, bool)> {
        let segment = self
            .reassembly
            .pop_ready(self.recv_offset, self.received_syn)?;

        if segment.flags & flags::SYN != 0 {
            self.received_syn = true;
        }
        self.recv_offset = self.recv_offset.wrapping_add(segment.len());

        let eof = segment.flags & flags::FIN != 0;
        if eof {
            self.received_fin = true;
            debug_assert!(self.reassembly.is_empty());
        }
        debug_assert!(self.reassembly.first_offset() != Some(self.recv_offset));

        Some((segment.data.freeze(), eof))
    }

    #[cfg(test)]
    pub(crate) fn xmit_pending_len(&self) -> usize {
        self.xmit_pending.len()
    }

    #[cfg(test)]
    pub(crate) fn set_recv_offset(&mut self, offset: u32) {
        self.recv_offset = offset;
        self.received_syn = true;
    }

    #[cfg(test)]
    pub(crate) fn send_offset(&self) -> u32 {
        self.send_offset
    }
}

fn has_room(target: &Downstream, need: usize) -> bool {
    let room = target.transmit_room(
        need,
        HEADER_LEN + MIN_BLOCK as usize,
        HEADER_LEN + MAX_BLOCK as usize,
    );
    room >= need
}
