// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::collections::BTreeMap;
use crate::link::{LinkError, Notifier};
use crate::protocol::{Frame, MAX_PAYLOAD};
use crate::serial::SerialPort;

// ============================================================================
// Reassembly State
// ============================================================================

struct Reassembly {
    expected: u8,
    received: usize,
    chunks: BTreeMap<u8, Vec<u8>>,
    packet_ack_sent: bool,
}

impl Reassembly {
    fn new(expected: u8) -> Self {
        Reassembly { expected, received: 0, chunks: BTreeMap::new(), packet_ack_sent: false }
    }

    fn received_bytes(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    /// Every chunk but the last is full, so the size is exact once the last
    /// one is in. Until then this is an upper bound.
    fn expected_bytes(&self) -> usize {
        let full = (self.expected as usize - 1) * MAX_PAYLOAD;
        match self.chunks.get(&(self.expected - 1)) {
            Some(last) => full + last.len(),
            None => full + MAX_PAYLOAD,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.expected as usize
    }

    fn assemble(&self) -> Vec<u8> {
        (0..self.expected)
            .filter_map(|seq| self.chunks.get(&seq))
            .flatten()
            .copied()
            .collect()
    }
}

// ============================================================================
// Reassembler
// ============================================================================

#[derive(Default)]
pub struct Reassembler {
    state: Option<Reassembly>,
    /// Chunk count of the packet delivered last, already PACKET_ACKed.
    /// Kept until the next packet starts so a resent final chunk (its ACK
    /// was lost) is recognized instead of seeding a new reassembly.
    finished: Option<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.state.is_some()
    }

    pub fn reset(&mut self) {
        self.state = None;
        self.finished = None;
    }

    /// A resend of the final chunk of the packet just delivered. Chunks go
    /// out in order, so a new packet never opens with its last chunk. A
    /// one-chunk packet cannot be told apart from its own resend.
    fn is_resent_final_chunk(&self, seq: u8, total: u8) -> bool {
        self.state.is_none() && total > 1 && self.finished == Some(total) && seq == total - 1
    }

    /// Stores a DATA frame, acknowledges it and hands the packet to the
    /// caller once every chunk is in.
    pub fn on_data(&mut self, frame: &Frame, link: &mut dyn SerialPort, out: &Notifier) {
        let (seq, total) = (frame.seq, frame.total);
        if total == 0 || seq >= total {
            tracing::warn!(seq, total, "dropping DATA frame with impossible sequence");
            return;
        }

        if self.is_resent_final_chunk(seq, total) {
            tracing::debug!(seq, total, "final chunk of delivered packet resent, re-acknowledging");
            if let Err(e) = link.write_all(&Frame::ack(seq, total).encode()) {
                tracing::warn!(seq, error = %e, "failed to send ACK");
                out.error(LinkError::Write(e));
            }
            return;
        }

        if let Some(stale) = self.state.take_if(|state| state.expected != total) {
            tracing::warn!(
                expected = stale.expected,
                total,
                received = stale.received,
                "chunk count changed mid-packet, abandoning partial packet"
            );
        }
        if self.state.is_none() {
            self.finished = None;
        }
        let state = self.state.get_or_insert_with(|| Reassembly::new(total));

        let is_new = state.chunks.insert(seq, frame.payload.clone()).is_none();
        if is_new {
            state.received += 1;
            tracing::debug!(seq, total, received = state.received, "stored chunk");
            out.receive_progress(state.received_bytes(), state.expected_bytes());
        } else {
            tracing::debug!(seq, total, "duplicate chunk");
        }

        if let Err(e) = link.write_all(&Frame::ack(seq, total).encode()) {
            tracing::warn!(seq, error = %e, "failed to send ACK");
            out.error(LinkError::Write(e));
        }

        if !state.is_complete() {
            return;
        }

        let packet = state.assemble();
        tracing::info!(bytes = packet.len(), chunks = total, "packet received");
        out.packet_received(packet);

        if !state.packet_ack_sent {
            state.packet_ack_sent = true;
            if let Err(e) = link.write_all(&Frame::packet_ack(total).encode()) {
                tracing::warn!(error = %e, "failed to send PACKET_ACK");
                out.error(LinkError::Write(e));
            }
        }

        self.state = None;
        self.finished = Some(total);
    }
}

// ============================================================================
// Tests
// ============================================================================
