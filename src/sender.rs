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

//! Stop-and-wait transmitter: one chunk in flight, resent on timeout until
//! acknowledged or out of retries.

use std::time::Duration;
use crate::link::{Completion, LinkConfig, LinkError, Notifier};
use crate::protocol::{self, FrameKind, MAX_PACKET, MAX_PAYLOAD};
use crate::serial::SerialPort;
use crate::timer::RetransmitTimer;

// ============================================================================
// Chunking
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u8,
    pub total: u8,
    pub payload: Vec<u8>,
}

/// Splits a packet into frame-sized chunks. An empty packet still gets one
/// (empty) chunk so the receiver sees it.
pub fn split_into_chunks(payload: &[u8]) -> Result<Vec<Chunk>, LinkError> {
    if payload.len() > MAX_PACKET {
        return Err(LinkError::PayloadTooLarge { len: payload.len(), max: MAX_PACKET });
    }

    if payload.is_empty() {
        return Ok(vec![Chunk { seq: 0, total: 1, payload: Vec::new() }]);
    }

    let total = payload.len().div_ceil(MAX_PAYLOAD) as u8;
    Ok(payload
        .chunks(MAX_PAYLOAD)
        .enumerate()
        .map(|(seq, slice)| Chunk { seq: seq as u8, total, payload: slice.to_vec() })
        .collect())
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingAck,
    AwaitingPacketAck,
}

/// Everything about the packet currently being sent
struct Session {
    chunks: Vec<Chunk>,
    total_bytes: usize,
    acked_bytes: usize,
    current: usize,
    retries: u32,
    phase: Phase,
}

impl Session {
    fn current_chunk(&self) -> &Chunk {
        &self.chunks[self.current]
    }

    fn is_last(&self) -> bool {
        self.current + 1 == self.chunks.len()
    }
}

// ============================================================================
// Transmitter
// ============================================================================

pub struct Transmitter {
    session: Option<Session>,
    timer: RetransmitTimer,
    max_retries: u32,
    ack_timeout: Duration,
    completion: Completion,
}

impl Transmitter {
    pub fn new(config: &LinkConfig) -> Self {
        Transmitter {
            session: None,
            timer: RetransmitTimer::new(),
            max_retries: config.max_retries,
            ack_timeout: config.ack_timeout,
            completion: config.completion,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_some()
    }

    pub fn timer_mut(&mut self) -> &mut RetransmitTimer {
        &mut self.timer
    }

    /// Starts sending `payload`. The outcome arrives later as a
    /// `PacketSent` notification.
    pub fn start(&mut self, payload: &[u8], link: &mut dyn SerialPort, out: &Notifier) {
        if self.session.is_some() {
            tracing::warn!("send requested while another packet is in flight");
            out.error(LinkError::Busy);
            return;
        }

        if !link.is_open() {
            out.error(LinkError::NotOpen);
            out.packet_sent(false);
            return;
        }

        let chunks = match split_into_chunks(payload) {
            Ok(chunks) => chunks,
            Err(e) => {
                out.error(e);
                out.packet_sent(false);
                return;
            }
        };

        tracing::debug!(bytes = payload.len(), chunks = chunks.len(), "starting packet");
        self.session = Some(Session {
            chunks,
            total_bytes: payload.len(),
            acked_bytes: 0,
            current: 0,
            retries: 0,
            phase: Phase::AwaitingAck,
        });
        self.send_chunk(0, link, out);
    }

    fn send_chunk(&mut self, index: usize, link: &mut dyn SerialPort, out: &Notifier) {
        let Some(session) = self.session.as_mut() else { return };
        session.current = index;

        let chunk = session.current_chunk();
        let frame = protocol::encode(FrameKind::Data, chunk.seq, chunk.total, &chunk.payload);
        let (seq, total) = (chunk.seq, chunk.total);
        let sent = session.acked_bytes + chunk.payload.len();
        let total_bytes = session.total_bytes;

        if let Err(e) = link.write_all(&frame) {
            tracing::warn!(seq, error = %e, "chunk write failed, abandoning packet");
            self.reset();
            out.error(LinkError::Write(e));
            out.packet_sent(false);
            return;
        }

        tracing::debug!(seq, total, len = frame.len(), "sent DATA");
        self.timer.arm(self.ack_timeout);
        out.send_progress(sent, total_bytes);
    }

    pub fn on_ack(&mut self, seq: u8, total: u8, link: &mut dyn SerialPort, out: &Notifier) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(seq, "ACK with no packet in flight");
            return;
        };

        let chunk = session.current_chunk();
        let (expected_seq, expected_total, len) = (chunk.seq, chunk.total, chunk.payload.len());
        if session.phase != Phase::AwaitingAck || expected_seq != seq || expected_total != total {
            tracing::debug!(seq, total, expected = expected_seq, "ignoring stale ACK");
            return;
        }

        tracing::debug!(seq, total, "received ACK");
        session.retries = 0;
        session.acked_bytes += len;

        if !session.is_last() {
            let next = session.current + 1;
            self.send_chunk(next, link, out);
            return;
        }

        match self.completion {
            Completion::ChunkAck => self.complete(out),
            Completion::PacketAck => {
                session.phase = Phase::AwaitingPacketAck;
                self.timer.arm(self.ack_timeout);
                tracing::debug!("final chunk acknowledged, waiting for PACKET_ACK");
            }
        }
    }

    /// Only meaningful under [`Completion::PacketAck`]. Otherwise every
    /// delivered packet leaves a PACKET_ACK in flight behind its final ACK,
    /// and it must not be taken for the next packet's.
    pub fn on_packet_ack(&mut self, total: u8, out: &Notifier) {
        if self.completion != Completion::PacketAck {
            tracing::debug!(total, "ignoring PACKET_ACK, completion is per chunk");
            return;
        }

        let Some(session) = self.session.as_ref() else {
            tracing::debug!(total, "PACKET_ACK with no packet in flight");
            return;
        };

        if session.chunks.len() != total as usize || !session.is_last() {
            tracing::debug!(total, chunks = session.chunks.len(), "ignoring stray PACKET_ACK");
            return;
        }

        tracing::debug!(total, "received PACKET_ACK");
        self.complete(out);
    }

    pub fn on_timeout(&mut self, link: &mut dyn SerialPort, out: &Notifier) {
        self.timer.cancel();
        let Some(session) = self.session.as_mut() else {
            tracing::trace!("timer expired with no packet in flight");
            return;
        };

        let seq = session.current_chunk().seq;
        if session.retries >= self.max_retries {
            let retries = session.retries;
            tracing::warn!(seq, retries, "no acknowledgment, abandoning packet");
            self.reset();
            out.error(LinkError::RetriesExhausted { seq, retries });
            out.packet_sent(false);
            return;
        }

        session.retries += 1;
        tracing::debug!(seq, retry = session.retries, "acknowledgment timed out");

        match session.phase {
            Phase::AwaitingAck => {
                let current = session.current;
                self.send_chunk(current, link, out);
            }
            Phase::AwaitingPacketAck => self.timer.arm(self.ack_timeout),
        }
    }

    /// Drops the packet in flight without reporting anything
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.session = None;
    }

    fn complete(&mut self, out: &Notifier) {
        let bytes = self.session.as_ref().map_or(0, |s| s.total_bytes);
        self.reset();
        tracing::info!(bytes, "packet delivered");
        out.packet_sent(true);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Notification;
    use crate::protocol::decode;
    use crate::serial::{MockLink, MockSerialPort};
    use rstest::rstest;
    use std::sync::mpsc;

    struct Harness {
        tx: Transmitter,
        port: MockSerialPort,
        link: MockLink,
        out: Notifier,
        events: mpsc::Receiver<Notification>,
    }

    impl Harness {
        fn new(config: LinkConfig) -> Self {
            let (port, link) = MockSerialPort::new(vec![]);
            let (sender, events) = mpsc::channel();
            Harness { tx: Transmitter::new(&config), port, link, out: Notifier::new(sender), events }
        }

        fn start(&mut self, payload: &[u8]) {
            self.tx.start(payload, &mut self.port, &self.out);
        }

        fn ack(&mut self, seq: u8, total: u8) {
            self.tx.on_ack(seq, total, &mut self.port, &self.out);
        }

        fn timeout(&mut self) {
            self.tx.on_timeout(&mut self.port, &self.out);
        }

        fn events(&self) -> Vec<Notification> {
            self.events.try_iter().collect()
        }

        fn sent_seqs(&self) -> Vec<u8> {
            self.link.writes().iter().map(|w| decode(w).unwrap().seq).collect()
        }
    }

    #[rstest]
    #[case::empty(0, vec![0])]
    #[case::one_byte(1, vec![1])]
    #[case::exactly_one_chunk(26, vec![26])]
    #[case::one_over(27, vec![26, 1])]
    #[case::thirty(30, vec![26, 4])]
    #[case::exact_multiple(78, vec![26, 26, 26])]
    #[case::multiple_plus_one(79, vec![26, 26, 26, 1])]
    fn test_split_into_chunks(#[case] len: usize, #[case] sizes: Vec<usize>) {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let chunks = split_into_chunks(&payload).unwrap();

        assert_eq!(chunks.iter().map(|c| c.payload.len()).collect::<Vec<_>>(), sizes);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq as usize, i);
            assert_eq!(chunk.total as usize, sizes.len());
        }
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.payload).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_split_rejects_oversized_packet() {
        assert_eq!(split_into_chunks(&vec![0; MAX_PACKET]).unwrap().len(), 255);
        assert!(matches!(
            split_into_chunks(&vec![0; MAX_PACKET + 1]),
            Err(LinkError::PayloadTooLarge { len, max }) if len == MAX_PACKET + 1 && max == MAX_PACKET
        ));
    }

    #[test]
    fn test_sends_first_chunk_and_arms_timer() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(&[7; 30]);

        let writes = h.link.writes();
        assert_eq!(writes.len(), 1);
        let frame = decode(&writes[0]).unwrap();
        assert_eq!((frame.kind, frame.seq, frame.total), (FrameKind::Data, 0, 2));
        assert_eq!(frame.payload.len(), 26);
        assert!(h.tx.timer.is_armed());
        assert!(matches!(h.events()[..], [Notification::SendProgress { sent: 26, total: 30 }]));
    }

    #[test]
    fn test_ack_advances_and_completes() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(&[7; 30]);
        h.ack(0, 2);
        h.ack(1, 2);

        assert_eq!(h.sent_seqs(), vec![0, 1]);
        assert!(!h.tx.is_busy());
        assert!(!h.tx.timer.is_armed());
        let events = h.events();
        assert!(matches!(
            events[..],
            [
                Notification::SendProgress { sent: 26, total: 30 },
                Notification::SendProgress { sent: 30, total: 30 },
                Notification::PacketSent(true),
            ]
        ));
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(&[1; 60]);
        h.ack(0, 3);
        h.ack(0, 3);
        h.ack(1, 9);

        assert_eq!(h.sent_seqs(), vec![0, 1]);
        assert_eq!(h.tx.session.as_ref().unwrap().current, 1);
    }

    #[test]
    fn test_timeout_resends_same_chunk() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(b"hello");
        h.timeout();

        let writes = h.link.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], writes[1]);
        assert_eq!(h.tx.session.as_ref().unwrap().retries, 1);
        assert!(h.tx.timer.is_armed());
    }

    #[test]
    fn test_retry_counter_resets_on_advance() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(&[0; 40]);
        h.timeout();
        h.timeout();
        h.ack(0, 2);

        assert_eq!(h.tx.session.as_ref().unwrap().retries, 0);
        assert_eq!(h.sent_seqs(), vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_retries_exhausted() {
        let config = LinkConfig { max_retries: 3, ..LinkConfig::default() };
        let mut h = Harness::new(config);
        h.start(b"lost");
        for _ in 0..4 {
            h.timeout();
        }

        assert_eq!(h.sent_seqs(), vec![0; 4]);
        assert!(!h.tx.is_busy());
        assert!(!h.tx.timer.is_armed());

        let events = h.events();
        let tail = &events[events.len() - 2..];
        assert!(matches!(tail[0], Notification::Error(LinkError::RetriesExhausted { seq: 0, retries: 3 })));
        assert!(matches!(tail[1], Notification::PacketSent(false)));
    }

    #[test]
    fn test_busy_rejects_second_send() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(b"first");
        h.events();
        h.start(b"second");

        assert!(matches!(h.events()[..], [Notification::Error(LinkError::Busy)]));
        assert_eq!(h.link.writes().len(), 1);
        assert_eq!(h.tx.session.as_ref().unwrap().total_bytes, 5);
    }

    #[test]
    fn test_closed_link_fails_send() {
        let mut h = Harness::new(LinkConfig::default());
        h.link.set_open(false);
        h.start(b"data");

        assert!(h.link.writes().is_empty());
        assert!(!h.tx.is_busy());
        assert!(matches!(
            h.events()[..],
            [Notification::Error(LinkError::NotOpen), Notification::PacketSent(false)]
        ));
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(&[0; 40]);
        h.link.set_fail_writes(true);
        h.ack(0, 2);

        assert!(!h.tx.is_busy());
        assert!(!h.tx.timer.is_armed());
        let events = h.events();
        let tail = &events[events.len() - 2..];
        assert!(matches!(tail[0], Notification::Error(LinkError::Write(_))));
        assert!(matches!(tail[1], Notification::PacketSent(false)));
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        let mut h = Harness::new(LinkConfig::default());
        h.timeout();
        assert!(h.link.writes().is_empty());
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_packet_ack_completion() {
        let config = LinkConfig { completion: Completion::PacketAck, ..LinkConfig::default() };
        let mut h = Harness::new(config);
        h.start(b"wait for it");
        h.ack(0, 1);

        assert!(h.tx.is_busy());
        assert!(h.tx.timer.is_armed());

        h.tx.on_packet_ack(1, &h.out);
        assert!(!h.tx.is_busy());
        assert!(matches!(h.events().last(), Some(Notification::PacketSent(true))));
    }

    #[test]
    fn test_packet_ack_wait_does_not_resend() {
        let config = LinkConfig {
            completion: Completion::PacketAck,
            max_retries: 2,
            ..LinkConfig::default()
        };
        let mut h = Harness::new(config);
        h.start(b"x");
        h.ack(0, 1);
        h.timeout();
        h.timeout();
        assert!(h.tx.is_busy());
        h.timeout();

        assert_eq!(h.link.writes().len(), 1);
        assert!(!h.tx.is_busy());
        assert!(matches!(h.events().last(), Some(Notification::PacketSent(false))));
    }

    #[test]
    fn test_packet_ack_covers_lost_final_ack() {
        let config = LinkConfig { completion: Completion::PacketAck, ..LinkConfig::default() };
        let mut h = Harness::new(config);
        h.start(&[0; 30]);
        h.ack(0, 2);
        h.tx.on_packet_ack(2, &h.out);

        assert!(!h.tx.is_busy());
        assert!(matches!(h.events().last(), Some(Notification::PacketSent(true))));
    }

    #[test]
    fn test_early_packet_ack_is_ignored() {
        let config = LinkConfig { completion: Completion::PacketAck, ..LinkConfig::default() };
        let mut h = Harness::new(config);
        h.start(&[0; 30]);
        h.tx.on_packet_ack(2, &h.out);
        h.tx.on_packet_ack(5, &h.out);

        assert!(h.tx.is_busy());
    }

    #[test]
    fn test_packet_ack_ignored_when_completing_per_chunk() {
        let mut h = Harness::new(LinkConfig::default());
        h.start(b"one");
        h.events();
        h.tx.on_packet_ack(1, &h.out);

        assert!(h.tx.is_busy());
        assert!(h.tx.timer.is_armed());
        assert!(h.events().is_empty());
    }
}
