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

//! Packet-level link over a LoRa serial adapter.
//!
//! [`LinkAdapter`] owns the transmitter and the reassembler and is the only
//! place their state changes. Everything goes through [`LinkAdapter::handle`]
//! one [`Event`] at a time; results come back as [`Notification`]s on the
//! channel given at construction.

use std::io::ErrorKind;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use crate::protocol::{self, Frame, FrameKind, MAX_FRAME_LEN};
use crate::receiver::Reassembler;
use crate::sender::Transmitter;
use crate::serial::SerialPort;

/// Enough for a handful of coalesced frames
const READ_BUFFER_LEN: usize = MAX_FRAME_LEN * 8;

// ============================================================================
// Configuration
// ============================================================================

/// When a send counts as finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Completion {
    /// The ACK of the final chunk
    #[default]
    ChunkAck,
    /// The receiver's PACKET_ACK after reassembly
    PacketAck,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Resends of one chunk before the packet is given up
    pub max_retries: u32,
    pub ack_timeout: Duration,
    pub completion: Completion,
    /// Look for several frames in one read instead of decoding only the first
    pub scan_frames: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            max_retries: 5,
            ack_timeout: Duration::from_millis(1000),
            completion: Completion::ChunkAck,
            scan_frames: false,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("serial port is not open")]
    NotOpen,

    #[error("a packet is already being sent")]
    Busy,

    #[error("packet of {len} bytes exceeds the {max} byte maximum")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("serial write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("chunk {seq} not acknowledged after {retries} retries")]
    RetriesExhausted { seq: u8, retries: u32 },
}

// ============================================================================
// Events & Notifications
// ============================================================================

#[derive(Debug)]
pub enum Event {
    BytesArrived(Vec<u8>),
    TimerExpired,
    SendRequested(Vec<u8>),
}

#[derive(Debug)]
pub enum Notification {
    PacketSent(bool),
    PacketReceived(Vec<u8>),
    SendProgress { sent: usize, total: usize },
    ReceiveProgress { received: usize, total: usize },
    Error(LinkError),
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Notifier { tx }
    }

    fn emit(&self, notification: Notification) {
        if let Err(mpsc::SendError(dropped)) = self.tx.send(notification) {
            tracing::trace!(?dropped, "no listener for notification");
        }
    }

    pub fn packet_sent(&self, success: bool) {
        self.emit(Notification::PacketSent(success));
    }

    pub fn packet_received(&self, data: Vec<u8>) {
        self.emit(Notification::PacketReceived(data));
    }

    pub fn send_progress(&self, sent: usize, total: usize) {
        self.emit(Notification::SendProgress { sent, total });
    }

    pub fn receive_progress(&self, received: usize, total: usize) {
        self.emit(Notification::ReceiveProgress { received, total });
    }

    pub fn error(&self, error: LinkError) {
        self.emit(Notification::Error(error));
    }
}

// ============================================================================
// Link Adapter
// ============================================================================

pub struct LinkAdapter {
    serial: Box<dyn SerialPort>,
    config: LinkConfig,
    tx: Transmitter,
    rx: Reassembler,
    notifier: Notifier,
}

impl LinkAdapter {
    pub fn new(
        serial: Box<dyn SerialPort>,
        config: LinkConfig,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        LinkAdapter {
            serial,
            tx: Transmitter::new(&config),
            rx: Reassembler::new(),
            config,
            notifier: Notifier::new(notifications),
        }
    }

    pub fn send_packet(&mut self, data: &[u8]) {
        self.handle(Event::SendRequested(data.to_vec()));
    }

    pub fn is_sending(&self) -> bool {
        self.tx.is_busy()
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::SendRequested(data) => {
                self.tx.start(&data, self.serial.as_mut(), &self.notifier);
            }
            Event::TimerExpired => {
                self.tx.on_timeout(self.serial.as_mut(), &self.notifier);
            }
            Event::BytesArrived(bytes) => self.on_bytes(&bytes),
        }
    }

    /// Waits up to `idle` for input and feeds whatever happens (bytes or an
    /// elapsed retransmission deadline) through [`LinkAdapter::handle`].
    pub fn poll(&mut self, idle: Duration) -> std::io::Result<()> {
        let wait = match self.tx.timer_mut().remaining(Instant::now()) {
            Some(left) => left.min(idle),
            None => idle,
        };

        if !wait.is_zero() {
            let mut buf = [0u8; READ_BUFFER_LEN];
            match self.serial.read_timeout(&mut buf, wait) {
                Ok(0) => {}
                Ok(n) => self.handle(Event::BytesArrived(buf[..n].to_vec())),
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
        }

        if self.tx.timer_mut().take_expired(Instant::now()) {
            self.handle(Event::TimerExpired);
        }
        Ok(())
    }

    /// Abandons any transfer in either direction without notifying
    pub fn reset(&mut self) {
        self.tx.reset();
        self.rx.reset();
    }

    /// Swaps in a new transport. Protocol state starts over from idle.
    pub fn replace_serial(&mut self, serial: Box<dyn SerialPort>) -> Box<dyn SerialPort> {
        self.reset();
        std::mem::replace(&mut self.serial, serial)
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        if self.config.scan_frames {
            for frame in protocol::decode_all(bytes) {
                self.dispatch(frame);
            }
            return;
        }

        match protocol::decode(bytes) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => tracing::debug!(error = %e, len = bytes.len(), "dropping undecodable input"),
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        let link = self.serial.as_mut();
        match frame.kind {
            FrameKind::Data => self.rx.on_data(&frame, link, &self.notifier),
            FrameKind::Ack => self.tx.on_ack(frame.seq, frame.total, link, &self.notifier),
            FrameKind::PacketAck => self.tx.on_packet_ack(frame.total, &self.notifier),
            FrameKind::Nack => tracing::debug!(seq = frame.seq, total = frame.total, "ignoring NACK"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
