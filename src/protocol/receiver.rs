//! Receive-side state machine, driven by one call per received byte.
//!
//! ```text
//!            0x7E                 header               len bytes      crc
//!  Error ─────────► Idle ───────────────────► Message ──────────► Message ──► FrameEnd
//!    ▲               │ 0x7D                      ▲ │ 0x7D                        │ 0x7E
//!    │               ▼          header^0x20      │ ▼                             ▼
//!    │           IdleEscape ─────────────────────┘ MessageEscape               Idle
//!    │
//!    └── escape violation, no inbox, inbox full, stray byte after crc,
//!        hardware error flag
//! ```
//!
//! A boundary byte always returns to `Idle`; inside a frame that drops the
//! partial frame. Body bytes go straight into a reserved window of the
//! destination inbox and become visible only when the CRC matches.

use super::{crc, Header, Mailboxes, BOUNDARY, ESCAPE, ESCAPE_MASK};
use crate::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Discarding until the next boundary byte.
    Error,
    /// Between frames; the next byte is a header.
    Idle,
    /// The header byte is escaped.
    IdleEscape,
    /// Collecting body bytes, then the CRC.
    Message,
    /// The next body or CRC byte is escaped.
    MessageEscape,
    /// CRC consumed; only a boundary byte may follow.
    FrameEnd,
}

/// Frame counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverStats {
    /// Frames committed to an inbox.
    pub accepted: u16,
    /// Frames dropped for any reason.
    pub dropped: u16,
}

pub struct Receiver {
    state: State,
    /// Destination of the frame being collected.
    address: u8,
    /// Body bytes still expected before the CRC.
    remaining: u8,
    crc: u8,
    stats: ReceiverStats,
}

impl Receiver {
    pub const fn new() -> Self {
        Self {
            // Nothing is known about the line until a boundary is seen.
            state: State::Error,
            address: 0,
            remaining: 0,
            crc: crc::INIT,
            stats: ReceiverStats {
                accepted: 0,
                dropped: 0,
            },
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    fn in_frame(&self) -> bool {
        matches!(self.state, State::Message | State::MessageEscape)
    }

    fn drop_frame(&mut self) {
        self.stats.dropped = self.stats.dropped.wrapping_add(1);
    }

    /// Feed one byte. `error` is the hardware's framing/overrun/noise flag
    /// for this byte.
    ///
    /// Returns `true` when a committed frame woke the destination task, in
    /// which case the caller should request a reschedule.
    pub fn on_byte<'b, M: Mailboxes<'b>>(&mut self, byte: u8, error: bool, boxes: &mut M) -> bool {
        if error {
            if self.in_frame() {
                self.drop_frame();
            }
            self.state = State::Error;
            return false;
        }

        if byte == BOUNDARY {
            if self.in_frame() {
                debug!("rx: premature frame end for {=u8}", self.address);
                self.drop_frame();
            }
            self.state = State::Idle;
            return false;
        }

        match self.state {
            State::Error => false,
            State::FrameEnd => {
                self.state = State::Error;
                false
            }
            State::Idle if byte == ESCAPE => {
                self.state = State::IdleEscape;
                false
            }
            State::Message if byte == ESCAPE => {
                self.state = State::MessageEscape;
                false
            }
            State::IdleEscape | State::MessageEscape if byte == ESCAPE => {
                if self.state == State::MessageEscape {
                    self.drop_frame();
                }
                self.state = State::Error;
                false
            }
            State::Idle => {
                self.begin_frame(byte, boxes);
                false
            }
            State::IdleEscape => {
                self.begin_frame(byte ^ ESCAPE_MASK, boxes);
                false
            }
            State::Message => self.frame_byte(byte, boxes),
            State::MessageEscape => self.frame_byte(byte ^ ESCAPE_MASK, boxes),
        }
    }

    fn begin_frame<'b, M: Mailboxes<'b>>(&mut self, header: u8, boxes: &mut M) {
        let Header { address, len } = Header::decode(header);
        let reserved = boxes
            .inbox(address)
            .is_some_and(|fifo| fifo.begin_push(usize::from(len)));
        if !reserved {
            debug!("rx: no room for {=u8} bytes to {=u8}", len, address);
            self.drop_frame();
            self.state = State::Error;
            return;
        }
        self.address = address;
        self.remaining = len;
        self.crc = crc::update(crc::INIT, header);
        self.state = State::Message;
    }

    fn frame_byte<'b, M: Mailboxes<'b>>(&mut self, byte: u8, boxes: &mut M) -> bool {
        self.crc = crc::update(self.crc, byte);

        if self.remaining > 0 {
            self.remaining -= 1;
            if let Some(fifo) = boxes.inbox(self.address) {
                fifo.push(byte);
            }
            self.state = State::Message;
            return false;
        }

        // This was the CRC byte.
        self.state = State::FrameEnd;
        if self.crc != crc::VALID {
            debug!("rx: crc mismatch for {=u8}", self.address);
            self.drop_frame();
            return false;
        }
        let Some(fifo) = boxes.inbox(self.address) else {
            self.drop_frame();
            return false;
        };
        fifo.commit_push();
        self.stats.accepted = self.stats.accepted.wrapping_add(1);
        trace!("rx: frame for {=u8}", self.address);
        boxes.wake(self.address, TaskStatus::WAIT_RECV)
    }

    /// Drop a frame in progress for `address` (its inbox is being reset).
    pub fn abort(&mut self, address: u8) {
        if self.in_frame() && self.address == address {
            self.drop_frame();
            self.state = State::Error;
        }
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::TestMailboxes;
    use crate::protocol::crc::checksum;

    /// Wire bytes for one frame, escaped, with both boundaries.
    fn frame(address: u8, body: &[u8]) -> Vec<u8> {
        let header = Header::new(address, body.len() as u8).encode();
        let mut raw = vec![header];
        raw.extend_from_slice(body);
        raw.push(checksum(&raw));

        let mut wire = vec![BOUNDARY];
        for byte in raw {
            if crate::protocol::needs_escape(byte) {
                wire.extend_from_slice(&[ESCAPE, byte ^ ESCAPE_MASK]);
            } else {
                wire.push(byte);
            }
        }
        wire.push(BOUNDARY);
        wire
    }

    fn feed(rx: &mut Receiver, boxes: &mut TestMailboxes, bytes: &[u8]) -> bool {
        bytes
            .iter()
            .fold(false, |woke, &b| rx.on_byte(b, false, boxes) | woke)
    }

    #[test]
    fn test_valid_frame_is_committed() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(16);

        feed(&mut rx, &mut boxes, &frame(1, &[0x10, 0x20, 0x30]));
        assert_eq!(boxes.received(1), vec![0x10, 0x20, 0x30]);
        assert_eq!(rx.state(), State::Idle);
        assert_eq!(rx.stats(), ReceiverStats { accepted: 1, dropped: 0 });
    }

    #[test]
    fn test_escaped_bytes_are_restored() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(16);
        let body = [BOUNDARY, ESCAPE, 0x5E, 0x5D];

        let wire = frame(0, &body);
        assert_eq!(&wire[2..4], &[ESCAPE, BOUNDARY ^ ESCAPE_MASK]);
        feed(&mut rx, &mut boxes, &wire);
        assert_eq!(boxes.received(0), body.to_vec());
    }

    #[test]
    fn test_escaped_header() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(128);
        // address 0, length 126 encodes to the boundary byte itself.
        let body = [0xAB; 126];
        let wire = frame(0, &body);
        assert_eq!(&wire[1..3], &[ESCAPE, BOUNDARY ^ ESCAPE_MASK]);

        feed(&mut rx, &mut boxes, &wire);
        assert_eq!(boxes.received(0), body.to_vec());
    }

    #[test]
    fn test_empty_body() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(4);
        feed(&mut rx, &mut boxes, &frame(1, &[]));
        assert_eq!(rx.stats().accepted, 1);
        assert!(boxes.received(1).is_empty());
    }

    #[test]
    fn test_crc_mismatch_is_dropped() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(16);
        let mut wire = frame(1, &[1, 2, 3]);
        let crc_index = wire.len() - 2;
        wire[crc_index] ^= 0x01;

        feed(&mut rx, &mut boxes, &wire);
        assert!(boxes.received(1).is_empty());
        assert_eq!(rx.stats(), ReceiverStats { accepted: 0, dropped: 1 });
    }

    #[test]
    fn test_premature_boundary_drops_frame() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(16);
        let wire = frame(1, &[1, 2, 3, 4]);

        feed(&mut rx, &mut boxes, &wire[..4]);
        feed(&mut rx, &mut boxes, &[BOUNDARY]);
        assert_eq!(rx.state(), State::Idle);
        assert_eq!(rx.stats().dropped, 1);

        // The line is usable straight away.
        feed(&mut rx, &mut boxes, &frame(1, &[9]));
        assert_eq!(boxes.received(1), vec![9]);
    }

    #[test]
    fn test_full_inbox_drops_and_resyncs() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(4);

        feed(&mut rx, &mut boxes, &frame(1, &[1, 2, 3]));
        feed(&mut rx, &mut boxes, &frame(1, &[4, 5]));
        assert_eq!(rx.stats(), ReceiverStats { accepted: 1, dropped: 1 });

        feed(&mut rx, &mut boxes, &frame(1, &[6]));
        assert_eq!(boxes.received(1), vec![1, 2, 3, 6]);
    }

    #[test]
    fn test_missing_inbox_drops_frame() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(8);
        boxes.inboxes[0] = None;

        feed(&mut rx, &mut boxes, &frame(0, &[1]));
        assert_eq!(rx.stats().dropped, 1);
        assert_eq!(rx.state(), State::Idle);
    }

    #[test]
    fn test_double_escape_is_an_error() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(8);
        let header = Header::new(1, 2).encode();

        feed(&mut rx, &mut boxes, &[BOUNDARY, header, ESCAPE, ESCAPE, 0x01]);
        assert_eq!(rx.state(), State::Error);
        feed(&mut rx, &mut boxes, &frame(1, &[7, 7]));
        assert_eq!(boxes.received(1), vec![7, 7]);
    }

    #[test]
    fn test_stray_byte_after_crc_is_an_error() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(8);
        let mut wire = frame(1, &[5]);
        let closing = wire.len() - 1;
        wire[closing] = 0x00;

        feed(&mut rx, &mut boxes, &wire);
        assert_eq!(rx.state(), State::Error);
        // The frame itself was already committed.
        assert_eq!(boxes.received(1), vec![5]);
    }

    #[test]
    fn test_hardware_error_forces_resync() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(8);
        let wire = frame(1, &[1, 2, 3]);

        feed(&mut rx, &mut boxes, &wire[..3]);
        rx.on_byte(wire[3], true, &mut boxes);
        assert_eq!(rx.state(), State::Error);
        feed(&mut rx, &mut boxes, &wire[4..]);
        assert!(boxes.received(1).is_empty());
        assert_eq!(rx.stats().dropped, 1);
    }

    #[test]
    fn test_commit_wakes_waiting_task() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(8);
        boxes.waiting[1] = TaskStatus::WAIT_RECV | TaskStatus::WAIT_TIMER;

        assert!(!feed(&mut rx, &mut boxes, &frame(0, &[1])));
        assert!(feed(&mut rx, &mut boxes, &frame(1, &[1])));
        assert!(boxes.waiting[1].is_empty());
    }

    #[test]
    fn test_abort_discards_partial_frame() {
        let mut rx = Receiver::new();
        let mut boxes = TestMailboxes::new(8);
        let wire = frame(1, &[1, 2, 3]);

        feed(&mut rx, &mut boxes, &wire[..3]);
        rx.abort(0);
        assert_eq!(rx.state(), State::Message);
        rx.abort(1);
        assert_eq!(rx.state(), State::Error);

        feed(&mut rx, &mut boxes, &wire[3..]);
        assert!(boxes.received(1).is_empty());
    }
}
