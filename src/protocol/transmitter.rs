//! Transmit-side state machine, driven by one call per "ready to send"
//! event. Each call yields the next wire byte, or `None` when nothing is
//! queued (the caller then disables the transmit interrupt).
//!
//! ```text
//!   Idle ──► [IdleEscape] ──► Message ⇄ MessageEscape ──► Crc ──► [CrcEscape] ──► FrameEnd ──► Idle
//!  header       header^0x20     body bytes                  crc      crc^0x20        0x7E
//! ```
//!
//! A message is whatever the source's send FIFO holds when it is selected
//! (at most [`MAX_BODY_LEN`] bytes). The bytes stay reserved in the FIFO
//! until the closing boundary has been handed out; only then is the pop
//! committed and a task waiting for send space woken.

use super::{crc, needs_escape, Header, Mailboxes, ADDRESS_COUNT, BOUNDARY, ESCAPE, ESCAPE_MASK, MAX_BODY_LEN};
use crate::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No frame in progress.
    Idle,
    /// Second half of an escaped header.
    IdleEscape,
    /// Streaming body bytes.
    Message,
    /// Second half of an escaped body byte.
    MessageEscape,
    /// Body done, CRC next.
    Crc,
    /// Second half of an escaped CRC.
    CrcEscape,
    /// Closing boundary next, then commit.
    FrameEnd,
    /// The source was reset mid-frame: close the frame without committing.
    Aborted,
}

/// One step of the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Byte to put on the wire; `None` when the line goes idle.
    pub byte: Option<u8>,
    /// A task waiting for send space was woken.
    pub woke: bool,
}

impl Step {
    const fn byte(byte: u8) -> Self {
        Self {
            byte: Some(byte),
            woke: false,
        }
    }
}

pub struct Transmitter {
    state: State,
    /// Source of the frame being sent.
    address: u8,
    /// Body bytes not yet sent.
    remaining: u8,
    crc: u8,
    /// Second byte of an escape pair.
    pending: u8,
    /// No boundary has been sent since the line went quiet.
    line_idle: bool,
    /// Address served last, for round-robin selection.
    last: u8,
}

impl Transmitter {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            address: 0,
            remaining: 0,
            crc: crc::INIT,
            pending: 0,
            line_idle: true,
            last: (ADDRESS_COUNT - 1) as u8,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Produce the next wire byte.
    pub fn next_byte<'b, M: Mailboxes<'b>>(&mut self, boxes: &mut M) -> Step {
        match self.state {
            State::Idle => self.start_frame(boxes),
            State::IdleEscape | State::MessageEscape => {
                self.state = self.after_body_byte();
                Step::byte(self.pending)
            }
            State::Message => {
                let Some(fifo) = boxes.outbox(self.address) else {
                    self.state = State::Idle;
                    return Step::byte(BOUNDARY);
                };
                let byte = fifo.pop();
                self.remaining -= 1;
                self.crc = crc::update(self.crc, byte);
                if needs_escape(byte) {
                    self.pending = byte ^ ESCAPE_MASK;
                    self.state = State::MessageEscape;
                    Step::byte(ESCAPE)
                } else {
                    self.state = self.after_body_byte();
                    Step::byte(byte)
                }
            }
            State::Crc => {
                if needs_escape(self.crc) {
                    self.pending = self.crc ^ ESCAPE_MASK;
                    self.state = State::CrcEscape;
                    Step::byte(ESCAPE)
                } else {
                    self.state = State::FrameEnd;
                    Step::byte(self.crc)
                }
            }
            State::CrcEscape => {
                self.state = State::FrameEnd;
                Step::byte(self.pending)
            }
            State::FrameEnd => {
                self.state = State::Idle;
                let woke = match boxes.outbox(self.address) {
                    Some(fifo) => {
                        fifo.commit_pop();
                        trace!("tx: frame from {=u8} sent", self.address);
                        boxes.wake(self.address, TaskStatus::WAIT_SEND)
                    }
                    None => false,
                };
                Step {
                    byte: Some(BOUNDARY),
                    woke,
                }
            }
            State::Aborted => {
                self.state = State::Idle;
                Step::byte(BOUNDARY)
            }
        }
    }

    fn after_body_byte(&self) -> State {
        if self.remaining == 0 {
            State::Crc
        } else {
            State::Message
        }
    }

    /// Find the next source with queued bytes, starting after the one
    /// served last.
    fn select_source<'b, M: Mailboxes<'b>>(&self, boxes: &mut M) -> Option<(u8, usize)> {
        (1..=ADDRESS_COUNT)
            .map(|step| ((usize::from(self.last) + step) % ADDRESS_COUNT) as u8)
            .find_map(|address| {
                let queued = boxes.outbox(address).map_or(0, |fifo| fifo.len());
                (queued > 0).then_some((address, queued.min(MAX_BODY_LEN)))
            })
    }

    fn start_frame<'b, M: Mailboxes<'b>>(&mut self, boxes: &mut M) -> Step {
        let Some((address, len)) = self.select_source(boxes) else {
            self.line_idle = true;
            return Step {
                byte: None,
                woke: false,
            };
        };

        if self.line_idle {
            // Open the frame; the source is selected again on the next call.
            self.line_idle = false;
            return Step::byte(BOUNDARY);
        }

        let reserved = boxes
            .outbox(address)
            .is_some_and(|fifo| fifo.begin_pop(len));
        if !reserved {
            return Step {
                byte: None,
                woke: false,
            };
        }

        let header = Header::new(address, len as u8).encode();
        self.last = address;
        self.address = address;
        self.remaining = len as u8;
        self.crc = crc::update(crc::INIT, header);

        if needs_escape(header) {
            self.pending = header ^ ESCAPE_MASK;
            self.state = State::IdleEscape;
            Step::byte(ESCAPE)
        } else {
            self.state = self.after_body_byte();
            Step::byte(header)
        }
    }

    /// Stop sending the frame of `address` (its outbox is being reset). The
    /// next byte closes the frame early so receivers drop it.
    pub fn abort(&mut self, address: u8) {
        if self.state != State::Idle && self.state != State::Aborted && self.address == address {
            self.state = State::Aborted;
        }
    }
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new()
    }
}
