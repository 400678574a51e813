//! # Framing Protocol
//!
//! Byte-stream framing between the host and the task FIFOs. Two
//! independent interrupt-driven state machines share the wire format
//! defined here: [`receiver::Receiver`] turns incoming bytes into committed
//! FIFO content, [`transmitter::Transmitter`] drains send FIFOs onto the
//! wire.
//!
//! ## Wire Format
//!
//! ```text
//!  0x7E │ header │ body[0..len] │ crc │ 0x7E
//!       └──────── escaped ─────────────┘
//!
//!  header = address << 7 | len      (1 address bit, 7 length bits)
//!  crc    = CRC-8/CCITT over header and body
//! ```
//!
//! Any escaped byte equal to [`BOUNDARY`] or [`ESCAPE`] is sent as
//! `ESCAPE, byte ^ ESCAPE_MASK`. Consecutive frames may share one boundary
//! byte. The wire address is the task slot.

pub mod crc;
pub mod receiver;
pub mod transmitter;

pub use receiver::{Receiver, ReceiverStats};
pub use transmitter::Transmitter;

use crate::fifo::Fifo;
use crate::task::TaskStatus;

/// Frame delimiter.
pub const BOUNDARY: u8 = 0x7E;

/// Escape prefix.
pub const ESCAPE: u8 = 0x7D;

/// XOR applied to the byte following [`ESCAPE`].
pub const ESCAPE_MASK: u8 = 0x20;

/// Header bits used for the body length.
pub const LENGTH_BITS: u32 = 7;

/// Header bits used for the destination/source address.
pub const ADDRESS_BITS: u32 = 8 - LENGTH_BITS;

/// Longest body a single frame carries.
pub const MAX_BODY_LEN: usize = (1 << LENGTH_BITS) - 1;

/// Number of addressable task slots.
pub const ADDRESS_COUNT: usize = 1 << ADDRESS_BITS;

const _: () = assert!(ADDRESS_COUNT <= crate::config::TASK_COUNT);

/// Whether `byte` must be escaped on the wire.
#[inline]
pub const fn needs_escape(byte: u8) -> bool {
    byte == BOUNDARY || byte == ESCAPE
}

/// Frame header: destination (receive) or source (send) address and body
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub address: u8,
    pub len: u8,
}

impl Header {
    /// Caller keeps `address < ADDRESS_COUNT` and `len <= MAX_BODY_LEN`.
    pub const fn new(address: u8, len: u8) -> Self {
        Self { address, len }
    }

    pub const fn encode(self) -> u8 {
        (self.address << LENGTH_BITS) | (self.len & MAX_BODY_LEN as u8)
    }

    pub const fn decode(byte: u8) -> Self {
        Self {
            address: byte >> LENGTH_BITS,
            len: byte & MAX_BODY_LEN as u8,
        }
    }
}

/// The per-address FIFOs and wait bits the state machines operate on.
///
/// Implemented by the scheduler's task table; tests can supply their own.
pub trait Mailboxes<'buf> {
    /// Receive FIFO of `address`, if that slot takes part in the protocol.
    fn inbox(&mut self, address: u8) -> Option<&mut Fifo<'buf>>;

    /// Send FIFO of `address`, if that slot takes part in the protocol.
    fn outbox(&mut self, address: u8) -> Option<&mut Fifo<'buf>>;

    /// Wake the task at `address` if it waits on `reason`.
    fn wake(&mut self, address: u8, reason: TaskStatus) -> bool;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_split() {
        assert_eq!(ADDRESS_COUNT, 2);
        assert_eq!(MAX_BODY_LEN, 127);
        assert_eq!(Header::new(1, 5).encode(), 0x85);
        assert_eq!(Header::new(0, 127).encode(), 0x7F);
        assert_eq!(Header::decode(0x85), Header::new(1, 5));
        assert_eq!(Header::decode(0x00), Header::new(0, 0));
    }

    #[test]
    fn test_needs_escape() {
        assert!(needs_escape(0x7E));
        assert!(needs_escape(0x7D));
        assert!(!needs_escape(0x7C));
        assert!(!needs_escape(0x5E));
    }
}
