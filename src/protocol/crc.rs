//! CRC-8/CCITT: polynomial `x^8 + x^2 + x + 1` (0x07), initial value 0, no
//! reflection, no final XOR.
//!
//! Running the CRC over a message followed by its own CRC byte yields
//! [`VALID`], which is how the receiver checks a frame without knowing in
//! advance which byte is the last body byte.

pub const POLYNOMIAL: u8 = 0x07;

/// Initial register value.
pub const INIT: u8 = 0x00;

/// Register value after folding in a correct CRC byte.
pub const VALID: u8 = 0x00;

const TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Fold one byte into the running CRC.
#[inline]
pub const fn update(crc: u8, byte: u8) -> u8 {
    TABLE[(crc ^ byte) as usize]
}

/// CRC of a complete byte sequence.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(INIT, |crc, &byte| update(crc, byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(checksum(b"123456789"), 0xF4);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(checksum(&[]), INIT);
    }

    #[test]
    fn test_appended_crc_validates() {
        let message = [0x85, 0x01, 0x7E, 0x7D, 0xFF, 0x00];
        let crc = checksum(&message);
        assert_eq!(update(checksum(&message), crc), VALID);
        assert_ne!(update(checksum(&message), crc ^ 0x01), VALID);
    }
}
