//! CRC16 of P1 telegrams (CRC-16/ARC, polynomial 0x8005 reflected, init 0).
//!
//! The checksum covers everything from the leading `/` up to and including
//! the `!`, and is sent as four uppercase hex digits.

use crc::{Crc, CRC_16_ARC};

const P1_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Calculates the telegram checksum over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    P1_CRC.checksum(data)
}

/// Parses the hex digits following `!`.
pub fn parse_crc_digits(digits: &str) -> Option<u16> {
    if digits.len() != crate::constants::CRC_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

/// Appends `!` and the checksum to a telegram that ends with a line break.
///
/// Meter simulators and tests use this to produce valid telegrams.
pub fn seal_telegram(body: &str) -> String {
    let mut telegram = String::with_capacity(body.len() + 7);
    telegram.push_str(body);
    telegram.push('!');
    let crc = crc16(telegram.as_bytes());
    telegram.push_str(&format!("{crc:04X}\r\n"));
    telegram
}
