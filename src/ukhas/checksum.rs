//! # UKHAS Sentence Checksums
//!
//! The two checksum variants a UKHAS sentence may carry after its `*`:
//!
//! - **XOR**: 8-bit running XOR, rendered as 2 uppercase hex digits
//! - **CRC16-CCITT**: polynomial 0x1021, initial value 0xFFFF, MSB first,
//!   no final XOR, rendered as 4 uppercase hex digits

/// CRC-16-CCITT polynomial
const CRC16_POLY: u16 = 0x1021;

/// CRC-16-CCITT initial value
const CRC16_INIT: u16 = 0xFFFF;

/// Precomputed CRC16 lookup table for fast calculation
const CRC16_TABLE: [u16; 256] = generate_crc16_table();

/// Generate CRC16 lookup table at compile time
const fn generate_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Checksum variant, identified by the length of the hex digits in a sentence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// 2 hex digits
    Xor,
    /// 4 hex digits
    Crc16Ccitt,
}

impl ChecksumKind {
    /// Pick the variant from the number of checksum digits
    pub fn from_digits(len: usize) -> Option<Self> {
        match len {
            2 => Some(Self::Xor),
            4 => Some(Self::Crc16Ccitt),
            _ => None,
        }
    }

    /// Name used by the `checksum` key of a sentence configuration
    pub fn name(self) -> &'static str {
        match self {
            Self::Xor => "xor",
            Self::Crc16Ccitt => "crc16-ccitt",
        }
    }

    /// Compute the expected checksum digits for `data`
    pub fn compute(self, data: &[u8]) -> String {
        match self {
            Self::Xor => xor8(data),
            Self::Crc16Ccitt => crc16_ccitt(data),
        }
    }
}

/// Calculate the XOR checksum of `data`
///
/// # Examples
///
/// ```
/// use habitat_listener::ukhas::checksum::xor8;
///
/// assert_eq!(xor8(b""), "00");
/// assert_eq!(xor8(b"A"), "41");
/// ```
pub fn xor8(data: &[u8]) -> String {
    let checksum = data.iter().fold(0u8, |acc, &byte| acc ^ byte);
    format!("{:02X}", checksum)
}

/// Calculate the CRC16-CCITT checksum of `data` using the lookup table
///
/// # Examples
///
/// ```
/// use habitat_listener::ukhas::checksum::crc16_ccitt;
///
/// assert_eq!(crc16_ccitt(b""), "FFFF");
/// assert_eq!(crc16_ccitt(b"123456789"), "29B1");
/// ```
pub fn crc16_ccitt(data: &[u8]) -> String {
    format!("{:04X}", crc16_ccitt_value(data))
}

fn crc16_ccitt_value(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;

    for &byte in data {
        let index = ((crc >> 8) ^ byte as u16) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[index];
    }

    crc
}

/// Bitwise CRC16-CCITT (slow, for verification of the table)
#[allow(dead_code)]
fn crc16_ccitt_slow(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;

    for &byte in data {
        crc ^= (byte as u16) << 8;

        for _ in 0..8 {
            let bit = crc & 0x8000;
            crc <<= 1;
            if bit != 0 {
                crc ^= CRC16_POLY;
            }
        }
    }

    crc
}
