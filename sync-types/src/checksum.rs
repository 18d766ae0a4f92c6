//! Checksums used by wearable transfer protocols.
//!
//! - CRC-32 (zlib / ISO-HDLC) for Zepp OS history payloads
//! - CRC-16 (Garmin/FIT nibble table, equivalent to CRC-16/ARC) for GFDI
//!   frames and file transfer chunks

const CRC16_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
    0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// Which checksum a family uses to protect a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumKind {
    /// No payload checksum.
    None,
    /// Garmin/FIT CRC-16.
    Crc16,
    /// zlib CRC-32.
    Crc32,
}

impl ChecksumKind {
    /// Number of bytes the checksum occupies on the wire.
    pub fn width(&self) -> usize {
        match self {
            ChecksumKind::None => 0,
            ChecksumKind::Crc16 => 2,
            ChecksumKind::Crc32 => 4,
        }
    }

    /// Compute this checksum over `data`, widened to `u32`.
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            ChecksumKind::None => 0,
            ChecksumKind::Crc16 => u32::from(crc16(data)),
            ChecksumKind::Crc32 => crc32(data),
        }
    }
}

/// CRC-32 over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC-16 over `data`, starting from zero.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0, data)
}

/// Continue a running CRC-16 from `seed`.
///
/// `crc16_update(crc16(a), b) == crc16(a ++ b)`.
pub fn crc16_update(seed: u16, data: &[u8]) -> u16 {
    let mut crc = seed;
    for &byte in data {
        let b = u16::from(byte);
        crc = (((crc >> 4) & 0x0FFF) ^ CRC16_TABLE[(crc & 0x0F) as usize])
            ^ CRC16_TABLE[(b & 0x0F) as usize];
        crc = (((crc >> 4) & 0x0FFF) ^ CRC16_TABLE[(crc & 0x0F) as usize])
            ^ CRC16_TABLE[((b >> 4) & 0x0F) as usize];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn crc32_check_vector() {
        assert_eq!(crc32(CHECK), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn crc16_check_vector() {
        assert_eq!(crc16(CHECK), 0xBB3D);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn crc16_running_matches_one_shot() {
        let (a, b) = CHECK.split_at(4);
        assert_eq!(crc16_update(crc16(a), b), crc16(CHECK));
    }

    #[test]
    fn checksum_kind_widths() {
        assert_eq!(ChecksumKind::None.width(), 0);
        assert_eq!(ChecksumKind::Crc16.width(), 2);
        assert_eq!(ChecksumKind::Crc32.width(), 4);
        assert_eq!(ChecksumKind::Crc16.compute(CHECK), 0xBB3D);
    }
}
