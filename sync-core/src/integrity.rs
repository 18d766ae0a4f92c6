//! Payload integrity checks.

use serde::{Deserialize, Serialize};
use sync_types::checksum::{crc16, crc32, ChecksumKind};
use sync_types::WireError;

/// What a family does when a payload fails its checksum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchPolicy {
    /// Abort the round without acknowledging.
    #[default]
    Abort,
    /// Acknowledge, but tell the device to keep the data for a retry.
    RetainOnDevice,
}

/// A reassembled payload that went through integrity checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayload {
    /// Payload bytes, without any embedded checksum.
    pub bytes: Vec<u8>,
    /// Whether the checksum matched (true when the family has none).
    pub checksum_valid: bool,
}

/// Checksum validation for one device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityVerifier {
    kind: ChecksumKind,
    policy: MismatchPolicy,
}

impl IntegrityVerifier {
    /// Create a verifier.
    pub fn new(kind: ChecksumKind, policy: MismatchPolicy) -> Self {
        Self { kind, policy }
    }

    /// Check a zlib CRC-32.
    pub fn verify_crc32(payload: &[u8], expected: u32) -> bool {
        crc32(payload) == expected
    }

    /// Check a Garmin CRC-16.
    pub fn verify_crc16(payload: &[u8], expected: u16) -> bool {
        crc16(payload) == expected
    }

    /// Check `payload` against `expected` using this family's checksum.
    ///
    /// `None` means the device sent no checksum, which is accepted.
    pub fn verify(&self, payload: &[u8], expected: Option<u32>) -> bool {
        match (self.kind, expected) {
            (ChecksumKind::None, _) | (_, None) => true,
            (ChecksumKind::Crc32, Some(crc)) => Self::verify_crc32(payload, crc),
            (ChecksumKind::Crc16, Some(crc)) => match u16::try_from(crc) {
                Ok(crc) => Self::verify_crc16(payload, crc),
                Err(_) => false,
            },
        }
    }

    /// Strip a little-endian checksum from the end of `bytes`.
    ///
    /// Returns the payload and the checksum; for [`ChecksumKind::None`] the
    /// bytes are returned unchanged with no checksum.
    pub fn split_embedded(&self, mut bytes: Vec<u8>) -> Result<(Vec<u8>, Option<u32>), WireError> {
        let width = self.kind.width();
        if width == 0 {
            return Ok((bytes, None));
        }
        if bytes.len() < width {
            return Err(WireError::Truncated {
                needed: width,
                got: bytes.len(),
            });
        }
        let trailer = bytes.split_off(bytes.len() - width);
        let crc = trailer
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        Ok((bytes, Some(crc)))
    }

    /// Checksum kind in use.
    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    /// Mismatch policy in use.
    pub fn policy(&self) -> MismatchPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn check_vectors() {
        assert!(IntegrityVerifier::verify_crc32(CHECK, 0xCBF4_3926));
        assert!(!IntegrityVerifier::verify_crc32(CHECK, 0xCBF4_3927));
        assert!(IntegrityVerifier::verify_crc16(CHECK, 0xBB3D));
    }

    #[test]
    fn verify_dispatches_on_kind() {
        let v32 = IntegrityVerifier::new(ChecksumKind::Crc32, MismatchPolicy::Abort);
        assert!(v32.verify(CHECK, Some(0xCBF4_3926)));
        assert!(!v32.verify(CHECK, Some(0xBB3D)));
        assert!(v32.verify(CHECK, None));

        let v16 = IntegrityVerifier::new(ChecksumKind::Crc16, MismatchPolicy::RetainOnDevice);
        assert!(v16.verify(CHECK, Some(0xBB3D)));
        assert!(!v16.verify(CHECK, Some(0x1_BB3D)));

        let none = IntegrityVerifier::new(ChecksumKind::None, MismatchPolicy::Abort);
        assert!(none.verify(CHECK, Some(0)));
    }

    #[test]
    fn split_embedded_strips_trailer() {
        let v = IntegrityVerifier::new(ChecksumKind::Crc16, MismatchPolicy::Abort);
        let mut framed = CHECK.to_vec();
        framed.extend_from_slice(&0xBB3Du16.to_le_bytes());

        let (payload, crc) = v.split_embedded(framed).unwrap();
        assert_eq!(payload, CHECK);
        assert_eq!(crc, Some(0xBB3D));
        assert!(v.verify(&payload, crc));

        let v32 = IntegrityVerifier::new(ChecksumKind::Crc32, MismatchPolicy::Abort);
        let mut framed = CHECK.to_vec();
        framed.extend_from_slice(&0xCBF4_3926u32.to_le_bytes());
        assert_eq!(v32.split_embedded(framed).unwrap().1, Some(0xCBF4_3926));

        assert!(v32.split_embedded(vec![1, 2]).is_err());
    }
}
