//! Wire format for the ASHA `ReadOnlyProperties` characteristic.
//! 17 bytes, little-endian, packed.

pub const CAPABILITY_RIGHT_SIDE: u8 = 0x01;
pub const CAPABILITY_BINAURAL: u8 = 0x02;
pub const CAPABILITY_CSIS: u8 = 0x04;

pub const FEATURE_STREAMING: u8 = 0x01;

pub const CODEC_G722_16KHZ: u16 = 0x02;

pub const WIRE_LEN: usize = 17;

/// Parsed contents of the ASHA ReadOnlyProperties characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOnlyProperties {
    pub version: u8,
    pub capabilities: u8,
    pub hi_sync_id: u64,
    pub feature_map: u8,
    pub render_delay_ms: u16,
    reserved: u16,
    pub codecs: u16,
}

impl ReadOnlyProperties {
    /// Parse the 17-byte little-endian packed wire format.
    ///
    /// Returns `None` if `bytes` is shorter than [`WIRE_LEN`]; trailing bytes
    /// beyond the 17th are ignored.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WIRE_LEN {
            return None;
        }
        Some(ReadOnlyProperties {
            version: bytes[0],
            capabilities: bytes[1],
            hi_sync_id: u64::from_le_bytes(bytes[2..10].try_into().ok()?),
            feature_map: bytes[10],
            render_delay_ms: u16::from_le_bytes(bytes[11..13].try_into().ok()?),
            reserved: u16::from_le_bytes(bytes[13..15].try_into().ok()?),
            codecs: u16::from_le_bytes(bytes[15..17].try_into().ok()?),
        })
    }

    /// Serialize back to the 17-byte wire format.
    pub fn to_bytes(self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[0] = self.version;
        out[1] = self.capabilities;
        out[2..10].copy_from_slice(&self.hi_sync_id.to_le_bytes());
        out[10] = self.feature_map;
        out[11..13].copy_from_slice(&self.render_delay_ms.to_le_bytes());
        out[13..15].copy_from_slice(&self.reserved.to_le_bytes());
        out[15..17].copy_from_slice(&self.codecs.to_le_bytes());
        out
    }

    /// A side is only admitted if `version == 1`, `feature_map & 1`, and
    /// `codecs & 2`.
    pub fn is_supported(&self) -> bool {
        self.version == 1 && self.feature_map & FEATURE_STREAMING != 0 && self.codecs & CODEC_G722_16KHZ != 0
    }

    pub fn is_right(&self) -> bool {
        self.capabilities & CAPABILITY_RIGHT_SIDE != 0
    }

    pub fn is_binaural(&self) -> bool {
        self.capabilities & CAPABILITY_BINAURAL != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReadOnlyProperties {
        ReadOnlyProperties {
            version: 1,
            capabilities: 0x03,
            hi_sync_id: 0x0102030405060708,
            feature_map: 0x01,
            render_delay_ms: 42,
            reserved: 0,
            codecs: 0x02,
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let props = sample();
        let bytes = props.to_bytes();
        assert_eq!(bytes.len(), WIRE_LEN);
        let parsed = ReadOnlyProperties::parse(&bytes).unwrap();
        assert_eq!(parsed, props);
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(ReadOnlyProperties::parse(&[1, 2, 3]).is_none());
    }

    #[test]
    fn admits_only_version_1_streaming_g722() {
        assert!(sample().is_supported());

        let mut bad_version = sample();
        bad_version.version = 2;
        assert!(!bad_version.is_supported());

        let mut no_streaming = sample();
        no_streaming.feature_map = 0;
        assert!(!no_streaming.is_supported());

        let mut no_g722 = sample();
        no_g722.codecs = 0;
        assert!(!no_g722.is_supported());
    }

    #[test]
    fn capability_bits_identify_side() {
        let mut p = sample();
        p.capabilities = CAPABILITY_RIGHT_SIDE | CAPABILITY_BINAURAL;
        assert!(p.is_right());
        assert!(p.is_binaural());

        p.capabilities = CAPABILITY_BINAURAL;
        assert!(!p.is_right());
    }
}
