//! G.722 encoder wrapper. This module adapts the `g722` crate's encoder to
//! the 320-sample-in/160-byte-out shape `Device::send_audio` needs; the
//! codec itself is treated as a black-box collaborator.

/// Samples per 20 ms frame at 16 kHz.
pub const FRAME_SAMPLES: usize = 320;
/// Encoded bytes per frame at the packed, full-rate (64 kbit/s) mode.
pub const FRAME_BYTES: usize = 160;

/// One side's encoder state. `g722::Encoder` carries no internal history
/// beyond a single call's worth of predictor state, so each side (or the
/// mixed-mono path) owns its own instance.
pub struct Encoder(g722::Encoder);

impl Encoder {
    /// `64000` bit/s, packed mode: all 8 bits of every output byte are
    /// used.
    pub fn new() -> Self {
        Encoder(g722::Encoder::new(g722::Rate::Kbps64))
    }

    /// Encode one 20 ms frame. `pcm` is linear 16-bit PCM at 16 kHz.
    pub fn encode(&mut self, pcm: &[i16; FRAME_SAMPLES]) -> [u8; FRAME_BYTES] {
        let mut out = [0u8; FRAME_BYTES];
        self.0.encode(pcm, &mut out);
        out
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Mix two 16-bit PCM channels to mono by arithmetic mean, used when only
/// one side of a pair is present. Widens to `i32` to avoid overflow on the
/// sum.
pub fn mix_mono(left: &[i16; FRAME_SAMPLES], right: &[i16; FRAME_SAMPLES]) -> [i16; FRAME_SAMPLES] {
    let mut mono = [0i16; FRAME_SAMPLES];
    for i in 0..FRAME_SAMPLES {
        mono[i] = ((left[i] as i32 + right[i] as i32) / 2) as i16;
    }
    mono
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixes_by_arithmetic_mean() {
        let left = [100i16; FRAME_SAMPLES];
        let right = [300i16; FRAME_SAMPLES];
        let mono = mix_mono(&left, &right);
        assert!(mono.iter().all(|&s| s == 200));
    }

    #[test]
    fn mix_does_not_overflow_at_extremes() {
        let left = [i16::MAX; FRAME_SAMPLES];
        let right = [i16::MAX; FRAME_SAMPLES];
        let mono = mix_mono(&left, &right);
        assert!(mono.iter().all(|&s| s == i16::MAX));
    }
}
