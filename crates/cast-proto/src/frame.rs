//! Canonical audio format, fixed end-to-end.
//!
//! Every byte of PCM in the pipeline is s16le, stereo, 48 kHz. The quantum of
//! both the socket protocol and the pump-to-encoder path is one frame of
//! 1024 samples = 4096 bytes ≈ 21.333 ms.

use std::time::Duration;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
pub const BYTES_PER_SAMPLE: u32 = 2;
pub const FRAME_SAMPLES: u32 = 1_024;

/// Bytes per frame: 1024 samples × 2 channels × 2 bytes = 4096.
pub const FRAME_BYTES: usize = (FRAME_SAMPLES * CHANNELS * BYTES_PER_SAMPLE) as usize;

/// Nominal frame period: FRAME_SAMPLES / SAMPLE_RATE ≈ 21.333 ms.
pub fn frame_period() -> Duration {
    Duration::from_secs_f64(f64::from(FRAME_SAMPLES) / f64::from(SAMPLE_RATE))
}

/// A frame of digital silence.
pub fn silence_frame() -> Vec<u8> {
    vec![0u8; FRAME_BYTES]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_constants_agree() {
        assert_eq!(FRAME_BYTES, 4096);
        let period = frame_period();
        assert!(period > Duration::from_micros(21_300));
        assert!(period < Duration::from_micros(21_400));
    }

    #[test]
    fn silence_is_zeroed() {
        let frame = silence_frame();
        assert_eq!(frame.len(), FRAME_BYTES);
        assert!(frame.iter().all(|&b| b == 0));
    }
}
