//! PCM stream format and unit conversions
//!
//! All byte/frame/millisecond conversions used by the ring buffer sizing,
//! the pump and delay reporting live here so rounding is consistent.

use crate::error::OpenError;

/// Sample encoding of the interleaved PCM stream
///
/// 24-bit formats come in two layouts: `S24Le` etc. are 24 bits in a 4-byte
/// container, `S24Le3` etc. are packed into 3 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// 32-bit float, native endianness
    Float,
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    S24Le,
    S24Be,
    U24Le,
    U24Be,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
    S24Le3,
    S24Be3,
    U24Le3,
    U24Be3,
}

impl SampleFormat {
    /// Bytes occupied by one sample of one channel
    pub fn bytes_per_sample(self) -> usize {
        use SampleFormat::*;
        match self {
            S8 | U8 => 1,
            S16Le | S16Be | U16Le | U16Be => 2,
            S24Le3 | S24Be3 | U24Le3 | U24Be3 => 3,
            Float | S24Le | S24Be | U24Le | U24Be | S32Le | S32Be | U32Le | U32Be => 4,
        }
    }
}

/// Negotiated stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub format: SampleFormat,
    pub channels: u16,
    pub rate: u32,
}

/// `value * to / from`, computed in 64 bits
pub fn rescale(value: u64, from: u64, to: u64) -> u64 {
    if from == 0 {
        return 0;
    }
    value.saturating_mul(to) / from
}

impl StreamFormat {
    pub fn new(format: SampleFormat, channels: u16, rate: u32) -> Self {
        Self {
            format,
            channels,
            rate,
        }
    }

    /// Reject parameters no device could accept
    pub fn validate(&self) -> Result<(), OpenError> {
        if self.channels == 0 {
            return Err(OpenError::InvalidParameters(
                "channel count must be at least 1".to_string(),
            ));
        }
        if self.rate == 0 {
            return Err(OpenError::InvalidParameters("sample rate must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Bytes per interleaved frame (one sample for every channel)
    pub fn frame_bytes(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Whole frames contained in `bytes` (partial trailing frame ignored)
    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        bytes / self.frame_bytes()
    }

    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.frame_bytes()
    }

    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        rescale(frames, self.rate as u64, 1000)
    }

    pub fn ms_to_frames(&self, ms: u64) -> u64 {
        rescale(ms, 1000, self.rate as u64)
    }

    /// Playback time of `bytes`, counting whole frames only
    pub fn bytes_to_ms(&self, bytes: usize) -> u64 {
        self.frames_to_ms(self.bytes_to_frames(bytes) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(StreamFormat::new(SampleFormat::S16Le, 2, 44100).frame_bytes(), 4);
        assert_eq!(StreamFormat::new(SampleFormat::S24Le3, 2, 48000).frame_bytes(), 6);
        assert_eq!(StreamFormat::new(SampleFormat::Float, 6, 48000).frame_bytes(), 24);
        assert_eq!(StreamFormat::new(SampleFormat::U8, 1, 8000).frame_bytes(), 1);
    }

    #[test]
    fn test_conversions() {
        let fmt = StreamFormat::new(SampleFormat::S16Le, 2, 44100);
        assert_eq!(fmt.ms_to_frames(250), 11025);
        assert_eq!(fmt.frames_to_bytes(11025), 44100);
        assert_eq!(fmt.bytes_to_ms(44100), 250);
        // Partial frame does not count
        assert_eq!(fmt.bytes_to_frames(7), 1);
    }

    #[test]
    fn test_rescale_zero_divisor() {
        assert_eq!(rescale(10, 0, 1000), 0);
    }

    #[test]
    fn test_validate() {
        assert!(StreamFormat::new(SampleFormat::S16Le, 0, 44100).validate().is_err());
        assert!(StreamFormat::new(SampleFormat::S16Le, 2, 0).validate().is_err());
        assert!(StreamFormat::new(SampleFormat::S16Le, 2, 44100).validate().is_ok());
    }
}
