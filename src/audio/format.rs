//! PCM format descriptors shared by both relay directions.
//!
//! Every buffer that crosses a component boundary is 16-bit signed
//! little-endian PCM, interleaved when stereo. Only the sample rate and
//! channel count vary.

use std::fmt;

/// Bytes per sample for PCM16.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate and channel layout of a PCM16LE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Voice-call native audio: 48kHz stereo.
    pub const CALL: Self = Self {
        sample_rate: 48_000,
        channels: 2,
    };

    /// Conversational endpoint native audio: 16kHz mono.
    pub const REMOTE: Self = Self {
        sample_rate: 16_000,
        channels: 1,
    };

    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Size in bytes of one interleaved frame (one sample per channel).
    pub fn frame_bytes(self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Number of bytes covering `ms` milliseconds of audio.
    pub fn bytes_for_millis(self, ms: u64) -> usize {
        (self.sample_rate as u64 * ms / 1000) as usize * self.frame_bytes()
    }

    /// Playback duration of `bytes` of audio in this format, in milliseconds.
    pub fn millis_for_bytes(self, bytes: usize) -> u64 {
        let frames = (bytes / self.frame_bytes()) as u64;
        frames * 1000 / self.sample_rate as u64
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.channels {
            1 => "mono",
            2 => "stereo",
            _ => "multi",
        };
        write!(f, "{}Hz/{layout}", self.sample_rate)
    }
}

/// An immutable PCM16LE buffer tagged with its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    format: AudioFormat,
    data: Vec<u8>,
}

impl AudioFrame {
    pub fn new(format: AudioFormat, data: Vec<u8>) -> Self {
        Self { format, data }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn duration_ms(&self) -> u64 {
        self.format.millis_for_bytes(self.data.len())
    }
}

/// Decode PCM16LE bytes into samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as PCM16LE bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_formats() {
        assert_eq!(AudioFormat::CALL.frame_bytes(), 4);
        assert_eq!(AudioFormat::REMOTE.frame_bytes(), 2);
        assert_eq!(AudioFormat::CALL.to_string(), "48000Hz/stereo");
        assert_eq!(AudioFormat::REMOTE.to_string(), "16000Hz/mono");
    }

    #[test]
    fn byte_duration_conversions() {
        // 20ms opus frame at 48kHz stereo
        assert_eq!(AudioFormat::CALL.bytes_for_millis(20), 3840);
        assert_eq!(AudioFormat::REMOTE.millis_for_bytes(32_000), 1000);
    }

    #[test]
    fn sample_conversion_is_little_endian() {
        let bytes = samples_to_bytes(&[1, -2, i16::MAX]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF, 0xFF, 0x7F]);
        assert_eq!(bytes_to_samples(&bytes), vec![1, -2, i16::MAX]);
        assert_eq!(bytes_to_samples(&[0x01, 0x00, 0x05]), vec![1]);
    }

    #[test]
    fn frame_reports_duration() {
        let frame = AudioFrame::new(AudioFormat::REMOTE, vec![0; 3200]);
        assert_eq!(frame.duration_ms(), 100);
        assert_eq!(frame.len(), 3200);
        assert!(!frame.is_empty());
    }
}
