//! Opus decoding for call audio (48kHz stereo packets → PCM16LE).

use audiopus::{coder::Decoder, packet::Packet, Channels, MutSignals, SampleRate};
use std::sync::Arc;

use super::format::{samples_to_bytes, AudioFormat};
use super::stage::StreamStage;
use crate::error::TranscodeError;

/// Largest opus frame is 120ms; 48kHz * 0.12s = 5760 samples per channel.
const MAX_FRAME_SAMPLES_PER_CHANNEL: usize = 5760;

/// Creates a fresh decoder stage for each speaking turn.
pub type DecoderFactory =
    Arc<dyn Fn() -> Result<Box<dyn StreamStage>, TranscodeError> + Send + Sync>;

/// Factory producing call-native opus decoders.
pub fn opus_decoder_factory() -> DecoderFactory {
    Arc::new(|| Ok(Box::new(OpusDecodeStage::new()?) as Box<dyn StreamStage>))
}

/// Decodes one opus packet per `process` call into call-native PCM.
pub struct OpusDecodeStage {
    decoder: Decoder,
    channels: usize,
    buffer: Vec<i16>,
}

impl OpusDecodeStage {
    pub fn new() -> Result<Self, TranscodeError> {
        let format = AudioFormat::CALL;
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| TranscodeError::Decode(format!("failed to create decoder: {e}")))?;
        let channels = format.channels as usize;
        Ok(Self {
            decoder,
            channels,
            buffer: vec![0; MAX_FRAME_SAMPLES_PER_CHANNEL * channels],
        })
    }
}

impl StreamStage for OpusDecodeStage {
    fn process(&mut self, packet: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        if packet.is_empty() {
            return Ok(Vec::new());
        }
        let packet = Packet::try_from(packet)
            .map_err(|e| TranscodeError::Decode(format!("invalid packet: {e}")))?;
        let signals = MutSignals::try_from(&mut self.buffer[..])
            .map_err(|e| TranscodeError::Decode(format!("signal buffer: {e}")))?;
        let per_channel = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        Ok(samples_to_bytes(&self.buffer[..per_channel * self.channels]))
    }
}
