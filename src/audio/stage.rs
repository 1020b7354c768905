//! Composable streaming PCM stages.
//!
//! A stage consumes byte chunks of arbitrary size and produces byte chunks.
//! Partial frames are carried over to the next call, so feeding a buffer in
//! pieces yields exactly the same output as feeding it whole. `finish`
//! signals end-of-stream and drains whatever the stage still holds.

use rubato::{FftFixedIn, Resampler};

use super::format::{bytes_to_samples, samples_to_bytes, AudioFormat, BYTES_PER_SAMPLE};
use crate::error::TranscodeError;

/// One step of a streaming audio transform.
pub trait StreamStage: Send {
    /// Transform the next chunk of input.
    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, TranscodeError>;

    /// End of stream: flush buffered state.
    fn finish(&mut self) -> Result<Vec<u8>, TranscodeError> {
        Ok(Vec::new())
    }
}

// ── Frame carry ────────────────────────────────────────────────────

/// Accumulates bytes and hands out whole frames only.
#[derive(Debug)]
struct FrameCarry {
    pending: Vec<u8>,
    frame_bytes: usize,
}

impl FrameCarry {
    fn new(frame_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            frame_bytes,
        }
    }

    /// Append input and return the samples of every complete frame.
    fn take_frames(&mut self, input: &[u8]) -> Vec<i16> {
        self.pending.extend_from_slice(input);
        let whole = self.pending.len() - self.pending.len() % self.frame_bytes;
        let samples = bytes_to_samples(&self.pending[..whole]);
        self.pending.drain(..whole);
        samples
    }

    /// Discard a trailing partial frame, returning how many bytes were lost.
    fn discard(&mut self) -> usize {
        let lost = self.pending.len();
        self.pending.clear();
        lost
    }
}

// ── Channel mix ────────────────────────────────────────────────────

/// Mono/stereo conversion. Stereo to mono averages both channels, mono to
/// stereo duplicates the sample.
pub struct ChannelMix {
    from: u16,
    to: u16,
    carry: FrameCarry,
}

impl ChannelMix {
    pub fn new(from: u16, to: u16) -> Result<Self, TranscodeError> {
        let supported = |c: u16| c == 1 || c == 2;
        if !supported(from) || !supported(to) {
            return Err(TranscodeError::Unsupported {
                from: AudioFormat::new(0, from),
                to: AudioFormat::new(0, to),
            });
        }
        Ok(Self {
            from,
            to,
            carry: FrameCarry::new(from as usize * BYTES_PER_SAMPLE),
        })
    }
}

impl StreamStage for ChannelMix {
    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        let samples = self.carry.take_frames(input);
        let mixed: Vec<i16> = match (self.from, self.to) {
            (2, 1) => samples
                .chunks_exact(2)
                .map(|lr| ((i32::from(lr[0]) + i32::from(lr[1])) / 2) as i16)
                .collect(),
            (1, 2) => samples.iter().flat_map(|&s| [s, s]).collect(),
            _ => samples,
        };
        Ok(samples_to_bytes(&mixed))
    }

    fn finish(&mut self) -> Result<Vec<u8>, TranscodeError> {
        let lost = self.carry.discard();
        if lost > 0 {
            tracing::debug!(bytes = lost, "Dropping trailing partial frame");
        }
        Ok(Vec::new())
    }
}

// ── Resample ───────────────────────────────────────────────────────

/// Band-limited sample rate conversion on top of rubato's FFT resampler.
///
/// Input is cut into the fixed chunks the resampler expects; the remainder
/// waits for the next call. `finish` zero-pads the last chunk, drains the
/// filter delay and trims the output to `input_frames * to / from` frames.
pub struct Resample {
    resampler: FftFixedIn<f64>,
    from_rate: u64,
    to_rate: u64,
    channels: usize,
    carry: FrameCarry,
    pending: Vec<Vec<f64>>,
    delay: usize,
    frames_in: u64,
    frames_out: u64,
}

impl Resample {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Result<Self, TranscodeError> {
        if from_rate == 0 || to_rate == 0 || channels == 0 {
            return Err(TranscodeError::Unsupported {
                from: AudioFormat::new(from_rate, channels),
                to: AudioFormat::new(to_rate, channels),
            });
        }
        let chunk = (from_rate as usize / 50).max(1);
        let resampler =
            FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk, 1, channels as usize)
                .map_err(|e| TranscodeError::Resample(e.to_string()))?;
        let channels = channels as usize;
        Ok(Self {
            delay: resampler.output_delay(),
            resampler,
            from_rate: u64::from(from_rate),
            to_rate: u64::from(to_rate),
            channels,
            carry: FrameCarry::new(channels * BYTES_PER_SAMPLE),
            pending: vec![Vec::new(); channels],
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Output frames owed for everything fed so far.
    fn expected_frames(&self) -> u64 {
        (self.frames_in * self.to_rate + self.from_rate / 2) / self.from_rate
    }

    /// Interleave resampled channels into `out`, skipping the filter delay
    /// and never exceeding `limit` frames in total.
    fn emit(&mut self, planes: &[Vec<f64>], limit: u64, out: &mut Vec<i16>) {
        let frames = planes.first().map_or(0, Vec::len);
        for i in 0..frames {
            if self.delay > 0 {
                self.delay -= 1;
                continue;
            }
            if self.frames_out >= limit {
                return;
            }
            for plane in planes {
                out.push(to_sample(plane[i]));
            }
            self.frames_out += 1;
        }
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.delay = self.resampler.output_delay();
        self.pending.iter_mut().for_each(Vec::clear);
        self.frames_in = 0;
        self.frames_out = 0;
    }
}

impl StreamStage for Resample {
    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        let samples = self.carry.take_frames(input);
        for frame in samples.chunks_exact(self.channels) {
            for (plane, &s) in self.pending.iter_mut().zip(frame) {
                plane.push(f64::from(s) / 32768.0);
            }
        }
        self.frames_in += (samples.len() / self.channels) as u64;

        let mut out = Vec::new();
        loop {
            let need = self.resampler.input_frames_next();
            if self.pending[0].len() < need {
                break;
            }
            let chunk: Vec<Vec<f64>> = self
                .pending
                .iter_mut()
                .map(|plane| plane.drain(..need).collect())
                .collect();
            let planes = self
                .resampler
                .process(&chunk, None)
                .map_err(|e| TranscodeError::Resample(e.to_string()))?;
            self.emit(&planes, u64::MAX, &mut out);
        }
        Ok(samples_to_bytes(&out))
    }

    fn finish(&mut self) -> Result<Vec<u8>, TranscodeError> {
        self.carry.discard();
        let limit = self.expected_frames();
        let mut out = Vec::new();

        if !self.pending[0].is_empty() {
            let tail = std::mem::replace(&mut self.pending, vec![Vec::new(); self.channels]);
            let planes = self
                .resampler
                .process_partial(Some(tail.as_slice()), None)
                .map_err(|e| TranscodeError::Resample(e.to_string()))?;
            self.emit(&planes, limit, &mut out);
        }
        while self.frames_out < limit {
            let planes = self
                .resampler
                .process_partial(None::<&[Vec<f64>]>, None)
                .map_err(|e| TranscodeError::Resample(e.to_string()))?;
            if planes.first().map_or(true, Vec::is_empty) {
                break;
            }
            self.emit(&planes, limit, &mut out);
        }

        self.reset();
        Ok(samples_to_bytes(&out))
    }
}

fn to_sample(value: f64) -> i16 {
    (value * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

// ── Pipeline ───────────────────────────────────────────────────────

/// A chain of stages. Output of each stage feeds the next; end-of-stream
/// and errors propagate down the chain.
#[derive(Default)]
pub struct StagePipeline {
    stages: Vec<Box<dyn StreamStage>>,
}

impl StagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, stage: impl StreamStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Build the stage chain converting `from` into `to`. Channel counts
    /// must be 1 or 2; any pair of non-zero rates is accepted.
    pub fn for_conversion(from: AudioFormat, to: AudioFormat) -> Result<Self, TranscodeError> {
        let unsupported = || TranscodeError::Unsupported { from, to };
        if from.sample_rate == 0 || to.sample_rate == 0 {
            return Err(unsupported());
        }
        let mix = ChannelMix::new(from.channels, to.channels).map_err(|_| unsupported())?;

        let pipeline = if from.sample_rate == to.sample_rate {
            Self::new().then(mix)
        } else if from.sample_rate > to.sample_rate {
            // Mix first so the resampler runs on fewer channels.
            Self::new()
                .then(mix)
                .then(Resample::new(from.sample_rate, to.sample_rate, to.channels)?)
        } else {
            Self::new()
                .then(Resample::new(from.sample_rate, to.sample_rate, from.channels)?)
                .then(mix)
        };
        Ok(pipeline)
    }

    /// Run a whole buffer through the chain, including end-of-stream.
    pub fn run(&mut self, input: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        let mut out = self.process(input)?;
        out.extend(self.finish()?);
        Ok(out)
    }
}

impl StreamStage for StagePipeline {
    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        let mut carry = input.to_vec();
        for stage in &mut self.stages {
            if carry.is_empty() {
                break;
            }
            carry = stage.process(&carry)?;
        }
        Ok(carry)
    }

    fn finish(&mut self) -> Result<Vec<u8>, TranscodeError> {
        let mut carry = Vec::new();
        for stage in &mut self.stages {
            let mut out = if carry.is_empty() {
                Vec::new()
            } else {
                stage.process(&carry)?
            };
            out.extend(stage.finish()?);
            carry = out;
        }
        Ok(carry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, channels: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..frames * channels).map(|i| (i * 7) as i16).collect();
        samples_to_bytes(&samples)
    }

    #[test]
    fn downmix_averages_channels() {
        let mut mix = ChannelMix::new(2, 1).unwrap();
        let out = mix.process(&samples_to_bytes(&[100, 300, -50, 50])).unwrap();
        assert_eq!(bytes_to_samples(&out), vec![200, 0]);
    }

    #[test]
    fn upmix_duplicates_sample() {
        let mut mix = ChannelMix::new(1, 2).unwrap();
        let out = mix.process(&samples_to_bytes(&[5, -6])).unwrap();
        assert_eq!(bytes_to_samples(&out), vec![5, 5, -6, -6]);
    }

    #[test]
    fn rejects_multichannel() {
        assert!(ChannelMix::new(6, 2).is_err());
    }

    fn tone(freq: f64, rate: u32, frames: usize, channels: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..frames)
            .flat_map(|n| {
                let v = (2.0 * std::f64::consts::PI * freq * n as f64 / f64::from(rate)).sin();
                std::iter::repeat((v * 16_000.0) as i16).take(channels)
            })
            .collect();
        samples_to_bytes(&samples)
    }

    /// RMS over the middle half, away from filter edges.
    fn middle_rms(pcm: &[u8]) -> f64 {
        let samples = bytes_to_samples(pcm);
        let (start, end) = (samples.len() / 4, samples.len() * 3 / 4);
        let sum: f64 = samples[start..end]
            .iter()
            .map(|&s| f64::from(s).powi(2))
            .sum();
        (sum / (end - start) as f64).sqrt()
    }

    #[test]
    fn downsampling_suppresses_content_above_new_nyquist() {
        // 12kHz cannot be represented at 16kHz and must not fold back to 4kHz.
        let input = tone(12_000.0, 48_000, 9600, 2);
        let out = StagePipeline::for_conversion(AudioFormat::CALL, AudioFormat::REMOTE)
            .unwrap()
            .run(&input)
            .unwrap();
        assert_eq!(out.len(), 6400);
        assert!(
            middle_rms(&out) < middle_rms(&input) * 0.01,
            "alias energy {} vs input {}",
            middle_rms(&out),
            middle_rms(&input)
        );
    }

    #[test]
    fn downsampling_keeps_speech_band() {
        let input = tone(1_000.0, 48_000, 9600, 2);
        let out = StagePipeline::for_conversion(AudioFormat::CALL, AudioFormat::REMOTE)
            .unwrap()
            .run(&input)
            .unwrap();
        let ratio = middle_rms(&out) / middle_rms(&input);
        assert!((0.9..1.1).contains(&ratio), "passband gain {ratio}");
    }

    #[test]
    fn upsampling_does_not_image_above_source_band() {
        // A 1kHz tone upsampled stays a smooth 1kHz tone.
        let input = tone(1_000.0, 16_000, 3200, 1);
        let out = StagePipeline::for_conversion(AudioFormat::REMOTE, AudioFormat::CALL)
            .unwrap()
            .run(&input)
            .unwrap();
        assert_eq!(out.len(), input.len() * 6);
        let ratio = middle_rms(&out) / middle_rms(&input);
        assert!((0.9..1.1).contains(&ratio), "passband gain {ratio}");
        let left: Vec<i16> = bytes_to_samples(&out).into_iter().step_by(2).collect();
        let max_step = left[left.len() / 4..left.len() * 3 / 4]
            .windows(2)
            .map(|w| (i32::from(w[1]) - i32::from(w[0])).abs())
            .max()
            .unwrap();
        // Ideal step at 1kHz/48kHz with amplitude 16000 is about 2100.
        assert!(max_step < 2600, "max step {max_step}");
    }

    #[test]
    fn call_to_remote_sizes() {
        // 100ms of 48kHz stereo -> 100ms of 16kHz mono
        let mut pipeline =
            StagePipeline::for_conversion(AudioFormat::CALL, AudioFormat::REMOTE).unwrap();
        let out = pipeline.run(&ramp(4800, 2)).unwrap();
        assert_eq!(out.len(), 3200);
    }

    #[test]
    fn remote_to_call_sizes() {
        let mut pipeline =
            StagePipeline::for_conversion(AudioFormat::REMOTE, AudioFormat::CALL).unwrap();
        let out = pipeline.run(&[0u8; 150]).unwrap();
        assert_eq!(out.len(), 900);
    }

    #[test]
    fn chunked_input_matches_whole_input() {
        let input = ramp(997, 2);
        let whole = StagePipeline::for_conversion(AudioFormat::CALL, AudioFormat::REMOTE)
            .unwrap()
            .run(&input)
            .unwrap();

        let mut streamed_pipeline =
            StagePipeline::for_conversion(AudioFormat::CALL, AudioFormat::REMOTE).unwrap();
        let mut streamed = Vec::new();
        // Odd chunk size splits samples and frames across calls.
        for chunk in input.chunks(37) {
            streamed.extend(streamed_pipeline.process(chunk).unwrap());
        }
        streamed.extend(streamed_pipeline.finish().unwrap());

        assert_eq!(streamed, whole);
    }

    #[test]
    fn non_integer_ratio_converts() {
        // 10ms of 44.1kHz stereo
        let mut pipeline =
            StagePipeline::for_conversion(AudioFormat::new(44_100, 2), AudioFormat::REMOTE)
                .unwrap();
        let out = pipeline.run(&ramp(441, 2)).unwrap();
        assert_eq!(out.len(), AudioFormat::REMOTE.bytes_for_millis(10));
    }

    #[test]
    fn zero_rate_is_unsupported() {
        let err = StagePipeline::for_conversion(AudioFormat::new(0, 2), AudioFormat::REMOTE);
        assert!(matches!(err, Err(TranscodeError::Unsupported { .. })));
    }

    #[test]
    fn same_format_is_identity() {
        let mut pipeline =
            StagePipeline::for_conversion(AudioFormat::REMOTE, AudioFormat::REMOTE).unwrap();
        let input = ramp(10, 1);
        assert_eq!(pipeline.run(&input).unwrap(), input);
    }
}
