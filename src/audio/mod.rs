//! PCM audio handling for the relay.
//!
//! ## Design
//! - Two fixed PCM16LE profiles: call-native (48kHz stereo) and
//!   remote-native (16kHz mono)
//! - Streaming stages (`StreamStage`) that carry partial frames between
//!   chunks and compose into a `StagePipeline`
//! - Whole-buffer `Transcoder` backends: in-process stages or an `ffmpeg`
//!   child process
//! - Opus decoding of raw call packets

pub mod format;
pub mod opus;
pub mod stage;
pub mod transcode;

pub use format::{AudioFormat, AudioFrame};
pub use opus::{opus_decoder_factory, DecoderFactory, OpusDecodeStage};
pub use stage::{StagePipeline, StreamStage};
pub use transcode::{
    build_transcoder, FfmpegTranscoder, NativeTranscoder, Transcoder, TranscoderKind,
};
