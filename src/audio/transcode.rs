//! Whole-buffer PCM format conversion between the call and remote profiles.
//!
//! Two backends implement [`Transcoder`]:
//! - [`NativeTranscoder`] runs the in-process [`StagePipeline`].
//! - [`FfmpegTranscoder`] pipes the buffer through an external `ffmpeg`
//!   process, as a black-box resampler.
//!
//! Callers must treat an error as "no audio": partial output is never
//! returned.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::format::AudioFormat;
use super::stage::StagePipeline;
use crate::error::TranscodeError;

/// Converts an ordered PCM16LE byte buffer from one format into another.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        input: Vec<u8>,
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Vec<u8>, TranscodeError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Which transcoder backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscoderKind {
    #[default]
    Native,
    Ffmpeg,
}

/// Construct the configured backend.
pub fn build_transcoder(kind: TranscoderKind, ffmpeg_path: &str) -> Arc<dyn Transcoder> {
    match kind {
        TranscoderKind::Native => Arc::new(NativeTranscoder),
        TranscoderKind::Ffmpeg => Arc::new(FfmpegTranscoder::new(ffmpeg_path)),
    }
}

// ── Native ─────────────────────────────────────────────────────────

/// In-process band-limited resampler and channel mixer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTranscoder;

#[async_trait]
impl Transcoder for NativeTranscoder {
    async fn transcode(
        &self,
        input: Vec<u8>,
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Vec<u8>, TranscodeError> {
        StagePipeline::for_conversion(from, to)?.run(&input)
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

// ── ffmpeg ─────────────────────────────────────────────────────────

/// Resamples through an `ffmpeg` child process (`pipe:0` → `pipe:1`).
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(from: AudioFormat, to: AudioFormat) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .iter()
            .map(ToString::to_string)
            .collect();
        args.extend(Self::raw_format(from));
        args.extend(["-i".into(), "pipe:0".into()]);
        args.extend(Self::raw_format(to));
        args.push("pipe:1".into());
        args
    }

    fn raw_format(format: AudioFormat) -> [String; 6] {
        [
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            format.sample_rate.to_string(),
            "-ac".into(),
            format.channels.to_string(),
        ]
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: Vec<u8>,
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Vec<u8>, TranscodeError> {
        let mut child = Command::new(&self.program)
            .args(Self::args(from, to))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TranscodeError::Io(std::io::Error::other("stdin not captured")))?;

        // Feed stdin concurrently so a full stdout pipe cannot deadlock us.
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(TranscodeError::Io)?;

        if !output.status.success() {
            return Err(TranscodeError::ProcessFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TranscodeError::Io(e)),
            Err(e) => return Err(TranscodeError::Io(std::io::Error::other(e))),
        }

        tracing::debug!(
            from = %from,
            to = %to,
            out_bytes = output.stdout.len(),
            "ffmpeg transcode finished"
        );
        Ok(output.stdout)
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}
