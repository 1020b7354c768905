//! Error taxonomy for the relay.
//!
//! Session start failures are fatal and reported to the caller. Failures
//! inside an active session (transcode, player, malformed frames) are
//! contained to the cycle that produced them; only transport loss ends a
//! session.

use crate::audio::AudioFormat;

/// A PCM conversion or decode failed. The affected utterance or play cycle
/// is dropped; the session continues.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("unsupported conversion {from} -> {to}")]
    Unsupported { from: AudioFormat, to: AudioFormat },

    #[error("failed to start transcoder process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("transcoder process exited with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },

    #[error("transcoder I/O failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("opus decode failed: {0}")]
    Decode(String),

    #[error("resampler failed: {0}")]
    Resample(String),
}

/// Remote Link failures.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The credential exchange was rejected.
    #[error("signed URL request rejected ({status}): {body}")]
    Handshake { status: u16, body: String },

    /// The credential exchange could not be performed at all.
    #[error("signed URL request failed: {0}")]
    HandshakeRequest(#[from] reqwest::Error),

    #[error("signed URL response is unusable: {0}")]
    InvalidSignedUrl(String),

    /// The duplex connection could not be opened or dropped unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("link was already connected or closed")]
    AlreadyConnected,
}

impl LinkError {
    /// True for the credential-exchange class of failures.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::Handshake { .. } | Self::HandshakeRequest(_) | Self::InvalidSignedUrl(_)
        )
    }
}

/// Session lifecycle failures visible to the command dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already active in channel {channel_id}")]
    AlreadyActive { channel_id: String },

    #[error("failed to start session in channel {channel_id}: {source}")]
    Start {
        channel_id: String,
        #[source]
        source: LinkError,
    },
}

/// The call platform's player rejected a resource.
#[derive(Debug, Clone, thiserror::Error)]
#[error("player error: {0}")]
pub struct PlayerError(pub String);
