//! Interfaces consumed from the voice-call platform.
//!
//! The relay never talks to the chat platform directly. Whoever joins the
//! channel hands a [`VoiceConnection`] to the session registry; the
//! connection exposes the bot's player, per-participant audio
//! subscriptions, and a stream of call events.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::error::PlayerError;

/// Identity of a call participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// When a participant's audio subscription ends. The platform also closes
/// the stream when the participant leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndBehavior {
    /// End after this much continuous silence.
    AfterSilence(Duration),
}

/// One call-native frame handed to the player as a single playable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayableResource {
    /// Play-cycle id; echoed back in [`CallEvent::PlayerIdle`] /
    /// [`CallEvent::PlayerError`].
    pub id: u64,
    pub frame: AudioFrame,
}

/// Notifications from the call platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Endpoint-level voice activity: a participant started speaking.
    SpeakingStarted(ParticipantId),
    /// The player finished (or was stopped while playing) the resource.
    PlayerIdle { resource_id: u64 },
    /// The player failed while playing the resource.
    PlayerError { resource_id: u64, message: String },
}

/// The bot's audio output in the call.
pub trait AudioPlayer: Send + Sync {
    /// Start playing `resource`, replacing anything currently playing.
    fn play(&self, resource: PlayableResource) -> Result<(), PlayerError>;

    /// Stop immediately. Safe to call while idle.
    fn stop(&self);
}

/// An established voice connection to one channel.
pub trait VoiceConnection: Send + Sync {
    /// The bot's own participant identity; never subscribed.
    fn self_id(&self) -> ParticipantId;

    fn player(&self) -> Arc<dyn AudioPlayer>;

    /// Register a listener for call events. Dropping the receiver
    /// unregisters it.
    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<CallEvent>;

    /// Subscribe to a participant's raw opus packets (48kHz stereo). The
    /// stream closes when `end` is reached.
    fn subscribe_audio(&self, participant: &ParticipantId, end: EndBehavior)
        -> mpsc::Receiver<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_display_is_raw_id() {
        let id = ParticipantId::new("user-42");
        assert_eq!(id.to_string(), "user-42");
        assert_eq!(id.as_str(), "user-42");
    }
}
