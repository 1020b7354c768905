//! Bidirectional voice relay between a group call and a conversational
//! agent.
//!
//! ## Design
//! - [`link`] holds the duplex websocket to the agent (handshake, ping/pong,
//!   audio in both directions)
//! - [`playback`] orders agent audio into play cycles for the call player
//! - [`capture`] turns one participant's speaking turn into one utterance
//! - [`session`] wires the three together on a single event loop
//! - [`registry`] enforces one session per channel
//! - [`call`] describes what the relay consumes from the call platform

pub mod call;
pub mod capture;
pub mod link;
pub mod playback;
pub mod protocol;
pub mod registry;
pub mod session;

pub use call::{
    AudioPlayer, CallEvent, EndBehavior, ParticipantId, PlayableResource, VoiceConnection,
};
pub use capture::{CaptureOutcome, CapturePipeline, CapturedTurn, UtteranceSink};
pub use link::{LinkEvent, LinkSettings, LinkState, LinkStats, RemoteLink};
pub use playback::{PlayCycle, PlaybackQueue};
pub use registry::{SessionRegistry, SessionStatus};
pub use session::{
    ConversationObserver, LoggingObserver, Session, SessionConfig, SessionDeps, SessionKey,
};
