//! Voice relay: carries live group-call audio to a conversational agent and
//! plays the agent's replies back into the call.
//!
//! The call platform is abstracted behind [`voice::VoiceConnection`]; the
//! embedding bot owns a [`voice::SessionRegistry`] and starts or stops one
//! [`voice::Session`] per channel.

pub mod audio;
pub mod config;
pub mod error;
pub mod voice;

pub use config::RelayConfig;
pub use error::{LinkError, PlayerError, SessionError, TranscodeError};
