//! Wire protocol of the conversational endpoint.
//!
//! All frames are JSON text messages over one websocket.
//!
//! ```text
//! outbound: {"user_audio_chunk": "<base64 PCM16LE 16kHz mono>"}
//!           {"type": "pong", "event_id": <echoed id>}
//! inbound:  {"type": "conversation_initiation_metadata", ...}
//!           {"type": "audio", "audio": {"chunk": "<base64>"}}
//!           {"type": "agent_response" | "user_transcript" | "interruption" | "ping", ...}
//! ```

use base64::Engine;
use serde::Deserialize;

// ── Outbound ───────────────────────────────────────────────────────

/// Build an audio-input message from remote-native PCM.
pub fn build_audio_message(pcm: &[u8]) -> serde_json::Value {
    let b64 = base64::engine::general_purpose::STANDARD.encode(pcm);
    serde_json::json!({ "user_audio_chunk": b64 })
}

/// Build the keep-alive reply. The event id is echoed verbatim, whatever
/// its JSON type.
pub fn build_pong_message(event_id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "type": "pong", "event_id": event_id })
}

// ── Inbound ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: Option<MetadataEvent>,
    },
    Audio {
        audio: Option<AudioPayload>,
        audio_event: Option<AudioEventPayload>,
    },
    AgentResponse {
        agent_response_event: Option<AgentResponseEvent>,
    },
    UserTranscript {
        user_transcription_event: Option<UserTranscriptionEvent>,
    },
    Interruption {},
    Ping {
        ping_event: Option<PingEvent>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MetadataEvent {
    conversation_id: Option<String>,
    agent_output_audio_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AudioPayload {
    chunk: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AudioEventPayload {
    audio_base_64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentResponseEvent {
    agent_response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserTranscriptionEvent {
    user_transcript: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PingEvent {
    event_id: Option<serde_json::Value>,
}

/// A decoded inbound frame, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ConversationStarted {
        conversation_id: String,
        output_format: Option<String>,
    },
    /// Remote-native PCM.
    Audio(Vec<u8>),
    AgentResponse(String),
    UserTranscript(String),
    Interruption,
    Ping { event_id: serde_json::Value },
    /// Known kind without a usable payload, or an unrecognized kind.
    Ignored { kind: String },
}

/// An inbound frame that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed inbound message: {0}")]
pub struct MalformedMessage(pub String);

/// Decode one inbound text frame.
pub fn decode_inbound(text: &str) -> Result<Inbound, MalformedMessage> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| MalformedMessage(e.to_string()))?;

    let inbound = match message {
        ServerMessage::ConversationInitiationMetadata {
            conversation_initiation_metadata_event: Some(MetadataEvent {
                conversation_id: Some(conversation_id),
                agent_output_audio_format,
            }),
        } => Inbound::ConversationStarted {
            conversation_id,
            output_format: agent_output_audio_format,
        },
        ServerMessage::ConversationInitiationMetadata { .. } => {
            ignored("conversation_initiation_metadata")
        }

        ServerMessage::Audio { audio, audio_event } => {
            let chunk = audio
                .and_then(|a| a.chunk)
                .or_else(|| audio_event.and_then(|e| e.audio_base_64));
            match chunk {
                Some(b64) => {
                    let pcm = base64::engine::general_purpose::STANDARD
                        .decode(b64.as_bytes())
                        .map_err(|e| MalformedMessage(format!("audio chunk: {e}")))?;
                    Inbound::Audio(pcm)
                }
                None => ignored("audio"),
            }
        }

        ServerMessage::AgentResponse {
            agent_response_event: Some(AgentResponseEvent {
                agent_response: Some(text),
            }),
        } => Inbound::AgentResponse(text),
        ServerMessage::AgentResponse { .. } => ignored("agent_response"),

        ServerMessage::UserTranscript {
            user_transcription_event: Some(UserTranscriptionEvent {
                user_transcript: Some(text),
            }),
        } => Inbound::UserTranscript(text),
        ServerMessage::UserTranscript { .. } => ignored("user_transcript"),

        ServerMessage::Interruption {} => Inbound::Interruption,

        ServerMessage::Ping {
            ping_event: Some(PingEvent {
                event_id: Some(event_id),
            }),
        } => Inbound::Ping { event_id },
        ServerMessage::Ping { .. } => ignored("ping"),

        ServerMessage::Unknown => ignored("unknown"),
    };
    Ok(inbound)
}

fn ignored(kind: &str) -> Inbound {
    Inbound::Ignored {
        kind: kind.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_message_is_base64() {
        let msg = build_audio_message(&[1, 2, 3]);
        assert_eq!(msg["user_audio_chunk"], "AQID");
        assert!(msg.get("type").is_none());
    }

    #[test]
    fn pong_echoes_event_id() {
        assert_eq!(
            build_pong_message(&serde_json::json!("abc")).to_string(),
            r#"{"event_id":"abc","type":"pong"}"#
        );
        assert_eq!(build_pong_message(&serde_json::json!(7))["event_id"], 7);
    }

    #[test]
    fn parse_conversation_metadata() {
        let json = r#"{"type":"conversation_initiation_metadata","conversation_initiation_metadata_event":{"conversation_id":"conv_1","agent_output_audio_format":"pcm_16000"}}"#;
        assert_eq!(
            decode_inbound(json).unwrap(),
            Inbound::ConversationStarted {
                conversation_id: "conv_1".into(),
                output_format: Some("pcm_16000".into()),
            }
        );
    }

    #[test]
    fn parse_audio_chunk() {
        let json = r#"{"type":"audio","audio":{"chunk":"CgsM"}}"#;
        assert_eq!(decode_inbound(json).unwrap(), Inbound::Audio(vec![10, 11, 12]));
    }

    #[test]
    fn parse_audio_event_field() {
        let json = r#"{"type":"audio","audio_event":{"audio_base_64":"CgsM","event_id":4}}"#;
        assert_eq!(decode_inbound(json).unwrap(), Inbound::Audio(vec![10, 11, 12]));
    }

    #[test]
    fn audio_without_chunk_is_ignored() {
        let json = r#"{"type":"audio","audio":{}}"#;
        assert!(matches!(decode_inbound(json).unwrap(), Inbound::Ignored { .. }));
    }

    #[test]
    fn bad_base64_is_malformed() {
        let json = r#"{"type":"audio","audio":{"chunk":"%%%"}}"#;
        assert!(decode_inbound(json).is_err());
    }

    #[test]
    fn parse_text_events() {
        let response = r#"{"type":"agent_response","agent_response_event":{"agent_response":"hello"}}"#;
        assert_eq!(
            decode_inbound(response).unwrap(),
            Inbound::AgentResponse("hello".into())
        );
        let transcript = r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"hi there"}}"#;
        assert_eq!(
            decode_inbound(transcript).unwrap(),
            Inbound::UserTranscript("hi there".into())
        );
    }

    #[test]
    fn parse_interruption_with_payload() {
        let json = r#"{"type":"interruption","interruption_event":{"event_id":9}}"#;
        assert_eq!(decode_inbound(json).unwrap(), Inbound::Interruption);
    }

    #[test]
    fn parse_ping() {
        let json = r#"{"type":"ping","ping_event":{"event_id":"abc","ping_ms":40}}"#;
        assert_eq!(
            decode_inbound(json).unwrap(),
            Inbound::Ping {
                event_id: serde_json::json!("abc")
            }
        );
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let json = r#"{"type":"vad_score","vad_score_event":{"vad_score":0.2}}"#;
        assert_eq!(
            decode_inbound(json).unwrap(),
            Inbound::Ignored {
                kind: "unknown".into()
            }
        );
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(decode_inbound("not json").is_err());
        assert!(decode_inbound(r#"{"no_type":true}"#).is_err());
    }
}
