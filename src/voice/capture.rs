//! Capture Pipeline: one participant's speaking turn, from opus packets to a
//! single utterance for the agent.
//!
//! decode (call-native PCM) → accumulate until silence → transcode
//! call→remote once → emit once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::call::ParticipantId;
use crate::audio::{AudioFormat, StreamStage, Transcoder};

/// Receives finished utterances in remote-native PCM.
#[async_trait]
pub trait UtteranceSink: Send + Sync {
    async fn send_utterance(&self, pcm: Vec<u8>);
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// One utterance of `bytes` remote-native bytes was emitted.
    Sent { bytes: usize },
    /// The turn produced no audio.
    Empty,
    /// Transcoding failed; the utterance was dropped.
    Failed(String),
}

pub struct CapturePipeline {
    participant: ParticipantId,
    decoder: Box<dyn StreamStage>,
    transcoder: Arc<dyn Transcoder>,
    silence: Duration,
}

impl CapturePipeline {
    pub fn new(
        participant: ParticipantId,
        decoder: Box<dyn StreamStage>,
        transcoder: Arc<dyn Transcoder>,
        silence: Duration,
    ) -> Self {
        Self {
            participant,
            decoder,
            transcoder,
            silence,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Consume packets until `silence` passes without one (or the stream
    /// closes), then emit the turn through `sink`.
    pub async fn run(
        mut self,
        packets: mpsc::Receiver<Vec<u8>>,
        sink: Arc<dyn UtteranceSink>,
    ) -> CaptureOutcome {
        let turn = self.collect(packets).await;
        self.emit(turn, sink).await
    }

    /// Decode packets until the turn ends. The packet stream is finished
    /// once this returns; only the transcode and send remain.
    pub async fn collect(&mut self, mut packets: mpsc::Receiver<Vec<u8>>) -> CapturedTurn {
        let mut turn = CapturedTurn::default();

        loop {
            match tokio::time::timeout(self.silence, packets.recv()).await {
                Ok(Some(packet)) => {
                    turn.packets += 1;
                    match self.decoder.process(&packet) {
                        Ok(chunk) => turn.pcm.extend_from_slice(&chunk),
                        Err(e) => {
                            turn.dropped += 1;
                            tracing::warn!(
                                participant = %self.participant,
                                error = %e,
                                "Dropping undecodable packet"
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(_elapsed) => break,
            }
        }

        match self.decoder.finish() {
            Ok(tail) => turn.pcm.extend_from_slice(&tail),
            Err(e) => tracing::warn!(participant = %self.participant, error = %e, "Decoder flush failed"),
        }
        turn
    }

    /// Transcode a collected turn call→remote and send it as one utterance.
    pub async fn emit(self, turn: CapturedTurn, sink: Arc<dyn UtteranceSink>) -> CaptureOutcome {
        let CapturedTurn {
            pcm,
            packets,
            dropped,
        } = turn;

        if pcm.is_empty() {
            tracing::debug!(
                participant = %self.participant,
                packets,
                dropped,
                "Turn ended without audio"
            );
            return CaptureOutcome::Empty;
        }

        let call_bytes = pcm.len();
        let utterance = match self
            .transcoder
            .transcode(pcm, AudioFormat::CALL, AudioFormat::REMOTE)
            .await
        {
            Ok(out) if out.is_empty() => return CaptureOutcome::Empty,
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(
                    participant = %self.participant,
                    transcoder = self.transcoder.name(),
                    error = %e,
                    "Utterance transcode failed, dropping turn"
                );
                return CaptureOutcome::Failed(e.to_string());
            }
        };

        let bytes = utterance.len();
        tracing::info!(
            participant = %self.participant,
            packets,
            dropped,
            duration_ms = AudioFormat::CALL.millis_for_bytes(call_bytes),
            bytes,
            "Utterance captured"
        );
        sink.send_utterance(utterance).await;
        CaptureOutcome::Sent { bytes }
    }
}

/// Decoded call-native audio of one turn, not yet transcoded.
#[derive(Debug, Default)]
pub struct CapturedTurn {
    pub pcm: Vec<u8>,
    pub packets: usize,
    pub dropped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NativeTranscoder;
    use crate::error::TranscodeError;
    use parking_lot::Mutex;

    /// Treats every packet as already-decoded PCM; `[0xFF]` fails.
    struct Passthrough;

    impl StreamStage for Passthrough {
        fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, TranscodeError> {
            if input == [0xFF] {
                return Err(TranscodeError::Decode("corrupt".into()));
            }
            Ok(input.to_vec())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl UtteranceSink for Recorder {
        async fn send_utterance(&self, pcm: Vec<u8>) {
            self.0.lock().push(pcm);
        }
    }

    struct Broken;

    #[async_trait]
    impl Transcoder for Broken {
        async fn transcode(
            &self,
            _input: Vec<u8>,
            _from: AudioFormat,
            _to: AudioFormat,
        ) -> Result<Vec<u8>, TranscodeError> {
            Err(TranscodeError::ProcessFailed {
                status: "exit status: 1".into(),
                stderr: "boom".into(),
            })
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn pipeline(transcoder: Arc<dyn Transcoder>) -> CapturePipeline {
        CapturePipeline::new(
            ParticipantId::new("alice"),
            Box::new(Passthrough),
            transcoder,
            Duration::from_millis(500),
        )
    }

    fn call_chunk(value: i16) -> Vec<u8> {
        // 10ms of call-native audio
        std::iter::repeat_n(value.to_le_bytes(), 480 * 2).flatten().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_turn_emits_nothing() {
        let (_tx, rx) = mpsc::channel(8);
        let sink = Arc::new(Recorder::default());
        let outcome = pipeline(Arc::new(NativeTranscoder)).run(rx, sink.clone()).await;
        assert_eq!(outcome, CaptureOutcome::Empty);
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn turn_is_emitted_once_as_transcoded_concatenation() {
        let (tx, rx) = mpsc::channel(8);
        let chunks = [call_chunk(100), call_chunk(-200), call_chunk(300)];
        for chunk in &chunks {
            tx.send(chunk.clone()).await.unwrap();
        }
        let sink = Arc::new(Recorder::default());

        // tx stays alive: only the silence timeout ends the turn
        let outcome = pipeline(Arc::new(NativeTranscoder)).run(rx, sink.clone()).await;

        let expected = NativeTranscoder
            .transcode(chunks.concat(), AudioFormat::CALL, AudioFormat::REMOTE)
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::Sent { bytes: expected.len() });
        assert_eq!(*sink.0.lock(), vec![expected]);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn packets_spaced_under_silence_stay_in_one_turn() {
        let (tx, rx) = mpsc::channel(8);
        let sink = Arc::new(Recorder::default());
        let run = tokio::spawn(pipeline(Arc::new(NativeTranscoder)).run(rx, sink.clone()));

        for _ in 0..3 {
            tx.send(call_chunk(7)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        drop(tx);

        let outcome = run.await.unwrap();
        assert_eq!(
            outcome,
            CaptureOutcome::Sent {
                bytes: AudioFormat::REMOTE.bytes_for_millis(30)
            }
        );
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_packets_are_skipped() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(vec![0xFF]).await.unwrap();
        tx.send(call_chunk(1)).await.unwrap();
        drop(tx);

        let sink = Arc::new(Recorder::default());
        let outcome = pipeline(Arc::new(NativeTranscoder)).run(rx, sink.clone()).await;
        assert_eq!(
            outcome,
            CaptureOutcome::Sent {
                bytes: AudioFormat::REMOTE.bytes_for_millis(10)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transcode_failure_drops_the_turn() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(call_chunk(1)).await.unwrap();
        drop(tx);

        let sink = Arc::new(Recorder::default());
        let outcome = pipeline(Arc::new(Broken)).run(rx, sink.clone()).await;
        assert!(matches!(outcome, CaptureOutcome::Failed(_)));
        assert!(sink.0.lock().is_empty());
    }
}
