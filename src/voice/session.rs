//! Session: one call's relay between the voice connection and the agent.
//!
//! A session owns one [`RemoteLink`], one [`PlaybackQueue`] bound to the
//! call's player, and one [`CapturePipeline`] per participant currently
//! speaking. All of its state is driven from a single event-loop task that
//! multiplexes link events, call events, and completions of its own
//! background work (transcodes, finished turns). Interruption handling,
//! player-idle handling and enqueueing therefore never interleave.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::call::{
    AudioPlayer, CallEvent, EndBehavior, ParticipantId, PlayableResource, VoiceConnection,
};
use super::capture::{CapturePipeline, CaptureOutcome, UtteranceSink};
use super::link::{LinkEvent, LinkSettings, LinkStats, RemoteLink};
use super::playback::{PlayCycle, PlaybackQueue};
use super::registry::SessionRegistry;
use crate::audio::{AudioFormat, AudioFrame, DecoderFactory, Transcoder};
use crate::error::{LinkError, TranscodeError};

// ── Identity & configuration ───────────────────────────────────────

/// Identity of a session: the call and the channel it runs in. At most one
/// session exists per channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub call_id: String,
    pub channel_id: String,
}

impl SessionKey {
    pub fn new(call_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.call_id, self.channel_id)
    }
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub link: LinkSettings,
    /// Trailing silence that ends a speaking turn.
    pub silence: Duration,
}

/// Receives the agent's informational output.
pub trait ConversationObserver: Send + Sync {
    fn conversation_started(&self, _session: &SessionKey, _conversation_id: &str) {}
    fn agent_response(&self, _session: &SessionKey, _text: &str) {}
    fn user_transcript(&self, _session: &SessionKey, _text: &str) {}
}

/// Default observer: writes everything to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl ConversationObserver for LoggingObserver {
    fn conversation_started(&self, session: &SessionKey, conversation_id: &str) {
        tracing::info!(session = %session, conversation_id, "Agent conversation started");
    }

    fn agent_response(&self, session: &SessionKey, text: &str) {
        tracing::info!(session = %session, text, "Agent response");
    }

    fn user_transcript(&self, session: &SessionKey, text: &str) {
        tracing::info!(session = %session, text, "User transcript");
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub transcoder: Arc<dyn Transcoder>,
    pub decoder_factory: DecoderFactory,
    pub observer: Arc<dyn ConversationObserver>,
    pub http: reqwest::Client,
}

// ── Session handle ─────────────────────────────────────────────────

/// Handle to a running session. Created through [`SessionRegistry::start`].
pub struct Session {
    id: String,
    key: SessionKey,
    link: Arc<RemoteLink>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect to the agent and start the event loop. Nothing is left
    /// running if the handshake fails.
    pub(crate) async fn start(
        key: SessionKey,
        connection: Arc<dyn VoiceConnection>,
        config: SessionConfig,
        deps: SessionDeps,
        registry: SessionRegistry,
    ) -> Result<Self, LinkError> {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session_id = %id, session = %key, "Starting relay session");

        let link = Arc::new(RemoteLink::new(config.link.clone(), deps.http.clone()));
        let link_events = link.connect().await?;
        let call_events = connection.subscribe_events();

        let cancel = CancellationToken::new();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let event_loop = SessionLoop {
            id: id.clone(),
            key: key.clone(),
            self_id: connection.self_id(),
            player: connection.player(),
            connection,
            link: Arc::clone(&link),
            queue: PlaybackQueue::new(),
            preparing: None,
            listening: HashSet::new(),
            captures: Vec::new(),
            config,
            deps,
            internal_tx,
            registry,
        };

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            event_loop
                .run(loop_cancel, link_events, call_events, internal_rx)
                .await;
        });

        Ok(Self {
            id,
            key,
            link,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_link_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.link.conversation_id()
    }

    /// Wait for the agent to announce the conversation id.
    pub async fn wait_for_conversation(&self, timeout: Duration) -> Option<String> {
        self.link.conversation_started(timeout).await
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// Tear the session down and wait for its event loop to exit.
    /// Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(session_id = %self.id, error = %e, "Session task ended abnormally");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("link_state", &self.link.state())
            .finish()
    }
}

// ── Event loop ─────────────────────────────────────────────────────

/// Completions reported back to the loop by its own background tasks.
#[derive(Debug)]
enum Internal {
    Transcoded {
        cycle: u64,
        result: Result<Vec<u8>, TranscodeError>,
    },
    /// A participant's packet stream ended; transcoding may still be running.
    TurnEnded(ParticipantId),
}

#[derive(Debug)]
enum Exit {
    Stopped,
    LinkLost(String),
    CallEnded,
}

struct SessionLoop {
    id: String,
    key: SessionKey,
    self_id: ParticipantId,
    connection: Arc<dyn VoiceConnection>,
    player: Arc<dyn AudioPlayer>,
    link: Arc<RemoteLink>,
    queue: PlaybackQueue,
    preparing: Option<JoinHandle<()>>,
    listening: HashSet<ParticipantId>,
    captures: Vec<JoinHandle<()>>,
    config: SessionConfig,
    deps: SessionDeps,
    internal_tx: mpsc::UnboundedSender<Internal>,
    registry: SessionRegistry,
}

impl SessionLoop {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut link_events: mpsc::Receiver<LinkEvent>,
        mut call_events: mpsc::UnboundedReceiver<CallEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Exit::Stopped,
                event = link_events.recv() => match event {
                    Some(LinkEvent::Closed { reason }) => break Exit::LinkLost(reason),
                    Some(event) => self.on_link_event(event),
                    None => break Exit::LinkLost("event stream ended".into()),
                },
                event = call_events.recv() => match event {
                    Some(event) => self.on_call_event(event),
                    None => break Exit::CallEnded,
                },
                Some(internal) = internal_rx.recv() => self.on_internal(internal),
            }
        };
        self.teardown(exit).await;
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Audio(pcm) => {
                if let Some(cycle) = self.queue.enqueue(pcm) {
                    self.prepare(cycle);
                }
            }
            LinkEvent::Interruption => {
                self.player.stop();
                let dropped = self.queue.flush();
                if let Some(task) = self.preparing.take() {
                    task.abort();
                }
                tracing::info!(
                    session_id = %self.id,
                    dropped_buffers = dropped,
                    "Agent interrupted, playback flushed"
                );
            }
            LinkEvent::ConversationStarted(conversation_id) => {
                self.deps
                    .observer
                    .conversation_started(&self.key, &conversation_id);
            }
            LinkEvent::AgentResponse(text) => self.deps.observer.agent_response(&self.key, &text),
            LinkEvent::UserTranscript(text) => {
                self.deps.observer.user_transcript(&self.key, &text)
            }
            LinkEvent::Closed { .. } => {}
        }
    }

    fn on_call_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::SpeakingStarted(participant) => self.start_capture(participant),
            CallEvent::PlayerIdle { resource_id } => {
                if let Some(next) = self.queue.on_idle(resource_id) {
                    self.prepare(next);
                }
            }
            CallEvent::PlayerError {
                resource_id,
                message,
            } => {
                tracing::warn!(
                    session_id = %self.id,
                    cycle = resource_id,
                    error = %message,
                    "Player failed, abandoning play cycle"
                );
                if let Some(next) = self.queue.on_player_error(resource_id) {
                    self.prepare(next);
                }
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Transcoded { cycle, result } => self.on_transcoded(cycle, result),
            Internal::TurnEnded(participant) => {
                self.listening.remove(&participant);
            }
        }
    }

    // ── Playback ──────────────────────────────────────────────────

    /// Transcode a play cycle off the loop; the result comes back as
    /// [`Internal::Transcoded`].
    fn prepare(&mut self, cycle: PlayCycle) {
        let transcoder = Arc::clone(&self.deps.transcoder);
        let done = self.internal_tx.clone();
        tracing::debug!(
            session_id = %self.id,
            cycle = cycle.id,
            bytes = cycle.pcm.len(),
            "Preparing play cycle"
        );
        self.preparing = Some(tokio::spawn(async move {
            let result = transcoder
                .transcode(cycle.pcm, AudioFormat::REMOTE, AudioFormat::CALL)
                .await;
            let _ = done.send(Internal::Transcoded {
                cycle: cycle.id,
                result,
            });
        }));
    }

    fn on_transcoded(&mut self, cycle: u64, result: Result<Vec<u8>, TranscodeError>) {
        if self.queue.current_cycle() == Some(cycle) {
            self.preparing = None;
        }
        let pcm = match result {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.id,
                    cycle,
                    transcoder = self.deps.transcoder.name(),
                    error = %e,
                    "Playback transcode failed, dropping cycle"
                );
                if let Some(next) = self.queue.on_prepare_failed(cycle) {
                    self.prepare(next);
                }
                return;
            }
        };

        if !self.queue.on_prepared(cycle) {
            tracing::debug!(session_id = %self.id, cycle, "Discarding stale play cycle");
            return;
        }

        let resource = PlayableResource {
            id: cycle,
            frame: AudioFrame::new(AudioFormat::CALL, pcm),
        };
        tracing::debug!(
            session_id = %self.id,
            cycle,
            duration_ms = resource.frame.duration_ms(),
            "Playing cycle"
        );
        if let Err(e) = self.player.play(resource) {
            tracing::warn!(session_id = %self.id, cycle, error = %e, "Player rejected resource");
            if let Some(next) = self.queue.on_player_error(cycle) {
                self.prepare(next);
            }
        }
    }

    // ── Capture ───────────────────────────────────────────────────

    fn start_capture(&mut self, participant: ParticipantId) {
        if participant == self.self_id || self.listening.contains(&participant) {
            return;
        }

        let decoder = match (self.deps.decoder_factory)() {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.id,
                    participant = %participant,
                    error = %e,
                    "Cannot create decoder, skipping turn"
                );
                return;
            }
        };

        let packets = self
            .connection
            .subscribe_audio(&participant, EndBehavior::AfterSilence(self.config.silence));
        let mut pipeline = CapturePipeline::new(
            participant.clone(),
            decoder,
            Arc::clone(&self.deps.transcoder),
            self.config.silence,
        );
        let sink: Arc<dyn UtteranceSink> = self.link.clone();
        let done = self.internal_tx.clone();
        let who = participant.clone();
        let session_id = self.id.clone();

        tracing::debug!(session_id = %self.id, participant = %participant, "Capture started");
        let task = tokio::spawn(async move {
            let turn = pipeline.collect(packets).await;
            let _ = done.send(Internal::TurnEnded(who.clone()));
            if let CaptureOutcome::Sent { bytes } = pipeline.emit(turn, sink).await {
                tracing::debug!(session_id = %session_id, participant = %who, bytes, "Turn forwarded");
            }
        });
        self.captures.retain(|task| !task.is_finished());
        self.captures.push(task);
        self.listening.insert(participant);
    }

    // ── Teardown ──────────────────────────────────────────────────

    async fn teardown(mut self, exit: Exit) {
        self.link.disconnect().await;
        self.player.stop();
        self.queue.flush();
        if let Some(task) = self.preparing.take() {
            task.abort();
        }
        self.listening.clear();
        for task in self.captures.drain(..) {
            task.abort();
        }

        match exit {
            Exit::Stopped => {
                tracing::info!(session_id = %self.id, session = %self.key, "Session stopped");
            }
            Exit::LinkLost(reason) => {
                tracing::error!(
                    session_id = %self.id,
                    session = %self.key,
                    reason = %reason,
                    "Agent link lost, session ended"
                );
                self.registry.release(&self.key.channel_id, &self.id);
            }
            Exit::CallEnded => {
                tracing::warn!(
                    session_id = %self.id,
                    session = %self.key,
                    "Call event stream closed, session ended"
                );
                self.registry.release(&self.key.channel_id, &self.id);
            }
        }
    }
}
