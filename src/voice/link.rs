//! Remote Link: the persistent duplex channel to the conversational agent.
//!
//! ## Protocol Overview
//!
//! 1. **Handshake**: `GET {api_base}/conversation/get_signed_url?agent_id=…`
//!    with the `xi-api-key` header; the response carries `signed_url`
//! 2. **Connect**: open a websocket to the signed URL
//! 3. **Stream**: send `user_audio_chunk` frames, receive audio and
//!    control frames, answer every `ping` with a `pong`
//! 4. **Close**: explicit disconnect or transport loss; a closed link is
//!    never reopened
//!
//! State: `Connecting → Open → Closed`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::capture::UtteranceSink;
use super::protocol::{self, Inbound};
use crate::error::LinkError;

// ── Constants ──────────────────────────────────────────────────────

/// Path of the credential exchange, relative to the API base URL.
pub const SIGNED_URL_PATH: &str = "/conversation/get_signed_url";

/// Header carrying the long-lived credential.
pub const API_KEY_HEADER: &str = "xi-api-key";

/// Log every Nth audio chunk at info level.
const AUDIO_LOG_EVERY: u64 = 50;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<AsyncMutex<SplitSink<WsStream, WsMessage>>>;

// ── Public types ───────────────────────────────────────────────────

/// What a link needs to reach the agent.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub api_base_url: String,
    pub api_key: String,
    pub agent_id: String,
    /// Capacity of the event and outbound channels.
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

/// Events forwarded from the receive loop to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConversationStarted(String),
    /// Remote-native PCM, already base64-decoded.
    Audio(Vec<u8>),
    AgentResponse(String),
    UserTranscript(String),
    Interruption,
    /// The transport dropped while the link was open.
    Closed { reason: String },
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub audio_sent: u64,
    pub audio_received: u64,
    pub pongs_sent: u64,
    pub malformed: u64,
}

#[derive(Debug)]
struct Shared {
    state: LinkState,
    stats: LinkStats,
}

impl Shared {
    /// Move to Closed; true if the link was Open until now.
    fn close(&mut self) -> bool {
        let was_open = self.state == LinkState::Open;
        self.state = LinkState::Closed;
        was_open
    }
}

#[derive(Debug)]
enum Outbound {
    Audio(Vec<u8>),
    Close,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

// ── Link ───────────────────────────────────────────────────────────

/// A single connection attempt to the agent. Construct a new link to
/// reconnect.
pub struct RemoteLink {
    link_id: String,
    settings: LinkSettings,
    http: reqwest::Client,
    shared: Arc<Mutex<Shared>>,
    outbound_tx: Mutex<Option<mpsc::Sender<Outbound>>>,
    conversation: Arc<watch::Sender<Option<String>>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteLink {
    pub fn new(settings: LinkSettings, http: reqwest::Client) -> Self {
        let (conversation, _) = watch::channel(None);
        Self {
            link_id: uuid::Uuid::new_v4().to_string(),
            settings,
            http,
            shared: Arc::new(Mutex::new(Shared {
                state: LinkState::Connecting,
                stats: LinkStats::default(),
            })),
            outbound_tx: Mutex::new(None),
            conversation: Arc::new(conversation),
            inbound_task: Mutex::new(None),
        }
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.lock().stats
    }

    /// Conversation id, once the agent has announced it.
    pub fn conversation_id(&self) -> Option<String> {
        self.conversation.borrow().clone()
    }

    /// Wait up to `timeout` for the conversation metadata frame.
    pub async fn conversation_started(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.conversation.subscribe();
        let id = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(id)) => id.clone(),
            _ => None,
        };
        id
    }

    /// Perform the handshake and open the duplex connection. On success the
    /// link is Open and the returned receiver yields its events.
    pub async fn connect(&self) -> Result<mpsc::Receiver<LinkEvent>, LinkError> {
        if self.state() != LinkState::Connecting {
            return Err(LinkError::AlreadyConnected);
        }

        tracing::info!(
            link_id = %self.link_id,
            agent_id = %self.settings.agent_id,
            "Requesting signed conversation URL"
        );
        let signed_url = match fetch_signed_url(&self.http, &self.settings).await {
            Ok(url) => url,
            Err(e) => {
                self.shared.lock().close();
                tracing::error!(link_id = %self.link_id, error = %e, "Handshake failed");
                return Err(e);
            }
        };

        let (ws_stream, _response) = match tokio_tungstenite::connect_async(signed_url.as_str())
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.lock().close();
                tracing::error!(link_id = %self.link_id, error = %e, "Websocket connect failed");
                return Err(LinkError::Transport(format!(
                    "failed to open conversation socket: {e}"
                )));
            }
        };

        let (ws_sender, ws_receiver) = ws_stream.split();
        let ws_sender: WsSink = Arc::new(AsyncMutex::new(ws_sender));

        let capacity = self.settings.event_buffer.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(capacity);

        {
            let mut shared = self.shared.lock();
            if shared.state != LinkState::Connecting {
                // disconnect() raced the handshake
                return Err(LinkError::AlreadyConnected);
            }
            shared.state = LinkState::Open;
        }
        *self.outbound_tx.lock() = Some(outbound_tx);

        tracing::info!(link_id = %self.link_id, "Connected to conversational agent");

        let sink_out = Arc::clone(&ws_sender);
        let shared_out = Arc::clone(&self.shared);
        let lid_out = self.link_id.clone();
        tokio::spawn(async move {
            Self::outbound_loop(outbound_rx, sink_out, shared_out, lid_out).await;
        });

        let shared_in = Arc::clone(&self.shared);
        let conversation = Arc::clone(&self.conversation);
        let lid_in = self.link_id.clone();
        let inbound = tokio::spawn(async move {
            Self::inbound_loop(ws_receiver, ws_sender, event_tx, shared_in, conversation, lid_in)
                .await;
        });
        *self.inbound_task.lock() = Some(inbound);

        Ok(event_rx)
    }

    /// Queue remote-native PCM for the agent. Dropped unless the link is
    /// Open.
    pub async fn send_audio(&self, pcm: Vec<u8>) {
        if pcm.is_empty() {
            return;
        }
        if !self.is_open() {
            tracing::debug!(
                link_id = %self.link_id,
                bytes = pcm.len(),
                "Link not open, dropping outbound audio"
            );
            return;
        }
        let tx = self.outbound_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.send(Outbound::Audio(pcm)).await.is_err() {
                tracing::debug!(link_id = %self.link_id, "Outbound loop gone, audio dropped");
            }
        }
    }

    /// Close the transport. Idempotent.
    pub async fn disconnect(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.state == LinkState::Closed {
                return;
            }
            shared.close();
        }

        let tx = self.outbound_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(Outbound::Close).await;
        }
        if let Some(task) = self.inbound_task.lock().take() {
            task.abort();
        }
        tracing::info!(link_id = %self.link_id, "Link disconnected");
    }

    // ── Internal loops ────────────────────────────────────────────

    /// Outbound loop: encode audio and write it to the socket.
    async fn outbound_loop(
        mut rx: mpsc::Receiver<Outbound>,
        sink: WsSink,
        shared: Arc<Mutex<Shared>>,
        link_id: String,
    ) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Outbound::Audio(pcm) => {
                    let count = {
                        let mut shared = shared.lock();
                        shared.stats.audio_sent += 1;
                        shared.stats.audio_sent
                    };
                    if count == 1 || count.is_multiple_of(AUDIO_LOG_EVERY) {
                        tracing::info!(
                            link_id = %link_id,
                            chunk = count,
                            pcm_bytes = pcm.len(),
                            "Sending audio to agent"
                        );
                    }
                    let json = protocol::build_audio_message(&pcm).to_string();
                    let mut sender = sink.lock().await;
                    if sender.send(WsMessage::Text(json.into())).await.is_err() {
                        tracing::warn!(
                            link_id = %link_id,
                            "Websocket send failed, closing outbound loop"
                        );
                        break;
                    }
                }
                Outbound::Close => {
                    let mut sender = sink.lock().await;
                    let _ = sender.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
        tracing::debug!(link_id = %link_id, "Outbound loop terminated");
    }

    /// Inbound loop: decode frames, answer pings, forward everything else.
    async fn inbound_loop(
        mut ws_receiver: SplitStream<WsStream>,
        sink: WsSink,
        events: mpsc::Sender<LinkEvent>,
        shared: Arc<Mutex<Shared>>,
        conversation: Arc<watch::Sender<Option<String>>>,
        link_id: String,
    ) {
        let reason = loop {
            let Some(frame) = ws_receiver.next().await else {
                break "stream ended".to_string();
            };
            let text = match frame {
                Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => text.to_owned(),
                    Err(_) => {
                        shared.lock().stats.malformed += 1;
                        tracing::warn!(link_id = %link_id, "Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    break format!("closed by agent: {frame:?}");
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(e) => break format!("websocket error: {e}"),
            };

            let event = match protocol::decode_inbound(&text) {
                Ok(inbound) => {
                    Self::handle_inbound(inbound, &sink, &shared, &conversation, &link_id).await
                }
                Err(e) => {
                    shared.lock().stats.malformed += 1;
                    tracing::warn!(link_id = %link_id, error = %e, "Dropping malformed frame");
                    None
                }
            };
            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    tracing::debug!(link_id = %link_id, "Event receiver dropped");
                    break "session gone".to_string();
                }
            }
        };

        if shared.lock().close() {
            tracing::error!(link_id = %link_id, reason = %reason, "Link lost");
            let _ = events.send(LinkEvent::Closed { reason }).await;
        }
        tracing::debug!(link_id = %link_id, "Inbound loop terminated");
    }

    /// Dispatch one decoded frame. Pings are answered here, before the next
    /// frame is read; everything else becomes a [`LinkEvent`].
    async fn handle_inbound(
        inbound: Inbound,
        sink: &WsSink,
        shared: &Mutex<Shared>,
        conversation: &watch::Sender<Option<String>>,
        link_id: &str,
    ) -> Option<LinkEvent> {
        match inbound {
            Inbound::Ping { event_id } => {
                let pong = protocol::build_pong_message(&event_id).to_string();
                let mut sender = sink.lock().await;
                match sender.send(WsMessage::Text(pong.into())).await {
                    Ok(()) => shared.lock().stats.pongs_sent += 1,
                    Err(e) => tracing::warn!(link_id = %link_id, error = %e, "Failed to send pong"),
                }
                None
            }
            Inbound::ConversationStarted {
                conversation_id,
                output_format,
            } => {
                tracing::info!(
                    link_id = %link_id,
                    conversation_id = %conversation_id,
                    output_format = output_format.as_deref().unwrap_or("unspecified"),
                    "Conversation started"
                );
                conversation.send_replace(Some(conversation_id.clone()));
                Some(LinkEvent::ConversationStarted(conversation_id))
            }
            Inbound::Audio(pcm) => {
                let count = {
                    let mut shared = shared.lock();
                    shared.stats.audio_received += 1;
                    shared.stats.audio_received
                };
                if count == 1 || count.is_multiple_of(AUDIO_LOG_EVERY) {
                    tracing::info!(
                        link_id = %link_id,
                        audio_n = count,
                        bytes = pcm.len(),
                        "Agent audio received"
                    );
                }
                Some(LinkEvent::Audio(pcm))
            }
            Inbound::AgentResponse(text) => Some(LinkEvent::AgentResponse(text)),
            Inbound::UserTranscript(text) => Some(LinkEvent::UserTranscript(text)),
            Inbound::Interruption => Some(LinkEvent::Interruption),
            Inbound::Ignored { kind } => {
                tracing::debug!(link_id = %link_id, kind = %kind, "Ignoring agent frame");
                None
            }
        }
    }
}

#[async_trait]
impl UtteranceSink for RemoteLink {
    async fn send_utterance(&self, pcm: Vec<u8>) {
        self.send_audio(pcm).await;
    }
}

// ── Handshake ──────────────────────────────────────────────────────

/// Exchange the long-lived credential for a short-lived websocket URL.
pub async fn fetch_signed_url(
    http: &reqwest::Client,
    settings: &LinkSettings,
) -> Result<String, LinkError> {
    let url = format!(
        "{}{SIGNED_URL_PATH}",
        settings.api_base_url.trim_end_matches('/')
    );
    let resp = http
        .get(&url)
        .query(&[("agent_id", settings.agent_id.as_str())])
        .header(API_KEY_HEADER, settings.api_key.as_str())
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(LinkError::Handshake { status, body });
    }

    let body: SignedUrlResponse = resp.json().await?;
    if !(body.signed_url.starts_with("wss://") || body.signed_url.starts_with("ws://")) {
        return Err(LinkError::InvalidSignedUrl(body.signed_url));
    }
    Ok(body.signed_url)
}
