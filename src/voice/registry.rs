//! Session registry: the explicit channel → session map owned by the
//! command dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::call::VoiceConnection;
use super::session::{Session, SessionConfig, SessionDeps, SessionKey};
use crate::error::SessionError;

/// Snapshot reported to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Whether the channel's session has an open agent link.
    pub link_open: bool,
    /// Active sessions across all channels.
    pub session_count: usize,
}

enum Slot {
    /// Reserved while the handshake runs.
    Starting,
    Active(Arc<Session>),
}

/// At most one session per channel. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Frees a reserved slot if the start future is dropped mid-handshake.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    channel_id: String,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.registry.slots.lock();
            if matches!(slots.get(&self.channel_id), Some(Slot::Starting)) {
                slots.remove(&self.channel_id);
            }
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for `key.channel_id`. A channel that already has a
    /// session (or one starting) is rejected without touching it.
    pub async fn start(
        &self,
        key: SessionKey,
        connection: Arc<dyn VoiceConnection>,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Result<Arc<Session>, SessionError> {
        let channel_id = key.channel_id.clone();
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&channel_id) {
                tracing::warn!(channel_id = %channel_id, "Session already active, rejecting start");
                return Err(SessionError::AlreadyActive { channel_id });
            }
            slots.insert(channel_id.clone(), Slot::Starting);
        }
        let mut reservation = Reservation {
            registry: self,
            channel_id: channel_id.clone(),
            armed: true,
        };

        let session = match Session::start(key, connection, config, deps, self.clone()).await {
            Ok(session) => Arc::new(session),
            Err(source) => {
                tracing::error!(channel_id = %channel_id, error = %source, "Session start failed");
                return Err(SessionError::Start { channel_id, source });
            }
        };

        reservation.armed = false;
        let mut slots = self.slots.lock();
        if session.is_link_open() {
            slots.insert(channel_id, Slot::Active(Arc::clone(&session)));
        } else {
            // link dropped before registration; the session already tore down
            slots.remove(&channel_id);
            tracing::warn!(channel_id = %channel_id, "Session lost its link while starting");
        }
        Ok(session)
    }

    /// Stop the channel's session. False if none was active.
    pub async fn stop(&self, channel_id: &str) -> bool {
        let session = {
            let mut slots = self.slots.lock();
            match slots.get(channel_id) {
                Some(Slot::Active(_)) => match slots.remove(channel_id) {
                    Some(Slot::Active(session)) => session,
                    _ => return false,
                },
                _ => return false,
            }
        };
        session.stop().await;
        true
    }

    /// Stop every session belonging to a call. Returns how many stopped.
    pub async fn stop_call(&self, call_id: &str) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut slots = self.slots.lock();
            let channels: Vec<String> = slots
                .iter()
                .filter_map(|(channel, slot)| match slot {
                    Slot::Active(session) if session.key().call_id == call_id => {
                        Some(channel.clone())
                    }
                    _ => None,
                })
                .collect();
            channels
                .iter()
                .filter_map(|channel| match slots.remove(channel) {
                    Some(Slot::Active(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };
        for session in &sessions {
            session.stop().await;
        }
        sessions.len()
    }

    pub fn status(&self, channel_id: &str) -> SessionStatus {
        let slots = self.slots.lock();
        let link_open = matches!(
            slots.get(channel_id),
            Some(Slot::Active(session)) if session.is_link_open()
        );
        SessionStatus {
            link_open,
            session_count: Self::active_count(&slots),
        }
    }

    fn active_count(slots: &HashMap<String, Slot>) -> usize {
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<Session>> {
        match self.slots.lock().get(channel_id) {
            Some(Slot::Active(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// True if the channel has a session, active or starting.
    pub fn contains(&self, channel_id: &str) -> bool {
        self.slots.lock().contains_key(channel_id)
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        Self::active_count(&self.slots.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a session that ended on its own. Only removes the entry if it
    /// still belongs to `session_id`.
    pub(crate) fn release(&self, channel_id: &str, session_id: &str) -> bool {
        let mut slots = self.slots.lock();
        let owned = matches!(
            slots.get(channel_id),
            Some(Slot::Active(session)) if session.id() == session_id
        );
        if owned {
            slots.remove(channel_id);
            tracing::info!(channel_id, session_id, "Session released from registry");
        }
        owned
    }
}
