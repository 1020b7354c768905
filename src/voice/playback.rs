//! Playback Queue: orders inbound agent audio into play cycles.
//!
//! The queue is a plain state machine driven by the session event loop. It
//! never touches the player or the transcoder itself; each transition
//! returns what the caller must do next.
//!
//! ```text
//!            enqueue                 on_prepared            on_idle (pending empty)
//!   Idle ───────────────▶ Preparing ─────────────▶ Playing ───────────────────────▶ Idle
//!    ▲                        │                       │
//!    │   on_prepare_failed /  │                       │ on_idle (pending non-empty)
//!    └──── on_player_error ───┴───────────────────────┴──▶ Preparing (next cycle)
//!    ▲
//!    └──── flush (from any state)
//! ```
//!
//! Every cycle carries a monotonically increasing id. Completions for any
//! other id (a transcode finishing after an interruption, an idle event for
//! a stopped resource) are stale and ignored.

/// One play cycle: the whole pending list, concatenated in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayCycle {
    pub id: u64,
    /// Remote-native PCM, still to be transcoded for the call.
    pub pcm: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerState {
    Idle,
    /// Transcoding the cycle's audio.
    Preparing(u64),
    /// The player holds the cycle's resource.
    Playing(u64),
}

#[derive(Debug)]
pub struct PlaybackQueue {
    pending: Vec<Vec<u8>>,
    state: PlayerState,
    last_cycle: u64,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            state: PlayerState::Idle,
            last_cycle: 0,
        }
    }

    /// Append agent audio. Returns a new cycle to prepare if the queue was
    /// idle.
    pub fn enqueue(&mut self, pcm: Vec<u8>) -> Option<PlayCycle> {
        if !pcm.is_empty() {
            self.pending.push(pcm);
        }
        match self.state {
            PlayerState::Idle => self.start_cycle(),
            PlayerState::Preparing(_) | PlayerState::Playing(_) => None,
        }
    }

    /// The cycle's audio is ready for the player. False if the cycle was
    /// superseded; the caller must then discard the audio.
    pub fn on_prepared(&mut self, cycle: u64) -> bool {
        if self.state == PlayerState::Preparing(cycle) {
            self.state = PlayerState::Playing(cycle);
            true
        } else {
            false
        }
    }

    /// Transcoding the cycle failed; its audio is dropped.
    pub fn on_prepare_failed(&mut self, cycle: u64) -> Option<PlayCycle> {
        if self.state != PlayerState::Preparing(cycle) {
            return None;
        }
        self.state = PlayerState::Idle;
        self.start_cycle()
    }

    /// The player finished the cycle's resource.
    pub fn on_idle(&mut self, cycle: u64) -> Option<PlayCycle> {
        if self.state != PlayerState::Playing(cycle) {
            return None;
        }
        self.state = PlayerState::Idle;
        self.start_cycle()
    }

    /// The player rejected or failed the cycle's resource. The rest of that
    /// resource is abandoned.
    pub fn on_player_error(&mut self, cycle: u64) -> Option<PlayCycle> {
        match self.state {
            PlayerState::Preparing(id) | PlayerState::Playing(id) if id == cycle => {
                self.state = PlayerState::Idle;
                self.start_cycle()
            }
            _ => None,
        }
    }

    /// Drop all pending audio and invalidate the current cycle. The caller
    /// stops the player in the same step.
    pub fn flush(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.state = PlayerState::Idle;
        dropped
    }

    /// True while a cycle is being prepared or played.
    pub fn is_playing(&self) -> bool {
        self.state != PlayerState::Idle
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Id of the cycle in flight, if any.
    pub fn current_cycle(&self) -> Option<u64> {
        match self.state {
            PlayerState::Idle => None,
            PlayerState::Preparing(id) | PlayerState::Playing(id) => Some(id),
        }
    }

    fn start_cycle(&mut self) -> Option<PlayCycle> {
        if self.pending.is_empty() {
            return None;
        }
        self.last_cycle += 1;
        let id = self.last_cycle;
        let pcm = std::mem::take(&mut self.pending).concat();
        self.state = PlayerState::Preparing(id);
        Some(PlayCycle { id, pcm })
    }
}
