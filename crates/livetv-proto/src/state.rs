use crate::protocol::{ActiveShow, ChannelState, PlaybackPhase, ScheduleStatus};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly copy of what the channel is doing, for host UIs.
/// Only the core loop writes; every setter bumps `rev`.
pub struct StateManager {
    state: Arc<RwLock<ChannelState>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ChannelState {
                rev: 1,
                ..ChannelState::default()
            })),
        }
    }

    pub async fn get_state(&self) -> ChannelState {
        self.state.read().await.clone()
    }

    pub async fn now_playing(&self) -> Option<ActiveShow> {
        self.state.read().await.now_playing.clone()
    }

    pub async fn set_schedule(&self, schedule: ScheduleStatus) {
        let mut state = self.state.write().await;
        state.schedule = schedule;
        state.rev += 1;
    }

    /// Swap the on-air descriptor wholesale together with the phase.
    pub async fn set_on_air(&self, show: Option<ActiveShow>, phase: PlaybackPhase) {
        let mut state = self.state.write().await;
        state.now_playing = show;
        state.phase = phase;
        if phase == PlaybackPhase::Playing {
            state.last_error = None;
        }
        state.rev += 1;
    }

    pub async fn set_phase(&self, phase: PlaybackPhase) {
        let mut state = self.state.write().await;
        state.phase = phase;
        state.rev += 1;
    }

    pub async fn set_fullscreen(&self, fullscreen: bool) {
        let mut state = self.state.write().await;
        state.fullscreen = fullscreen;
        state.rev += 1;
    }

    pub async fn set_last_error(&self, error: Option<String>) {
        let mut state = self.state.write().await;
        state.last_error = error;
        state.rev += 1;
    }
}
