use thiserror::Error;

/// Failures the scheduling engine distinguishes.  A refresh only ever fails
/// with `ScheduleUnavailable` or `EmptyPlaylist`; the others are absorbed
/// with a default or a retry on the next tick.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No cached schedule and the remote fetch failed.
    #[error("schedule unavailable: {0}")]
    ScheduleUnavailable(String),

    /// The document decoded fine but has nothing schedulable in it.
    #[error("playlist is empty")]
    EmptyPlaylist,

    /// Header probe for an item without a declared duration failed.
    #[error("duration probe failed for {source_ref}: {reason}")]
    DurationProbeFailed { source_ref: String, reason: String },

    /// The player rejected a load/seek/play/pause.
    #[error("playback failed: {0}")]
    PlaybackFailed(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
