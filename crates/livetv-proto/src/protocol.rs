use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Host UIs check it on connect.
pub const PROTOCOL_VERSION: u32 = 1;

// ── schedule model ────────────────────────────────────────────────────────────

/// Where an item's duration came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationSource {
    /// Present in the playlist document.
    Declared,
    /// Read from the media header.
    Probed,
    /// Fallback after a missing or failed probe.
    Default,
    #[default]
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: String,
    pub name: String,
    #[serde(rename = "url")]
    pub source_ref: String,
    /// Length in whole seconds.  `None` until resolved.
    #[serde(default)]
    pub duration_secs: Option<u32>,
    #[serde(default)]
    pub duration_source: DurationSource,
}

impl PlaylistItem {
    /// Duration usable for scheduling; unresolved or zero-length items
    /// occupy no air time.
    pub fn scheduled_secs(&self) -> u64 {
        self.duration_secs.map(u64::from).unwrap_or(0)
    }

    pub fn is_resolved(&self) -> bool {
        self.scheduled_secs() > 0
    }

    pub fn with_duration(mut self, secs: u32, source: DurationSource) -> Self {
        self.duration_secs = Some(secs);
        self.duration_source = source;
        self
    }
}

/// Ordered broadcast rotation.  Order is the on-air order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub items: Vec<PlaylistItem>,
}

impl Playlist {
    pub fn new(items: Vec<PlaylistItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// One full cycle in seconds.  Derived from the items on every call so it
    /// always matches the current durations.
    pub fn total_duration_secs(&self) -> u64 {
        self.items.iter().map(PlaylistItem::scheduled_secs).sum()
    }

    /// True when every item already carries a usable duration.
    pub fn is_fully_resolved(&self) -> bool {
        self.items.iter().all(PlaylistItem::is_resolved)
    }

    /// A playlist with zero total length cannot be scheduled.
    pub fn is_schedulable(&self) -> bool {
        self.total_duration_secs() > 0
    }
}

/// The program that should be on air, and how far into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveShow {
    pub item: PlaylistItem,
    pub offset_secs: u64,
    pub index: usize,
}

impl ActiveShow {
    /// Same slot of the rotation, regardless of offset.
    pub fn same_slot(&self, other: &ActiveShow) -> bool {
        self.index == other.index && self.item.id == other.item.id
    }
}

// ── published channel state ───────────────────────────────────────────────────

/// Where the schedule currently in use came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOrigin {
    /// Fresh cache, no network call made.
    Cache,
    Network,
    /// Fetch failed; serving an expired cache entry.
    StaleCache,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[default]
    Loading,
    Ready {
        fetched_at: DateTime<Utc>,
        items: usize,
        total_duration_secs: u64,
        origin: ScheduleOrigin,
    },
    /// Nothing to schedule.  The host shows an error with a retry action.
    Unavailable { reason: String },
}

/// Playback controller phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackPhase {
    #[default]
    Idle, // nothing loaded yet
    Loading, // load/seek sent to the player
    Playing,
    Paused, // viewer paused; falls behind broadcast time
}

/// Full state published to host UIs.  `rev` increments on every change.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChannelState {
    #[serde(default)]
    pub rev: u64,
    pub schedule: ScheduleStatus,
    pub now_playing: Option<ActiveShow>,
    pub phase: PlaybackPhase,
    #[serde(default)]
    pub fullscreen: bool,
    /// Last non-fatal playback warning, cleared on the next successful start.
    #[serde(default)]
    pub last_error: Option<String>,
}

// ── wire protocol ─────────────────────────────────────────────────────────────

/// Messages sent from a host UI to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    TogglePause,
    ToggleFullscreen,
    /// Manual retry after `ScheduleStatus::Unavailable`.
    RetrySchedule,
    /// Re-derive the live position right now.
    Resync,
    GetState,
}

/// Messages sent from the daemon to host UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: ChannelState,
    },
    State {
        data: ChannelState,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Upper bound on one frame's JSON body.  Host messages are a few hundred
/// bytes; anything near this is a broken or hostile client.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Why `Message::decode` could not produce a message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Not enough bytes yet; read more and try again.
    #[error("incomplete frame")]
    Incomplete,
    /// The length header exceeds `MAX_FRAME_LEN`.  The stream cannot be
    /// resynchronised.
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    TooLarge(usize),
    /// A complete frame whose body is not a valid message.  Its `4 + len`
    /// bytes can be skipped.
    #[error("malformed {len} byte frame: {source}")]
    Malformed {
        len: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// Frame as a 4-byte big-endian length followed by JSON.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_FRAME_LEN {
            anyhow::bail!(FrameError::TooLarge(json.len()));
        }
        let len = u32::try_from(json.len())?;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`, returning the message and
    /// the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Incomplete);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if data.len() < 4 + len {
            return Err(FrameError::Incomplete);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])
            .map_err(|source| FrameError::Malformed { len, source })?;
        Ok((msg, 4 + len))
    }
}
