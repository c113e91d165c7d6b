//! Duration resolution for items the playlist document left without one.
//!
//! A failed or implausible probe never removes an item from the rotation: it
//! gets the configured default instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ScheduleConfig;
use crate::error::{ChannelError, Result};
use crate::protocol::{DurationSource, Playlist, PlaylistItem};

/// Reads a media header and reports its length in seconds, without playing.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn probe_duration(&self, source_ref: &str) -> anyhow::Result<f64>;
}

/// `ffprobe -show_format` against the source.  Works for URLs and paths.
pub struct FfprobeProbe {
    binary: PathBuf,
}

impl FfprobeProbe {
    pub fn new() -> Self {
        let binary = crate::platform::find_ffprobe_binary().unwrap_or_else(|| PathBuf::from("ffprobe"));
        Self { binary }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurationProbe for FfprobeProbe {
    async fn probe_duration(&self, source_ref: &str) -> anyhow::Result<f64> {
        let output = tokio::process::Command::new(&self.binary)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", source_ref])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!("ffprobe exited {}", output.status);
        }

        let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        json["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| anyhow::anyhow!("ffprobe reported no duration"))
    }
}

/// Probed lengths by source locator, valid for one schedule version.
#[derive(Default)]
struct ProbeMemo {
    version: Option<DateTime<Utc>>,
    durations: HashMap<String, u32>,
}

pub struct DurationResolver {
    probe: Arc<dyn DurationProbe>,
    default_secs: u32,
    timeout: Duration,
    concurrency: usize,
    memo: Mutex<ProbeMemo>,
}

impl DurationResolver {
    pub fn new(probe: Arc<dyn DurationProbe>, config: &ScheduleConfig) -> Self {
        Self {
            probe,
            default_secs: config.default_duration_secs,
            timeout: config.probe_timeout(),
            concurrency: config.probe_concurrency.max(1),
            memo: Mutex::new(ProbeMemo::default()),
        }
    }

    /// Authoritative duration of one item.  Declared durations are returned
    /// untouched; otherwise the header is probed and floored to whole
    /// seconds.
    pub async fn resolve(&self, item: &PlaylistItem) -> Result<u32> {
        if item.duration_source == DurationSource::Declared {
            if let Some(secs) = item.duration_secs.filter(|&s| s > 0) {
                return Ok(secs);
            }
        }

        if let Some(&secs) = self.memo.lock().await.durations.get(&item.source_ref) {
            return Ok(secs);
        }

        let failed = |reason: String| ChannelError::DurationProbeFailed {
            source_ref: item.source_ref.clone(),
            reason,
        };

        let raw = tokio::time::timeout(self.timeout, self.probe.probe_duration(&item.source_ref))
            .await
            .map_err(|_| failed(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| failed(e.to_string()))?;

        if !raw.is_finite() || raw < 1.0 {
            return Err(failed(format!("implausible duration {raw}")));
        }
        let secs = raw.floor().min(f64::from(u32::MAX)) as u32;

        self.memo
            .lock()
            .await
            .durations
            .insert(item.source_ref.clone(), secs);
        debug!("resolve: probed {} → {}s", item.source_ref, secs);
        Ok(secs)
    }

    /// Resolve one item, falling back to the default on any probe failure.
    pub async fn resolve_or_default(&self, item: PlaylistItem) -> PlaylistItem {
        let declared = item.duration_source == DurationSource::Declared && item.is_resolved();
        match self.resolve(&item).await {
            Ok(secs) if declared => item.with_duration(secs, DurationSource::Declared),
            Ok(secs) => item.with_duration(secs, DurationSource::Probed),
            Err(e) => {
                warn!("resolve: {}; using default {}s", e, self.default_secs);
                item.with_duration(self.default_secs, DurationSource::Default)
            }
        }
    }

    /// Resolve every item that still lacks a usable duration, probing up to
    /// `concurrency` sources at a time.  Order is preserved.
    ///
    /// `version` identifies the schedule (its fetch time).  Lengths probed
    /// for an earlier version are forgotten, so a file republished under the
    /// same URL is measured again.
    pub async fn resolve_playlist(&self, playlist: Playlist, version: DateTime<Utc>) -> Playlist {
        {
            let mut memo = self.memo.lock().await;
            if memo.version != Some(version) {
                if !memo.durations.is_empty() {
                    debug!(
                        "resolve: new schedule version, dropping {} memoized lengths",
                        memo.durations.len()
                    );
                }
                memo.durations.clear();
                memo.version = Some(version);
            }
        }

        if playlist.is_fully_resolved() {
            return playlist;
        }

        let pending = playlist.items.iter().filter(|i| !i.is_resolved()).count();
        info!("resolve: probing {} of {} programs", pending, playlist.len());

        let items: Vec<PlaylistItem> = stream::iter(playlist.items)
            .map(|item| async move {
                if item.is_resolved() {
                    item
                } else {
                    self.resolve_or_default(item).await
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        Playlist::new(items)
    }
}
