use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Durable copy of the last good schedule.
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    #[serde(default)]
    pub fullscreen_on_start: bool,
}

/// Where the playlist comes from and how the live position is derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// `http(s)://` URL or a local JSON file path.
    #[serde(default = "default_playlist_url")]
    pub playlist_url: String,
    /// UTC offset every client computes the clock in, e.g. `"+03:30"`.
    /// Never the host's local zone.
    #[serde(default = "default_reference_utc_offset")]
    pub reference_utc_offset: String,
    /// A cached schedule younger than this is used without a network call.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Applied to items whose duration is missing or cannot be probed.
    #[serde(default = "default_duration_secs")]
    pub default_duration_secs: u32,
    /// Probe media headers for items without a declared duration.  When off,
    /// the default duration is applied at fetch time.
    #[serde(default = "default_resolve_missing_durations")]
    pub resolve_missing_durations: bool,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// What happens when a paused viewer resumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Continue from the paused offset; the viewer stays behind broadcast time.
    #[default]
    Continue,
    /// Jump back to the live position on resume.
    SnapToLive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub resume_policy: ResumePolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cache_file: default_cache_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            fullscreen_on_start: false,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            playlist_url: default_playlist_url(),
            reference_utc_offset: default_reference_utc_offset(),
            freshness_secs: default_freshness_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            resync_interval_secs: default_resync_interval_secs(),
            default_duration_secs: default_duration_secs(),
            resolve_missing_durations: default_resolve_missing_durations(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_concurrency: default_probe_concurrency(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_cache_file() -> PathBuf {
    platform::data_dir().join("schedule-cache.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8977
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_volume() -> f32 {
    1.0
}

fn default_playlist_url() -> String {
    "https://raw.githubusercontent.com/Afsoone/mobile/main/tv.json".to_string()
}

fn default_reference_utc_offset() -> String {
    "+03:30".to_string()
}

fn default_freshness_secs() -> u64 {
    15 * 60
}

fn default_refresh_interval_secs() -> u64 {
    60 * 60
}

fn default_resync_interval_secs() -> u64 {
    1
}

fn default_duration_secs() -> u32 {
    300
}

fn default_resolve_missing_durations() -> bool {
    true
}

fn default_probe_timeout_secs() -> u64 {
    20
}

fn default_probe_concurrency() -> usize {
    4
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

impl ScheduleConfig {
    pub fn reference_offset(&self) -> anyhow::Result<FixedOffset> {
        parse_utc_offset(&self.reference_utc_offset)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Parse `"UTC"`, `"Z"`, `"+03:30"`, `"-0500"` or `"+3"` into an offset.
pub fn parse_utc_offset(raw: &str) -> anyhow::Result<FixedOffset> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("utc") || s.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow::anyhow!("invalid offset"));
    }

    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => anyhow::bail!("UTC offset '{}' must start with '+' or '-'", raw),
    };
    if !rest.is_ascii() {
        anyhow::bail!("UTC offset '{}' contains non-ASCII characters", raw);
    }

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: u32 = hours
        .parse()
        .map_err(|_| anyhow::anyhow!("bad hours in UTC offset '{}'", raw))?;
    let minutes: u32 = minutes
        .parse()
        .map_err(|_| anyhow::anyhow!("bad minutes in UTC offset '{}'", raw))?;
    if hours > 14 || minutes >= 60 {
        anyhow::bail!("UTC offset '{}' out of range", raw);
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60) as i32)
        .ok_or_else(|| anyhow::anyhow!("UTC offset '{}' out of range", raw))
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Reject values that would make scheduling meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.schedule;
        s.reference_offset()?;
        if s.playlist_url.trim().is_empty() {
            anyhow::bail!("schedule.playlist_url is empty");
        }
        if s.default_duration_secs == 0 {
            anyhow::bail!("schedule.default_duration_secs must be positive");
        }
        if s.resync_interval_secs == 0 || s.refresh_interval_secs == 0 {
            anyhow::bail!("schedule intervals must be positive");
        }
        if s.probe_concurrency == 0 {
            anyhow::bail!("schedule.probe_concurrency must be at least 1");
        }
        Ok(())
    }
}
