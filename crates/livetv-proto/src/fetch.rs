//! Schedule acquisition: remote document → strict `Playlist`, with the cache
//! as both a short-circuit and a fallback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ScheduleConfig;
use crate::error::{ChannelError, Result};
use crate::protocol::{DurationSource, Playlist, PlaylistItem, ScheduleOrigin};
use crate::store::{is_fresh, CacheEntry, ScheduleStore};

// ── document decoding ─────────────────────────────────────────────────────────

/// Loose shape of the published JSON.  Only ever converted through
/// [`normalize_document`]; nothing downstream sees it.
#[derive(Debug, Deserialize)]
pub struct PlaylistDocument {
    pub programs: Vec<RawProgram>,
}

#[derive(Debug, Deserialize)]
pub struct RawProgram {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub duration: Option<serde_json::Value>,
}

/// Parse the raw bytes of a playlist document.
pub fn parse_document(bytes: &[u8]) -> anyhow::Result<PlaylistDocument> {
    let doc: PlaylistDocument = serde_json::from_slice(bytes)
        .map_err(|e| anyhow::anyhow!("invalid playlist document: {}", e))?;
    Ok(doc)
}

/// Accepts `300`, `300.0` and `"300"`; anything non-positive is missing.
fn parse_duration(value: &serde_json::Value) -> Option<u32> {
    let secs = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !secs.is_finite() || secs < 1.0 {
        return None;
    }
    Some(secs.floor().min(f64::from(u32::MAX)) as u32)
}

fn derived_id(index: usize, url: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    url.hash(&mut h);
    format!("{:04}-{:08x}", index, h.finish() as u32)
}

/// Turn a document into a strict playlist.  Programs without a name or url
/// are dropped.  Missing durations stay unresolved when `default_duration`
/// is `None`, otherwise the default is applied.
pub fn normalize_document(doc: PlaylistDocument, default_duration: Option<u32>) -> Result<Playlist> {
    let mut items = Vec::with_capacity(doc.programs.len());

    for (index, raw) in doc.programs.into_iter().enumerate() {
        let name = raw.name.as_deref().map(str::trim).unwrap_or_default();
        let url = raw.url.as_deref().map(str::trim).unwrap_or_default();
        if name.is_empty() || url.is_empty() {
            warn!("fetch: dropping program #{} without name or url", index);
            continue;
        }

        let id = match raw.id {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => derived_id(index, url),
        };

        let (duration_secs, duration_source) = match raw.duration.as_ref().and_then(parse_duration) {
            Some(secs) => (Some(secs), DurationSource::Declared),
            None => match default_duration {
                Some(secs) => (Some(secs), DurationSource::Default),
                None => (None, DurationSource::Unresolved),
            },
        };

        items.push(PlaylistItem {
            id,
            name: name.to_string(),
            source_ref: url.to_string(),
            duration_secs,
            duration_source,
        });
    }

    if items.is_empty() {
        return Err(ChannelError::EmptyPlaylist);
    }

    // Ids must be unique within a playlist; later duplicates get a suffix.
    let mut seen = std::collections::HashSet::new();
    for (index, item) in items.iter_mut().enumerate() {
        if !seen.insert(item.id.clone()) {
            item.id = format!("{}#{}", item.id, index);
            seen.insert(item.id.clone());
        }
    }

    Ok(Playlist::new(items))
}

// ── sources ───────────────────────────────────────────────────────────────────

/// Somewhere a playlist document can be read from.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<PlaylistDocument>;

    fn describe(&self) -> String;
}

pub struct HttpPlaylistSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPlaylistSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("livetv/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PlaylistSource for HttpPlaylistSource {
    async fn fetch(&self) -> anyhow::Result<PlaylistDocument> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }
        let bytes = response.bytes().await?;
        parse_document(&bytes)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub struct FilePlaylistSource {
    path: PathBuf,
}

impl FilePlaylistSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PlaylistSource for FilePlaylistSource {
    async fn fetch(&self) -> anyhow::Result<PlaylistDocument> {
        let bytes = tokio::fs::read(&self.path).await?;
        parse_document(&bytes)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Pick a source for `playlist_url`: http(s) URLs go over the network,
/// anything else is a local path.
pub fn source_for(config: &ScheduleConfig) -> anyhow::Result<Arc<dyn PlaylistSource>> {
    let target = config.playlist_url.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        Ok(Arc::new(HttpPlaylistSource::new(target, config.fetch_timeout())?))
    } else {
        Ok(Arc::new(FilePlaylistSource::new(target)))
    }
}

// ── fetcher ───────────────────────────────────────────────────────────────────

/// Result of a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Refreshed {
    pub playlist: Playlist,
    pub fetched_at: DateTime<Utc>,
    pub origin: ScheduleOrigin,
}

pub struct ScheduleFetcher {
    source: Arc<dyn PlaylistSource>,
    store: Arc<ScheduleStore>,
    freshness: Duration,
    /// `Some` when missing durations are defaulted here instead of probed.
    default_duration: Option<u32>,
}

impl ScheduleFetcher {
    pub fn new(
        source: Arc<dyn PlaylistSource>,
        store: Arc<ScheduleStore>,
        config: &ScheduleConfig,
    ) -> Self {
        let default_duration =
            (!config.resolve_missing_durations).then_some(config.default_duration_secs);
        Self {
            source,
            store,
            freshness: config.freshness(),
            default_duration,
        }
    }

    /// Fresh cache → cache.  Otherwise fetch, normalize and store.  If that
    /// fails, any cache at all beats having nothing.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<Refreshed> {
        let cached = self.store.read().await;

        if let Some(entry) = cached.as_ref() {
            if is_fresh(entry, self.freshness, now) {
                debug!("fetch: cache fetched at {} still fresh", entry.fetched_at);
                return Ok(Refreshed {
                    playlist: entry.payload.clone(),
                    fetched_at: entry.fetched_at,
                    origin: ScheduleOrigin::Cache,
                });
            }
        }

        match self.fetch_remote().await {
            Ok(playlist) => {
                info!(
                    "fetch: loaded {} programs ({}s) from {}",
                    playlist.len(),
                    playlist.total_duration_secs(),
                    self.source.describe()
                );
                self.store
                    .write(CacheEntry::new(now, playlist.clone()))
                    .await;
                Ok(Refreshed {
                    playlist,
                    fetched_at: now,
                    origin: ScheduleOrigin::Network,
                })
            }
            Err(e) => match cached {
                Some(entry) => {
                    warn!(
                        "fetch: {} failed ({}), serving cache from {}",
                        self.source.describe(),
                        e,
                        entry.fetched_at
                    );
                    Ok(Refreshed {
                        playlist: entry.payload.clone(),
                        fetched_at: entry.fetched_at,
                        origin: ScheduleOrigin::StaleCache,
                    })
                }
                None => {
                    warn!("fetch: {} failed with no cache: {}", self.source.describe(), e);
                    Err(ChannelError::ScheduleUnavailable(e.to_string()))
                }
            },
        }
    }

    async fn fetch_remote(&self) -> Result<Playlist> {
        let doc = self
            .source
            .fetch()
            .await
            .map_err(|e| ChannelError::ScheduleUnavailable(e.to_string()))?;
        normalize_document(doc, self.default_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a canned document (or an error) and counts calls.
    struct CannedSource {
        body: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl CannedSource {
        fn ok(body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                body: Some(body),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                body: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PlaylistSource for CannedSource {
        async fn fetch(&self) -> anyhow::Result<PlaylistDocument> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.body {
                Some(body) => parse_document(body.as_bytes()),
                None => anyhow::bail!("connection refused"),
            }
        }

        fn describe(&self) -> String {
            "canned".into()
        }
    }

    const DOC: &str = r#"{"programs":[
        {"name":"Morning Cartoons","url":"https://cdn.example/a.mp4","duration":120},
        {"name":"Story Time","url":"https://cdn.example/b.mp4"}
    ]}"#;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    fn fetcher(source: Arc<CannedSource>, store: Arc<ScheduleStore>) -> ScheduleFetcher {
        ScheduleFetcher::new(source, store, &ScheduleConfig::default())
    }

    fn cached_playlist() -> Playlist {
        normalize_document(parse_document(DOC.as_bytes()).unwrap(), Some(300)).unwrap()
    }

    #[test]
    fn test_normalize_leaves_missing_duration_unresolved() {
        let playlist = normalize_document(parse_document(DOC.as_bytes()).unwrap(), None).unwrap();
        assert_eq!(playlist.items[0].duration_secs, Some(120));
        assert_eq!(playlist.items[0].duration_source, DurationSource::Declared);
        assert_eq!(playlist.items[1].duration_secs, None);
        assert_eq!(playlist.items[1].duration_source, DurationSource::Unresolved);
    }

    #[test]
    fn test_normalize_applies_default_when_asked() {
        let playlist = cached_playlist();
        assert_eq!(playlist.items[1].duration_secs, Some(300));
        assert_eq!(playlist.items[1].duration_source, DurationSource::Default);
        assert_eq!(playlist.total_duration_secs(), 420);
    }

    #[test]
    fn test_normalize_drops_incomplete_programs_and_parses_loose_durations() {
        let doc = parse_document(
            br#"{"programs":[
                {"name":"  ","url":"https://cdn.example/x.mp4","duration":10},
                {"name":"No Url"},
                {"name":"Stringly","url":"https://cdn.example/s.mp4","duration":"95.7"},
                {"name":"Negative","url":"https://cdn.example/n.mp4","duration":-4}
            ]}"#,
        )
        .unwrap();
        let playlist = normalize_document(doc, None).unwrap();
        assert_eq!(playlist.len(), 2);
        assert_eq!(playlist.items[0].name, "Stringly");
        assert_eq!(playlist.items[0].duration_secs, Some(95));
        assert_eq!(playlist.items[1].duration_secs, None);
    }

    #[test]
    fn test_normalize_ids_are_unique() {
        let doc = parse_document(
            br#"{"programs":[
                {"id":"x","name":"One","url":"https://cdn.example/1.mp4"},
                {"id":"x","name":"Two","url":"https://cdn.example/2.mp4"},
                {"name":"Three","url":"https://cdn.example/1.mp4"},
                {"name":"Four","url":"https://cdn.example/1.mp4"}
            ]}"#,
        )
        .unwrap();
        let playlist = normalize_document(doc, None).unwrap();
        let ids: std::collections::HashSet<_> = playlist.items.iter().map(|i| &i.id).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(playlist.items[0].id, "x");
    }

    #[test]
    fn test_document_without_programs_is_rejected() {
        assert!(parse_document(br#"{"shows":[]}"#).is_err());
        assert!(parse_document(b"[1,2,3]").is_err());
        let empty = parse_document(br#"{"programs":[]}"#).unwrap();
        assert!(matches!(
            normalize_document(empty, None),
            Err(ChannelError::EmptyPlaylist)
        ));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_network() {
        let store = Arc::new(ScheduleStore::in_memory());
        store.write(CacheEntry::new(at(8, 0), cached_playlist())).await;
        let source = CannedSource::ok(DOC);

        let refreshed = fetcher(source.clone(), store).refresh(at(8, 10)).await.unwrap();
        assert_eq!(refreshed.origin, ScheduleOrigin::Cache);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_triggers_fetch_and_overwrites() {
        let store = Arc::new(ScheduleStore::in_memory());
        store.write(CacheEntry::new(at(8, 0), Playlist::default())).await;
        let source = CannedSource::ok(DOC);

        let refreshed = fetcher(source.clone(), store.clone())
            .refresh(at(9, 0))
            .await
            .unwrap();
        assert_eq!(refreshed.origin, ScheduleOrigin::Network);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let entry = store.read().await.unwrap();
        assert_eq!(entry.fetched_at, at(9, 0));
        assert_eq!(entry.payload.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_falls_back_to_stale_cache() {
        let store = Arc::new(ScheduleStore::in_memory());
        store.write(CacheEntry::new(at(8, 0), cached_playlist())).await;

        let refreshed = fetcher(CannedSource::failing(), store)
            .refresh(at(8, 20))
            .await
            .unwrap();
        assert_eq!(refreshed.origin, ScheduleOrigin::StaleCache);
        assert_eq!(refreshed.fetched_at, at(8, 0));
        assert_eq!(refreshed.playlist, cached_playlist());
    }

    #[tokio::test]
    async fn test_failed_fetch_without_cache_is_unavailable() {
        let store = Arc::new(ScheduleStore::in_memory());
        let err = fetcher(CannedSource::failing(), store.clone())
            .refresh(at(8, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ScheduleUnavailable(_)));
        assert!(store.read().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_document_keeps_previous_cache() {
        let store = Arc::new(ScheduleStore::in_memory());
        store.write(CacheEntry::new(at(8, 0), cached_playlist())).await;

        let refreshed = fetcher(CannedSource::ok(r#"{"programs":[]}"#), store.clone())
            .refresh(at(10, 0))
            .await
            .unwrap();
        assert_eq!(refreshed.origin, ScheduleOrigin::StaleCache);
        assert_eq!(store.read().await.unwrap().fetched_at, at(8, 0));
    }

    #[test]
    fn test_source_for_picks_by_scheme() {
        let mut config = ScheduleConfig::default();
        assert!(source_for(&config).unwrap().describe().starts_with("https://"));
        config.playlist_url = "/srv/tv.json".into();
        assert_eq!(source_for(&config).unwrap().describe(), "/srv/tv.json");
    }
}
