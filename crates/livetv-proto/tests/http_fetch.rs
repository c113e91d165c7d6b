//! End-to-end schedule acquisition against a local HTTP server: fetch,
//! normalize, cache, resolve, then compute what is on air.

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use livetv_proto::config::ScheduleConfig;
use livetv_proto::error::ChannelError;
use livetv_proto::fetch::{HttpPlaylistSource, PlaylistSource, ScheduleFetcher};
use livetv_proto::protocol::{DurationSource, ScheduleOrigin};
use livetv_proto::resolve::{DurationProbe, DurationResolver};
use livetv_proto::schedule::position_at;
use livetv_proto::store::{CacheEntry, ScheduleStore};
use std::sync::Arc;
use std::time::Duration;

const TV_JSON: &str = r#"{
  "programs": [
    {"name": "Cartoon Hour", "url": "https://cdn.example/cartoon.mp4", "duration": 120},
    {"name": "Bedtime Story", "url": "https://cdn.example/story.mp4"},
    {"name": "Puppet Show", "url": "https://cdn.example/puppets.mp4", "duration": 300}
  ]
}"#;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct FixedProbe(f64);

#[async_trait]
impl DurationProbe for FixedProbe {
    async fn probe_duration(&self, _source_ref: &str) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn fetch_resolve_and_schedule() {
    let base = serve(Router::new().route("/tv.json", get(|| async { TV_JSON }))).await;
    let config = ScheduleConfig::default();
    let store = Arc::new(ScheduleStore::in_memory());
    let source: Arc<dyn PlaylistSource> =
        Arc::new(HttpPlaylistSource::new(format!("{base}/tv.json"), Duration::from_secs(5)).unwrap());

    let fetcher = ScheduleFetcher::new(source, store.clone(), &config);
    let refreshed = fetcher.refresh(noon()).await.unwrap();
    assert_eq!(refreshed.origin, ScheduleOrigin::Network);
    assert_eq!(refreshed.playlist.len(), 3);
    assert_eq!(refreshed.playlist.items[1].duration_secs, None);

    let resolver = DurationResolver::new(Arc::new(FixedProbe(180.4)), &config);
    let playlist = resolver
        .resolve_playlist(refreshed.playlist, refreshed.fetched_at)
        .await;
    assert_eq!(playlist.items[1].duration_source, DurationSource::Probed);
    assert_eq!(playlist.total_duration_secs(), 600);

    store.write(CacheEntry::new(refreshed.fetched_at, playlist.clone())).await;
    let cached = store.read().await.unwrap();
    assert_eq!(cached.fetched_at, noon());
    assert!(cached.payload.is_fully_resolved());

    let show = position_at(&cached.payload, 599).unwrap();
    assert_eq!(show.item.name, "Puppet Show");
    assert_eq!(show.offset_secs, 299);
}

#[tokio::test]
async fn server_error_falls_back_to_twenty_minute_old_cache() {
    let base = serve(Router::new().route(
        "/tv.json",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    ))
    .await;
    let config = ScheduleConfig::default();
    let store = Arc::new(ScheduleStore::in_memory());

    // Seed the cache through a healthy server first.
    let healthy = serve(Router::new().route("/tv.json", get(|| async { TV_JSON }))).await;
    let seed_at = noon() - chrono::Duration::minutes(20);
    ScheduleFetcher::new(
        Arc::new(HttpPlaylistSource::new(format!("{healthy}/tv.json"), Duration::from_secs(5)).unwrap()),
        store.clone(),
        &config,
    )
    .refresh(seed_at)
    .await
    .unwrap();

    let failing = ScheduleFetcher::new(
        Arc::new(HttpPlaylistSource::new(format!("{base}/tv.json"), Duration::from_secs(5)).unwrap()),
        store.clone(),
        &config,
    );
    let refreshed = failing.refresh(noon()).await.unwrap();
    assert_eq!(refreshed.origin, ScheduleOrigin::StaleCache);
    assert_eq!(refreshed.fetched_at, seed_at);
    assert_eq!(refreshed.playlist.len(), 3);
}

#[tokio::test]
async fn server_error_without_cache_is_unavailable() {
    let base = serve(Router::new().route(
        "/tv.json",
        get(|| async { (StatusCode::NOT_FOUND, "missing") }),
    ))
    .await;
    let fetcher = ScheduleFetcher::new(
        Arc::new(HttpPlaylistSource::new(format!("{base}/tv.json"), Duration::from_secs(5)).unwrap()),
        Arc::new(ScheduleStore::in_memory()),
        &ScheduleConfig::default(),
    );
    let err = fetcher.refresh(noon()).await.unwrap_err();
    assert!(matches!(err, ChannelError::ScheduleUnavailable(_)));
    assert!(err.to_string().contains("404"));
}
