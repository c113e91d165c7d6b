/// ChannelCore: single-owner event loop for the channel.
///
/// Every input (host commands, the resync and refresh timers, schedule
/// refresh completions, the player's end-of-file) arrives as a
/// `ChannelEvent` on one mpsc channel.  ChannelCore owns the playback phase,
/// the on-air descriptor and the current schedule exclusively; no other task
/// touches them.
///
/// After each event that mutates state, ChannelCore publishes to the
/// `StateManager` and sends `BroadcastMessage::StateUpdated` to all
/// listeners.
///
/// Network and probe work never runs inside a handler: a refresh is a
/// spawned task that posts `ScheduleRefreshed` back into the loop.  Both
/// timers and any in-flight refresh are bound to a `CancellationToken`
/// cancelled on shutdown.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use livetv_proto::config::{Config, ResumePolicy};
use livetv_proto::error::ChannelError;
use livetv_proto::fetch::{source_for, Refreshed, ScheduleFetcher};
use livetv_proto::protocol::{ActiveShow, Command, PlaybackPhase, Playlist, ScheduleStatus};
use livetv_proto::resolve::{DurationResolver, FfprobeProbe};
use livetv_proto::schedule::{compute_active, next_show};
use livetv_proto::state::StateManager;
use livetv_proto::store::{CacheEntry, ScheduleStore};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::player::Player;
use crate::BroadcastMessage;

// ── ChannelEvent ──────────────────────────────────────────────────────────────

/// All inputs into the ChannelCore loop.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    ResyncTick,
    RefreshTick,
    /// Posted by the refresh task when fetch + resolve finished.
    ScheduleRefreshed(Result<Refreshed, ChannelError>),
    /// A file played to its end.  `entry` is the id `Player::load`
    /// returned for it, when the player assigns ids.
    PlayerEnded { entry: Option<u64> },
    Shutdown,
}

// ── schedule plumbing ─────────────────────────────────────────────────────────

/// Store, fetcher and resolver sharing one cache.
pub struct ScheduleSources {
    pub store: Arc<ScheduleStore>,
    pub fetcher: Arc<ScheduleFetcher>,
    pub resolver: Arc<DurationResolver>,
}

impl ScheduleSources {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(ScheduleStore::with_cache_file(
            config.daemon.cache_file.clone(),
        ));
        let source = source_for(&config.schedule)?;
        info!("Schedule source: {}", source.describe());
        let fetcher = Arc::new(ScheduleFetcher::new(
            source,
            Arc::clone(&store),
            &config.schedule,
        ));
        let resolver = Arc::new(DurationResolver::new(
            Arc::new(FfprobeProbe::new()),
            &config.schedule,
        ));
        Ok(Self {
            store,
            fetcher,
            resolver,
        })
    }
}

/// Fetch, then probe whatever still lacks a duration.  The resolved
/// playlist replaces the stored one, keeping the fetch's `fetched_at`.
async fn refresh_schedule(
    fetcher: &ScheduleFetcher,
    resolver: &DurationResolver,
    store: &ScheduleStore,
    now: DateTime<Utc>,
) -> Result<Refreshed, ChannelError> {
    let refreshed = fetcher.refresh(now).await?;
    if refreshed.playlist.is_fully_resolved() {
        return Ok(refreshed);
    }

    let playlist = resolver
        .resolve_playlist(refreshed.playlist, refreshed.fetched_at)
        .await;
    if !playlist.is_schedulable() {
        return Err(ChannelError::EmptyPlaylist);
    }
    store
        .write(CacheEntry::new(refreshed.fetched_at, playlist.clone()))
        .await;
    Ok(Refreshed {
        playlist,
        fetched_at: refreshed.fetched_at,
        origin: refreshed.origin,
    })
}

// ── ChannelCore ───────────────────────────────────────────────────────────────

pub struct ChannelCore {
    player: Arc<dyn Player>,
    store: Arc<ScheduleStore>,
    fetcher: Arc<ScheduleFetcher>,
    resolver: Arc<DurationResolver>,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Our own sender, cloned into timers and refresh tasks.
    event_tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
    zone: FixedOffset,
    resume_policy: ResumePolicy,
    refresh_interval: Duration,
    resync_interval: Duration,
    /// Resolved schedule the descriptor is derived from.  `None` until the
    /// first refresh lands.
    playlist: Option<Playlist>,
    phase: PlaybackPhase,
    /// What the player has loaded.
    current: Option<ActiveShow>,
    /// Player entry id of `current`.
    loaded_entry: Option<u64>,
    /// Slot that played out before its scheduled end; resync leaves it alone.
    finished: Option<ActiveShow>,
    fullscreen: bool,
    refresh_in_flight: bool,
}

impl ChannelCore {
    pub fn new(
        config: &Config,
        player: Arc<dyn Player>,
        sources: ScheduleSources,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<ChannelEvent>,
    ) -> anyhow::Result<Self> {
        let zone = config.schedule.reference_offset()?;
        Ok(Self {
            player,
            store: sources.store,
            fetcher: sources.fetcher,
            resolver: sources.resolver,
            state_manager: Arc::new(StateManager::new()),
            broadcast_tx,
            event_tx,
            cancel: CancellationToken::new(),
            zone,
            resume_policy: config.playback.resume_policy,
            refresh_interval: config.schedule.refresh_interval(),
            resync_interval: config.schedule.resync_interval(),
            playlist: None,
            phase: PlaybackPhase::Idle,
            current: None,
            loaded_entry: None,
            finished: None,
            fullscreen: config.mpv.fullscreen_on_start,
            refresh_in_flight: false,
        })
    }

    /// Shared state for the socket and HTTP servers.
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run until `Shutdown` or the event channel closes.  The refresh timer
    /// fires immediately, which is the initial schedule load.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<ChannelEvent>) -> anyhow::Result<()> {
        info!("ChannelCore: starting event loop (reference zone {})", self.zone);

        if self.fullscreen {
            self.state_manager.set_fullscreen(true).await;
        }
        self.spawn_ticker(self.refresh_interval, || ChannelEvent::RefreshTick);
        self.spawn_ticker(self.resync_interval, || ChannelEvent::ResyncTick);

        loop {
            let evt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                evt = event_rx.recv() => evt,
            };
            match evt {
                None => {
                    info!("ChannelCore: event channel closed, shutting down");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.cleanup().await
    }

    fn spawn_ticker(&self, period: Duration, make: fn() -> ChannelEvent) {
        let tx = self.event_tx.clone();
        let token = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(make()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn publish(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn handle_event(&mut self, evt: ChannelEvent) {
        match evt {
            ChannelEvent::ClientCommand(cmd) => {
                info!("ChannelCore: command {:?}", cmd);
                self.handle_command(cmd, Utc::now()).await;
            }
            ChannelEvent::ResyncTick => self.resync_at(Utc::now()).await,
            ChannelEvent::RefreshTick => self.request_refresh(),
            ChannelEvent::ScheduleRefreshed(result) => {
                self.on_schedule_refreshed(result, Utc::now()).await
            }
            ChannelEvent::PlayerEnded { entry } => self.on_natural_completion(entry).await,
            ChannelEvent::Shutdown => {
                info!("ChannelCore: shutdown requested");
                self.cancel.cancel();
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command, now: DateTime<Utc>) {
        match cmd {
            Command::TogglePause => self.toggle_pause(now).await,
            Command::ToggleFullscreen => self.toggle_fullscreen().await,
            Command::RetrySchedule => self.retry_schedule().await,
            Command::Resync => self.resync_at(now).await,
            Command::GetState => {
                // Answered by the socket server from the shared state
            }
        }
    }

    // ── schedule ──────────────────────────────────────────────────────────────

    fn request_refresh(&mut self) {
        if self.refresh_in_flight {
            debug!("ChannelCore: refresh already in flight, dropping request");
            return;
        }
        self.refresh_in_flight = true;

        let fetcher = Arc::clone(&self.fetcher);
        let resolver = Arc::clone(&self.resolver);
        let store = Arc::clone(&self.store);
        let tx = self.event_tx.clone();
        let token = self.cancel.child_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                r = refresh_schedule(&fetcher, &resolver, &store, Utc::now()) => r,
            };
            let _ = tx.send(ChannelEvent::ScheduleRefreshed(result)).await;
        });
    }

    async fn retry_schedule(&mut self) {
        if self.playlist.is_none() {
            self.state_manager.set_schedule(ScheduleStatus::Loading).await;
            self.publish();
        }
        self.request_refresh();
    }

    async fn on_schedule_refreshed(
        &mut self,
        result: Result<Refreshed, ChannelError>,
        now: DateTime<Utc>,
    ) {
        self.refresh_in_flight = false;

        match result {
            Ok(refreshed) => {
                let total = refreshed.playlist.total_duration_secs();
                info!(
                    "ChannelCore: schedule ready: {} programs, {}s cycle, {:?}",
                    refreshed.playlist.len(),
                    total,
                    refreshed.origin
                );
                self.state_manager
                    .set_schedule(ScheduleStatus::Ready {
                        fetched_at: refreshed.fetched_at,
                        items: refreshed.playlist.len(),
                        total_duration_secs: total,
                        origin: refreshed.origin,
                    })
                    .await;
                self.playlist = Some(refreshed.playlist);
                self.publish();
                self.resync_at(now).await;
            }
            Err(e) if self.playlist.is_some() => {
                warn!("ChannelCore: refresh failed, keeping current schedule: {}", e);
            }
            Err(e) => {
                warn!("ChannelCore: {}", e);
                let reason = e.to_string();
                self.state_manager
                    .set_schedule(ScheduleStatus::Unavailable {
                        reason: reason.clone(),
                    })
                    .await;
                let _ = self.broadcast_tx.send(BroadcastMessage::Error(reason));
                self.publish();
            }
        }
    }

    fn live_at(&self, now: DateTime<Utc>) -> Option<ActiveShow> {
        self.playlist
            .as_ref()
            .and_then(|p| compute_active(p, &now, &self.zone))
    }

    // ── playback ──────────────────────────────────────────────────────────────

    /// Switch to the live slot if it differs from what is loaded.  Never
    /// reseeks within the same slot.
    async fn resync_at(&mut self, now: DateTime<Utc>) {
        if matches!(self.phase, PlaybackPhase::Paused | PlaybackPhase::Loading) {
            return;
        }
        let Some(live) = self.live_at(now) else {
            return;
        };

        if let Some(done) = self.finished.clone() {
            if done.same_slot(&live) {
                if self.phase == PlaybackPhase::Idle {
                    // The advance past it failed earlier.
                    self.advance_past(done).await;
                }
                return;
            }
            self.finished = None;
        }

        let unchanged = self
            .current
            .as_ref()
            .is_some_and(|cur| cur.same_slot(&live));
        if self.phase == PlaybackPhase::Playing && unchanged {
            return;
        }

        info!(
            "ChannelCore: live slot is #{} {} @{}s",
            live.index, live.item.name, live.offset_secs
        );
        self.start(live).await;
    }

    /// Load and play `show`.  On failure the previous phase and descriptor
    /// are restored; the next tick retries.  Returns whether it is on air.
    async fn start(&mut self, show: ActiveShow) -> bool {
        let prior_phase = self.phase;
        let prior_show = self.current.clone();

        self.phase = PlaybackPhase::Loading;
        self.state_manager
            .set_on_air(Some(show.clone()), PlaybackPhase::Loading)
            .await;
        self.publish();

        let player = Arc::clone(&self.player);
        let result = async {
            let entry = player.load(&show.item.source_ref, show.offset_secs).await?;
            player.play().await?;
            anyhow::Ok(entry)
        }
        .await;

        match result {
            Ok(entry) => {
                info!(
                    "ChannelCore: on air #{} {} from {}s",
                    show.index, show.item.name, show.offset_secs
                );
                self.phase = PlaybackPhase::Playing;
                self.current = Some(show.clone());
                self.loaded_entry = entry;
                self.state_manager
                    .set_on_air(Some(show), PlaybackPhase::Playing)
                    .await;
                self.publish();
                true
            }
            Err(e) => {
                self.phase = prior_phase;
                self.current = prior_show.clone();
                self.state_manager.set_on_air(prior_show, prior_phase).await;
                self.playback_failed(&show.item.name, e).await;
                false
            }
        }
    }

    async fn playback_failed(&mut self, what: &str, e: anyhow::Error) {
        let err = ChannelError::PlaybackFailed(format!("{}: {}", what, e));
        warn!("ChannelCore: {}", err);
        self.state_manager.set_last_error(Some(err.to_string())).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::Error(err.to_string()));
        self.publish();
    }

    /// The player reached the end of entry `entry`.  Ends of entries other
    /// than the loaded one are leftovers of a replaced file.
    async fn on_natural_completion(&mut self, entry: Option<u64>) {
        if self.phase != PlaybackPhase::Playing {
            debug!("ChannelCore: end-of-file while {:?}, ignoring", self.phase);
            return;
        }
        if let (Some(ended), Some(loaded)) = (entry, self.loaded_entry) {
            if ended != loaded {
                debug!(
                    "ChannelCore: end-of-file for entry {} while {} is loaded, ignoring",
                    ended, loaded
                );
                return;
            }
        }
        let Some(done) = self.current.clone() else {
            return;
        };
        self.advance_past(done).await;
    }

    /// Start the item after `done` from its beginning.  If that fails the
    /// player has nothing loaded, so the phase drops to `Idle` and the next
    /// resync tick tries again.
    async fn advance_past(&mut self, done: ActiveShow) {
        let Some(next) = self.playlist.as_ref().and_then(|p| next_show(p, done.index)) else {
            return;
        };

        info!(
            "ChannelCore: {} finished, advancing to #{} {}",
            done.item.name, next.index, next.item.name
        );
        let started = self.start(next).await;
        self.finished = Some(done);
        if !started {
            self.phase = PlaybackPhase::Idle;
            self.current = None;
            self.loaded_entry = None;
            self.state_manager
                .set_on_air(None, PlaybackPhase::Idle)
                .await;
            self.publish();
        }
    }

    async fn toggle_pause(&mut self, now: DateTime<Utc>) {
        match self.phase {
            PlaybackPhase::Playing => match self.player.pause().await {
                Ok(()) => {
                    self.phase = PlaybackPhase::Paused;
                    self.state_manager.set_phase(PlaybackPhase::Paused).await;
                    self.publish();
                }
                Err(e) => self.playback_failed("pause", e).await,
            },
            PlaybackPhase::Paused => self.resume(now).await,
            PlaybackPhase::Idle => self.resync_at(now).await,
            PlaybackPhase::Loading => debug!("ChannelCore: toggle ignored while loading"),
        }
    }

    async fn resume(&mut self, now: DateTime<Utc>) {
        if let Err(e) = self.player.play().await {
            self.playback_failed("resume", e).await;
            return;
        }
        self.phase = PlaybackPhase::Playing;
        self.state_manager.set_phase(PlaybackPhase::Playing).await;
        self.publish();

        if self.resume_policy == ResumePolicy::SnapToLive {
            self.snap_to_live(now).await;
        }
    }

    /// Seek within the loaded slot, or switch if the schedule moved on.
    async fn snap_to_live(&mut self, now: DateTime<Utc>) {
        let Some(live) = self.live_at(now) else {
            return;
        };
        let same_slot = self
            .current
            .as_ref()
            .is_some_and(|cur| cur.same_slot(&live));
        if !same_slot {
            self.start(live).await;
            return;
        }

        match self.player.seek(live.offset_secs).await {
            Ok(()) => {
                debug!("ChannelCore: snapped to live at {}s", live.offset_secs);
                self.current = Some(live.clone());
                self.state_manager
                    .set_on_air(Some(live), PlaybackPhase::Playing)
                    .await;
                self.publish();
            }
            Err(e) => self.playback_failed("seek", e).await,
        }
    }

    async fn toggle_fullscreen(&mut self) {
        let target = !self.fullscreen;
        match self.player.set_fullscreen(target).await {
            Ok(()) => {
                self.fullscreen = target;
                self.state_manager.set_fullscreen(target).await;
                self.publish();
            }
            Err(e) => self.playback_failed("fullscreen", e).await,
        }
    }

    async fn cleanup(&mut self) -> anyhow::Result<()> {
        info!("ChannelCore: stopping player");
        self.cancel.cancel();
        self.player.stop().await?;
        self.phase = PlaybackPhase::Idle;
        self.current = None;
        self.loaded_entry = None;
        self.state_manager
            .set_on_air(None, PlaybackPhase::Idle)
            .await;
        self.publish();
        Ok(())
    }
}
