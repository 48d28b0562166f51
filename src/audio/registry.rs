use dashmap::DashMap;
use futures::future::join_all;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, MutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info};

use super::{
    backend::{ConnectionId, GuildSignal, PlayerSignal, SessionId, SignalReceiver, SignalSender, VoiceBackend},
    history::HistoryRecorder,
    player::{Disposition, GuildPlayer, PlayerState, PlayerTimings},
    queue::{GuildQueue, LoopMode, QueuePage},
    track::Track,
};
use crate::{
    error::MusicError,
    sources::{Resolved, TrackResolver},
    storage::{GuildSettings, SettingsStore},
};

type PlayerMap = Arc<DashMap<GuildId, Arc<GuildSlot>>>;

/// One guild's player plus the mailbox that feeds it signals in order.
pub struct GuildSlot {
    player: Mutex<GuildPlayer>,
    live_session: Arc<AtomicU64>,
    live_connection: Arc<AtomicU64>,
    mailbox: mpsc::UnboundedSender<PlayerSignal>,
}

impl GuildSlot {
    pub async fn lock(&self) -> MutexGuard<'_, GuildPlayer> {
        self.player.lock().await
    }

    /// Session streaming right now, readable without waiting for the lock.
    pub fn live_session(&self) -> Option<SessionId> {
        match self.live_session.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(SessionId(raw)),
        }
    }

    /// Voice connection held right now, readable without waiting for the lock.
    pub fn live_connection(&self) -> Option<ConnectionId> {
        match self.live_connection.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(ConnectionId(raw)),
        }
    }
}

/// Snapshot of a guild's playback for display.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub channel_id: Option<ChannelId>,
    pub now_playing: Option<Track>,
    pub queue_len: usize,
    pub queue_duration: Duration,
    pub loop_mode: LoopMode,
    pub volume: u8,
}

struct RegistryInner {
    players: PlayerMap,
    backend: Arc<dyn VoiceBackend>,
    resolver: Arc<TrackResolver>,
    history: HistoryRecorder,
    settings: Arc<dyn SettingsStore>,
    signals: SignalSender,
    timings: PlayerTimings,
}

/// Owns every guild player and is the command surface of the music core.
///
/// Guilds never share a lock. All work for one guild goes through that
/// guild's player mutex; backend and timer signals additionally pass through
/// a per-guild mailbox so they are handled in arrival order.
#[derive(Clone)]
pub struct PlayerRegistry {
    inner: Arc<RegistryInner>,
}

impl PlayerRegistry {
    pub fn new(
        backend: Arc<dyn VoiceBackend>,
        resolver: Arc<TrackResolver>,
        history: HistoryRecorder,
        settings: Arc<dyn SettingsStore>,
        timings: PlayerTimings,
        signals: SignalSender,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                players: Arc::new(DashMap::new()),
                backend,
                resolver,
                history,
                settings,
                signals,
                timings,
            }),
        }
    }

    /// Routes signals from the backend and from player timers to the guild
    /// mailboxes. Signals for guilds without a player are dropped.
    pub fn listen(&self, mut signals: SignalReceiver) -> JoinHandle<()> {
        let players = self.inner.players.clone();
        tokio::spawn(async move {
            while let Some(GuildSignal { guild_id, signal }) = signals.recv().await {
                match players.get(&guild_id) {
                    Some(slot) => {
                        let _ = slot.mailbox.send(signal);
                    }
                    None => debug!("Guild {}: no player for {:?}", guild_id, signal),
                }
            }
            debug!("Signal dispatcher stopped");
        })
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildSlot>> {
        self.inner.players.get(&guild_id).map(|slot| slot.clone())
    }

    /// At most one player per guild exists even when called concurrently.
    pub async fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildSlot> {
        if let Some(slot) = self.get(guild_id) {
            return slot;
        }

        let settings = self.inner.settings.guild_settings(guild_id).await;
        self.inner
            .players
            .entry(guild_id)
            .or_insert_with(|| self.spawn_slot(guild_id, &settings))
            .clone()
    }

    /// Shuts the guild's player down and forgets it.
    pub async fn remove(&self, guild_id: GuildId) -> bool {
        let Some(slot) = self.get(guild_id) else {
            return false;
        };
        slot.lock().await.shutdown().await;
        remove_slot(&self.inner.players, guild_id, &slot);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.players.is_empty()
    }

    /// Resolves `query` and queues the result, connecting to `channel_id`
    /// first when needed.
    ///
    /// Resolution happens before any player is touched, so `NotFound` and
    /// resolver errors leave the guild exactly as it was.
    pub async fn play(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        query: &str,
        requester: Option<UserId>,
    ) -> Result<Resolved, MusicError> {
        let resolved = self.inner.resolver.resolve(query, requester).await?;
        if resolved == Resolved::NotFound {
            return Ok(Resolved::NotFound);
        }
        let tracks = resolved.clone().into_tracks();

        loop {
            let slot = self.get_or_create(guild_id).await;
            let mut player = slot.lock().await;
            if player.is_closed() {
                // Lost a race with stop or idle teardown; start over with a fresh player.
                drop(player);
                remove_slot(&self.inner.players, guild_id, &slot);
                continue;
            }

            let result = player.play(channel_id, tracks.clone()).await;
            let disposable = player.is_disposable();
            drop(player);
            if disposable {
                remove_slot(&self.inner.players, guild_id, &slot);
            }

            let added = result?;
            return Ok(match resolved {
                Resolved::Playlist(_) => Resolved::Playlist(added),
                other => other,
            });
        }
    }

    pub async fn pause(&self, guild_id: GuildId) -> bool {
        match self.get(guild_id) {
            Some(slot) => slot.lock().await.pause().await,
            None => false,
        }
    }

    pub async fn resume(&self, guild_id: GuildId) -> bool {
        match self.get(guild_id) {
            Some(slot) => slot.lock().await.resume().await,
            None => false,
        }
    }

    /// Skips the track that was playing when the command arrived.
    pub async fn skip(&self, guild_id: GuildId) -> bool {
        let Some(slot) = self.get(guild_id) else {
            return false;
        };
        let expected = slot.live_session();
        let skipped = slot.lock().await.skip(expected).await;
        skipped
    }

    pub async fn stop(&self, guild_id: GuildId) -> bool {
        let stopped = self.remove(guild_id).await;
        if stopped {
            info!("⏹️ Guild {}: stopped by command", guild_id);
        }
        stopped
    }

    /// Stops the player after someone else disconnected the bot from
    /// `channel_id`.
    ///
    /// Only the connection that existed when the event arrived is affected;
    /// a player that is still connecting, or has connected again since, is
    /// left alone.
    pub async fn voice_disconnected(&self, guild_id: GuildId, channel_id: Option<ChannelId>) -> bool {
        let Some(slot) = self.get(guild_id) else {
            return false;
        };
        let Some(connection) = slot.live_connection() else {
            return false;
        };

        let mut player = slot.lock().await;
        if player.connection() != Some(connection) || player.channel_id() != channel_id {
            debug!("Guild {}: voice leave for an older connection ignored", guild_id);
            return false;
        }
        player.shutdown().await;
        drop(player);
        remove_slot(&self.inner.players, guild_id, &slot);
        true
    }

    pub async fn queue_size(&self, guild_id: GuildId) -> usize {
        self.read(guild_id, |p| p.queue().len()).await.unwrap_or(0)
    }

    /// Total duration of the tracks still waiting; the current one is excluded.
    pub async fn queue_duration(&self, guild_id: GuildId) -> Duration {
        self.read(guild_id, |p| p.queue().total_duration()).await.unwrap_or_default()
    }

    pub async fn now_playing(&self, guild_id: GuildId) -> Option<Track> {
        self.read(guild_id, |p| p.now_playing().cloned()).await.flatten()
    }

    pub async fn loop_mode(&self, guild_id: GuildId) -> LoopMode {
        self.read(guild_id, |p| p.queue().loop_mode()).await.unwrap_or_default()
    }

    pub async fn volume(&self, guild_id: GuildId) -> Option<u8> {
        self.read(guild_id, |p| p.queue().volume()).await
    }

    pub async fn status(&self, guild_id: GuildId) -> Option<PlayerStatus> {
        self.read(guild_id, |p| PlayerStatus {
            state: p.state(),
            channel_id: p.channel_id(),
            now_playing: p.now_playing().cloned(),
            queue_len: p.queue().len(),
            queue_duration: p.queue().total_duration(),
            loop_mode: p.queue().loop_mode(),
            volume: p.queue().volume(),
        })
        .await
    }

    pub async fn paginated_tracks(&self, guild_id: GuildId, page: usize, per_page: usize) -> QueuePage {
        self.read(guild_id, |p| p.queue().paginate(page, per_page))
            .await
            .unwrap_or_else(QueuePage::empty)
    }

    /// `None` when the guild has no player.
    pub async fn set_volume(&self, guild_id: GuildId, level: i64) -> Option<u8> {
        let slot = self.get(guild_id)?;
        let volume = slot.lock().await.set_volume(level).await;
        Some(volume)
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> bool {
        self.write(guild_id, |p| p.set_loop_mode(mode)).await.is_some()
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> bool {
        self.write(guild_id, |p| p.shuffle()).await.is_some()
    }

    /// Removes the 1-based `position` from the pending tracks.
    pub async fn remove_track(&self, guild_id: GuildId, position: usize) -> Option<Track> {
        self.write(guild_id, |p| p.remove_track(position)).await.flatten()
    }

    /// Pushes changed guild settings into a running player.
    pub async fn apply_settings(&self, settings: &GuildSettings) {
        let Some(slot) = self.get(GuildId::new(settings.guild_id)) else {
            return;
        };
        let mut player = slot.lock().await;
        player.set_timings(self.timings_for(settings));
        player.set_max_queue_size(settings.max_queue_size);
        player.set_max_track_duration(settings.track_duration_limit());
        player.set_volume_limit(settings.volume_limit).await;
    }

    /// Stops every player, e.g. on process shutdown.
    pub async fn shutdown(&self) {
        let slots: Vec<(GuildId, Arc<GuildSlot>)> = self
            .inner
            .players
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        info!("🛑 Stopping {} player(s)", slots.len());
        join_all(slots.iter().map(|(guild_id, slot)| async move {
            slot.lock().await.shutdown().await;
            remove_slot(&self.inner.players, *guild_id, slot);
        }))
        .await;
    }

    async fn read<T>(&self, guild_id: GuildId, f: impl FnOnce(&GuildPlayer) -> T) -> Option<T> {
        let slot = self.get(guild_id)?;
        let player = slot.lock().await;
        Some(f(&player))
    }

    async fn write<T>(&self, guild_id: GuildId, f: impl FnOnce(&mut GuildPlayer) -> T) -> Option<T> {
        let slot = self.get(guild_id)?;
        let mut player = slot.lock().await;
        Some(f(&mut player))
    }

    fn timings_for(&self, settings: &GuildSettings) -> PlayerTimings {
        PlayerTimings {
            idle_timeout: (settings.auto_leave_timeout > 0).then(|| Duration::from_secs(settings.auto_leave_timeout)),
            ..self.inner.timings
        }
    }

    fn spawn_slot(&self, guild_id: GuildId, settings: &GuildSettings) -> Arc<GuildSlot> {
        let mut queue = GuildQueue::new(settings.max_queue_size, settings.default_volume);
        queue.set_volume_limit(settings.volume_limit);
        let mut player = GuildPlayer::new(
            guild_id,
            queue,
            self.inner.backend.clone(),
            self.inner.history.clone(),
            self.inner.signals.clone(),
            self.timings_for(settings),
        );
        player.set_max_track_duration(settings.track_duration_limit());
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let slot = Arc::new(GuildSlot {
            live_session: player.live_session(),
            live_connection: player.live_connection(),
            player: Mutex::new(player),
            mailbox,
        });

        tokio::spawn(run_mailbox(
            guild_id,
            Arc::downgrade(&slot),
            inbox,
            self.inner.players.clone(),
        ));
        debug!("Guild {}: player created", guild_id);
        slot
    }
}

/// Applies signals to one guild's player in arrival order.
///
/// Ends once the slot is dropped, which closes the mailbox.
async fn run_mailbox(
    guild_id: GuildId,
    slot: Weak<GuildSlot>,
    mut inbox: mpsc::UnboundedReceiver<PlayerSignal>,
    players: PlayerMap,
) {
    while let Some(signal) = inbox.recv().await {
        let Some(slot) = slot.upgrade() else {
            break;
        };
        let disposition = slot.lock().await.handle_signal(signal).await;
        if disposition == Disposition::Teardown {
            remove_slot(&players, guild_id, &slot);
        }
    }
    debug!("Guild {}: mailbox closed", guild_id);
}

/// Removes the entry only if it still holds this very slot; a newer player
/// for the same guild is left alone.
fn remove_slot(players: &PlayerMap, guild_id: GuildId, slot: &Arc<GuildSlot>) {
    if players.remove_if(&guild_id, |_, current| Arc::ptr_eq(current, slot)).is_some() {
        info!("🧹 Guild {}: player removed", guild_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::test_support::{BackendCall, FakeBackend, StaticSettings},
        error::ResolveError,
        sources::{ResolverOptions, SearchBackend, TrackMetadata},
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(1);
    const OTHER_GUILD: GuildId = GuildId::new(2);
    const CHANNEL: ChannelId = ChannelId::new(100);

    /// Every query finds a track titled like the query, except "missing".
    struct EchoSearch;

    #[async_trait]
    impl SearchBackend for EchoSearch {
        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<TrackMetadata>, ResolveError> {
            if query == "missing" {
                return Ok(Vec::new());
            }
            Ok(vec![TrackMetadata {
                title: query.to_string(),
                url: Some(format!("https://youtu.be/{}", query)),
                duration: Some(Duration::from_secs(60)),
                ..TrackMetadata::default()
            }])
        }

        async fn resolve_playlist(&self, _url: &str, _limit: usize) -> Result<Vec<TrackMetadata>, ResolveError> {
            Ok(Vec::new())
        }
    }

    fn registry_with(backend: Arc<FakeBackend>, settings: GuildSettings) -> PlayerRegistry {
        let (signals, rx) = crate::audio::backend::signal_channel();
        let resolver = TrackResolver::new(
            Arc::new(EchoSearch),
            None,
            ResolverOptions { cache_capacity: 0, ..ResolverOptions::default() },
        );
        let registry = PlayerRegistry::new(
            backend,
            Arc::new(resolver),
            HistoryRecorder::disabled(),
            Arc::new(StaticSettings(settings)),
            PlayerTimings::default(),
            signals,
        );
        registry.listen(rx);
        registry
    }

    fn registry(backend: Arc<FakeBackend>) -> PlayerRegistry {
        registry_with(backend, GuildSettings::default())
    }

    async fn queue_all(registry: &PlayerRegistry, titles: &[&str]) {
        for title in titles {
            registry.play(GUILD, CHANNEL, title, None).await.unwrap();
        }
    }

    /// Lets the dispatcher and mailbox tasks run.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn end_of(registry: &PlayerRegistry, session: SessionId) {
        registry
            .inner
            .signals
            .send(GuildSignal { guild_id: GUILD, signal: PlayerSignal::TrackEnded(session) })
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_player() {
        let registry = registry(FakeBackend::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(GUILD).await })
            })
            .collect();
        let slots: Vec<Arc<GuildSlot>> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

        assert!(slots.iter().all(|slot| Arc::ptr_eq(slot, &slots[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_play_reports_track_and_queues_the_rest() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());

        let first = registry.play(GUILD, CHANNEL, "a", Some(UserId::new(7))).await.unwrap();
        queue_all(&registry, &["b", "c"]).await;

        assert!(matches!(first, Resolved::Track(ref t) if t.title == "a"));
        assert_eq!(registry.now_playing(GUILD).await.map(|t| t.title), Some("a".to_string()));
        assert_eq!(registry.queue_size(GUILD).await, 2);
        assert_eq!(registry.queue_duration(GUILD).await, Duration::from_secs(120));
        assert_eq!(backend.streamed(GUILD), ["a"]);
    }

    #[tokio::test]
    async fn test_not_found_leaves_no_trace() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());

        let resolved = registry.play(GUILD, CHANNEL, "missing", None).await.unwrap();

        assert_eq!(resolved, Resolved::NotFound);
        assert!(registry.get(GUILD).is_none());
        assert!(backend.calls(GUILD).is_empty());
    }

    #[tokio::test]
    async fn test_not_found_does_not_touch_existing_queue() {
        let registry = registry(FakeBackend::new());
        queue_all(&registry, &["a", "b"]).await;

        registry.play(GUILD, CHANNEL, "missing", None).await.unwrap();

        assert_eq!(registry.queue_size(GUILD).await, 1);
        assert_eq!(registry.now_playing(GUILD).await.map(|t| t.title), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_player() {
        let backend = FakeBackend::new();
        backend.refuse_connect(GUILD);
        let registry = registry(backend);

        let result = registry.play(GUILD, CHANNEL, "a", None).await;

        assert!(matches!(result, Err(MusicError::Connection(_))));
        assert!(registry.get(GUILD).is_none());
    }

    #[tokio::test]
    async fn test_skip_racing_natural_end_advances_once() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a", "b", "c"]).await;
        let slot = registry.get(GUILD).unwrap();
        let first = slot.live_session().unwrap();

        // Hold the player so the end signal and the skip both have to wait.
        let guard = slot.lock().await;
        end_of(&registry, first);
        settle().await;
        let skip = tokio::spawn({
            let registry = registry.clone();
            async move { registry.skip(GUILD).await }
        });
        settle().await;
        drop(guard);

        assert!(skip.await.unwrap());
        settle().await;
        assert_eq!(backend.streamed(GUILD), ["a", "b"]);
        assert_eq!(registry.queue_size(GUILD).await, 1);
    }

    #[tokio::test]
    async fn test_double_skip_advances_once() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a", "b", "c"]).await;
        let slot = registry.get(GUILD).unwrap();

        let guard = slot.lock().await;
        let skips: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.skip(GUILD).await })
            })
            .collect();
        settle().await;
        drop(guard);

        for skip in skips {
            assert!(skip.await.unwrap());
        }
        assert_eq!(backend.streamed(GUILD), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_end_signal_through_dispatcher_advances() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a", "b"]).await;
        let first = registry.get(GUILD).unwrap().live_session().unwrap();

        end_of(&registry, first);
        settle().await;

        assert_eq!(registry.now_playing(GUILD).await.map(|t| t.title), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_stop_disconnects_and_removes() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a", "b"]).await;

        assert!(registry.stop(GUILD).await);

        assert!(registry.get(GUILD).is_none());
        assert!(backend.calls(GUILD).contains(&BackendCall::Disconnect));
        assert!(!registry.stop(GUILD).await);
        assert_eq!(registry.queue_size(GUILD).await, 0);
    }

    #[tokio::test]
    async fn test_play_after_stop_starts_fresh() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a", "b"]).await;
        registry.stop(GUILD).await;

        registry.play(GUILD, CHANNEL, "c", None).await.unwrap();

        assert_eq!(registry.now_playing(GUILD).await.map(|t| t.title), Some("c".to_string()));
        assert_eq!(registry.queue_size(GUILD).await, 0);
        assert_eq!(backend.count(GUILD, |c| matches!(c, BackendCall::Connect(_))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_removes_player() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a"]).await;
        let first = registry.get(GUILD).unwrap().live_session().unwrap();

        end_of(&registry, first);
        settle().await;
        assert_eq!(registry.status(GUILD).await.map(|s| s.state), Some(PlayerState::Idle));

        tokio::time::sleep(Duration::from_secs(301)).await;
        settle().await;

        assert!(registry.get(GUILD).is_none());
        assert!(backend.calls(GUILD).contains(&BackendCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_auto_leave_keeps_idle_player() {
        let backend = FakeBackend::new();
        let settings = GuildSettings { auto_leave_timeout: 0, ..GuildSettings::default() };
        let registry = registry_with(backend.clone(), settings);
        queue_all(&registry, &["a"]).await;
        let first = registry.get(GUILD).unwrap().live_session().unwrap();

        end_of(&registry, first);
        settle().await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        settle().await;

        assert_eq!(registry.status(GUILD).await.map(|s| s.state), Some(PlayerState::Idle));
        assert!(!backend.calls(GUILD).contains(&BackendCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_guild_does_not_block_others() {
        let backend = FakeBackend::new();
        backend.delay_connect(GUILD, Duration::from_secs(10));
        let registry = registry(backend.clone());

        let slow = tokio::spawn({
            let registry = registry.clone();
            async move { registry.play(GUILD, CHANNEL, "slow", None).await }
        });
        settle().await;

        let started = tokio::time::Instant::now();
        registry.play(OTHER_GUILD, CHANNEL, "fast", None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(backend.streamed(OTHER_GUILD), ["fast"]);

        slow.await.unwrap().unwrap();
        assert_eq!(backend.streamed(GUILD), ["slow"]);
    }

    #[tokio::test]
    async fn test_commands_without_player() {
        let registry = registry(FakeBackend::new());

        assert!(!registry.pause(GUILD).await);
        assert!(!registry.resume(GUILD).await);
        assert!(!registry.skip(GUILD).await);
        assert!(!registry.shuffle(GUILD).await);
        assert_eq!(registry.volume(GUILD).await, None);
        assert_eq!(registry.set_volume(GUILD, 80).await, None);
        assert_eq!(registry.loop_mode(GUILD).await, LoopMode::Off);
        assert_eq!(registry.paginated_tracks(GUILD, 1, 10).await, QueuePage::empty());
        assert!(registry.get(GUILD).is_none());
    }

    #[tokio::test]
    async fn test_settings_shape_new_players() {
        let settings = GuildSettings {
            default_volume: 30,
            max_queue_size: 1,
            volume_limit: 25,
            ..GuildSettings::default()
        };
        let registry = registry_with(FakeBackend::new(), settings);
        queue_all(&registry, &["a", "b"]).await;

        let result = registry.play(GUILD, CHANNEL, "c", None).await;

        assert!(matches!(result, Err(MusicError::QueueFull(1))));
        assert_eq!(registry.volume(GUILD).await, Some(25));
        assert_eq!(registry.set_volume(GUILD, 80).await, Some(25));
    }

    #[tokio::test]
    async fn test_apply_settings_updates_running_player() {
        let registry = registry(FakeBackend::new());
        queue_all(&registry, &["a"]).await;

        let settings = GuildSettings {
            guild_id: GUILD.get(),
            max_track_duration: 30,
            volume_limit: 10,
            ..GuildSettings::default()
        };
        registry.apply_settings(&settings).await;

        assert_eq!(registry.volume(GUILD).await, Some(10));
        // EchoSearch tracks last 60s.
        let result = registry.play(GUILD, CHANNEL, "b", None).await;
        assert!(matches!(result, Err(MusicError::TrackTooLong(30))));
        assert_eq!(registry.queue_size(GUILD).await, 0);
    }

    #[tokio::test]
    async fn test_voice_disconnect_stops_player_in_that_channel() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a"]).await;

        assert!(!registry.voice_disconnected(GUILD, Some(ChannelId::new(999))).await);
        assert!(registry.get(GUILD).is_some());

        assert!(registry.voice_disconnected(GUILD, Some(CHANNEL)).await);
        assert!(registry.get(GUILD).is_none());
        assert!(backend.calls(GUILD).contains(&BackendCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_voice_leave_spares_new_connection() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a"]).await;
        registry.stop(GUILD).await;

        backend.delay_connect(GUILD, Duration::from_secs(5));
        let replay = tokio::spawn({
            let registry = registry.clone();
            async move { registry.play(GUILD, CHANNEL, "b", None).await }
        });
        settle().await;

        // The leave event of the stopped connection shows up while the new
        // player is still connecting to the same channel.
        let leave = tokio::spawn({
            let registry = registry.clone();
            async move { registry.voice_disconnected(GUILD, Some(CHANNEL)).await }
        });
        settle().await;

        replay.await.unwrap().unwrap();
        assert!(!leave.await.unwrap());
        assert_eq!(registry.now_playing(GUILD).await.map(|t| t.title), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_remove_track_and_loop_mode() {
        let registry = registry(FakeBackend::new());
        queue_all(&registry, &["a", "b", "c"]).await;

        assert_eq!(registry.remove_track(GUILD, 3).await, None);
        assert_eq!(registry.remove_track(GUILD, 1).await.map(|t| t.title), Some("b".to_string()));
        assert!(registry.set_loop_mode(GUILD, LoopMode::Queue).await);
        assert_eq!(registry.loop_mode(GUILD).await, LoopMode::Queue);

        let page = registry.paginated_tracks(GUILD, 1, 10).await;
        assert_eq!(page.total_tracks, 1);
        assert_eq!(page.tracks[0].title, "c");
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_guild() {
        let backend = FakeBackend::new();
        let registry = registry(backend.clone());
        queue_all(&registry, &["a"]).await;
        registry.play(OTHER_GUILD, CHANNEL, "b", None).await.unwrap();

        registry.shutdown().await;

        assert!(registry.is_empty());
        assert!(backend.calls(GUILD).contains(&BackendCall::Disconnect));
        assert!(backend.calls(OTHER_GUILD).contains(&BackendCall::Disconnect));
    }
}
