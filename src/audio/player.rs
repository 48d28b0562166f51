use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    backend::{ConnectionId, GuildSignal, PlayerSignal, SessionId, SignalSender, VoiceBackend},
    history::HistoryRecorder,
    queue::{GuildQueue, LoopMode},
    track::Track,
};
use crate::error::{BackendError, MusicError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Disconnected,
    Connecting,
    /// Connected, nothing streaming.
    Idle,
    Playing(SessionId),
    Paused(SessionId),
}

impl PlayerState {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Playing(session) | Self::Paused(session) => Some(*session),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Playing(_) => "playing",
            Self::Paused(_) => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerTimings {
    pub connect_timeout: Duration,
    pub reconnect_grace: Duration,
    /// `None` keeps idle connections open forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for PlayerTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// What the owner of a player should do after a signal was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Teardown,
}

/// A pending timer that feeds a signal back into the player.
///
/// Dropping it cancels the timer task.
struct Deadline {
    epoch: u64,
    cancel: CancellationToken,
}

impl Deadline {
    fn is(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Playback state machine for a single guild.
///
/// Every method expects to be called with exclusive access; the registry
/// serializes commands and backend signals for a guild through one mutex.
pub struct GuildPlayer {
    guild_id: GuildId,
    state: PlayerState,
    queue: GuildQueue,
    channel_id: Option<ChannelId>,
    connection: Option<ConnectionId>,
    backend: Arc<dyn VoiceBackend>,
    history: HistoryRecorder,
    signals: SignalSender,
    timings: PlayerTimings,
    live_session: Arc<AtomicU64>,
    live_connection: Arc<AtomicU64>,
    /// Longer tracks are refused. `None` accepts any length.
    max_track_duration: Option<Duration>,
    timer_epoch: u64,
    idle_timer: Option<Deadline>,
    reconnect_timer: Option<Deadline>,
    closed: bool,
}

impl GuildPlayer {
    pub fn new(
        guild_id: GuildId,
        queue: GuildQueue,
        backend: Arc<dyn VoiceBackend>,
        history: HistoryRecorder,
        signals: SignalSender,
        timings: PlayerTimings,
    ) -> Self {
        Self {
            guild_id,
            state: PlayerState::Disconnected,
            queue,
            channel_id: None,
            connection: None,
            backend,
            history,
            signals,
            timings,
            live_session: Arc::new(AtomicU64::new(0)),
            live_connection: Arc::new(AtomicU64::new(0)),
            max_track_duration: None,
            timer_epoch: 0,
            idle_timer: None,
            reconnect_timer: None,
            closed: false,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn queue(&self) -> &GuildQueue {
        &self.queue
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel_id
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn now_playing(&self) -> Option<&Track> {
        self.state.session().and(self.queue.current())
    }

    /// Session id readable without holding the player lock. Zero means none.
    pub fn live_session(&self) -> Arc<AtomicU64> {
        self.live_session.clone()
    }

    /// Connection id readable without holding the player lock. Zero means none.
    pub fn live_connection(&self) -> Arc<AtomicU64> {
        self.live_connection.clone()
    }

    /// Shut down for good; the registry must drop it.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Disconnected with nothing queued: nothing worth keeping around.
    pub fn is_disposable(&self) -> bool {
        self.state == PlayerState::Disconnected && self.queue.is_empty()
    }

    pub fn set_timings(&mut self, timings: PlayerTimings) {
        self.timings = timings;
        if self.state == PlayerState::Idle {
            self.arm_idle_timer();
        }
    }

    pub fn set_max_queue_size(&mut self, max_size: usize) {
        self.queue.set_max_size(max_size);
    }

    pub fn set_max_track_duration(&mut self, limit: Option<Duration>) {
        self.max_track_duration = limit;
    }

    /// Lowers the live stream's volume as well when it was above `limit`.
    pub async fn set_volume_limit(&mut self, limit: u8) {
        let before = self.queue.volume();
        self.queue.set_volume_limit(limit);
        let volume = self.queue.volume();
        if volume == before {
            return;
        }
        if let Some(session) = self.state.session() {
            if let Err(e) = self.backend.set_volume(self.guild_id, session, volume).await {
                warn!("Guild {}: could not apply volume: {}", self.guild_id, e);
            }
        }
        info!("🔊 Guild {}: volume capped at {}%", self.guild_id, volume);
    }

    /// Connects if needed, queues `tracks` and starts playback unless
    /// something is already playing.
    ///
    /// Returns the tracks that were actually queued. Tracks over the length
    /// limit are left out, and a playlist larger than the free space is
    /// truncated.
    pub async fn play(&mut self, channel_id: ChannelId, mut tracks: Vec<Track>) -> Result<Vec<Track>, MusicError> {
        if tracks.is_empty() {
            return Ok(tracks);
        }

        if let Some(limit) = self.max_track_duration {
            tracks.retain(|track| track.duration <= limit);
            if tracks.is_empty() {
                return Err(MusicError::TrackTooLong(limit.as_secs()));
            }
        }

        let free = self.queue.free_slots();
        if free == 0 {
            return Err(MusicError::QueueFull(self.queue.max_size()));
        }
        tracks.truncate(free);

        if self.state == PlayerState::Disconnected {
            self.connect(channel_id).await?;
        }

        self.queue.enqueue_all(tracks.clone());
        info!("➕ Guild {}: queued {} track(s), {} pending", self.guild_id, tracks.len(), self.queue.len());

        match self.state {
            PlayerState::Idle => self.advance().await,
            PlayerState::Paused(session) => {
                if let Err(e) = self.backend.stop(self.guild_id, session).await {
                    warn!("Guild {}: could not stop paused {}: {}", self.guild_id, session, e);
                }
                self.drop_looping_track();
                self.advance().await;
            }
            _ => {}
        }

        Ok(tracks)
    }

    pub async fn pause(&mut self) -> bool {
        let PlayerState::Playing(session) = self.state else {
            return false;
        };

        match self.backend.pause(self.guild_id, session).await {
            Ok(()) => {
                self.set_state(PlayerState::Paused(session));
                info!("⏸️ Guild {}: paused", self.guild_id);
                true
            }
            Err(e) => {
                warn!("Guild {}: backend refused pause: {}", self.guild_id, e);
                false
            }
        }
    }

    pub async fn resume(&mut self) -> bool {
        let PlayerState::Paused(session) = self.state else {
            return false;
        };

        match self.backend.resume(self.guild_id, session).await {
            Ok(()) => {
                self.set_state(PlayerState::Playing(session));
                info!("▶️ Guild {}: resumed", self.guild_id);
                true
            }
            Err(e) => {
                warn!("Guild {}: backend refused resume: {}", self.guild_id, e);
                false
            }
        }
    }

    /// Ends the current stream and advances.
    ///
    /// `expected` is the session the caller saw before waiting for the lock.
    /// If playback already moved past it (the track ended on its own while the
    /// skip was queued) the skip is considered done and nothing else happens.
    pub async fn skip(&mut self, expected: Option<SessionId>) -> bool {
        let Some(session) = self.state.session() else {
            return false;
        };
        if expected.is_some_and(|seen| seen != session) {
            debug!("Guild {}: skip target already finished", self.guild_id);
            return true;
        }

        if let Err(e) = self.backend.stop(self.guild_id, session).await {
            warn!("Guild {}: could not stop {}: {}", self.guild_id, session, e);
        }
        // Skipping inside a track loop moves on instead of replaying.
        if self.queue.loop_mode() == LoopMode::Track {
            self.queue.drop_current();
        }

        info!("⏭️ Guild {}: skipped", self.guild_id);
        self.advance().await;
        true
    }

    /// Tears the connection down and forgets the queue. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }

        if let Some(session) = self.state.session() {
            if let Err(e) = self.backend.stop(self.guild_id, session).await {
                debug!("Guild {}: stop during shutdown failed: {}", self.guild_id, e);
            }
        }
        if self.connection.is_some() {
            self.set_connection(None);
            if let Err(e) = self.backend.disconnect(self.guild_id).await {
                warn!("Guild {}: disconnect failed: {}", self.guild_id, e);
            }
        }

        self.queue.clear();
        self.idle_timer = None;
        self.reconnect_timer = None;
        self.channel_id = None;
        self.set_state(PlayerState::Disconnected);
        self.closed = true;
        info!("⏹️ Guild {}: player shut down", self.guild_id);
    }

    /// Stores the clamped volume and pushes it to the live stream.
    pub async fn set_volume(&mut self, level: i64) -> u8 {
        let volume = self.queue.set_volume(level);
        if let Some(session) = self.state.session() {
            if let Err(e) = self.backend.set_volume(self.guild_id, session, volume).await {
                warn!("Guild {}: could not apply volume: {}", self.guild_id, e);
            }
        }
        info!("🔊 Guild {}: volume {}%", self.guild_id, volume);
        volume
    }

    pub fn shuffle(&mut self) {
        self.queue.shuffle();
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.queue.set_loop_mode(mode);
    }

    pub fn remove_track(&mut self, position: usize) -> Option<Track> {
        self.queue.remove_at(position)
    }

    /// Transition function for everything that arrives asynchronously.
    pub async fn handle_signal(&mut self, signal: PlayerSignal) -> Disposition {
        if self.closed {
            return Disposition::Keep;
        }

        match signal {
            PlayerSignal::TrackStarted(session) => {
                if self.is_current(session) {
                    debug!("Guild {}: {} started", self.guild_id, session);
                }
            }
            PlayerSignal::TrackEnded(session) => {
                if !self.is_current(session) {
                    debug!("Guild {}: ignoring end of stale {}", self.guild_id, session);
                    return Disposition::Keep;
                }
                debug!("Guild {}: {} finished", self.guild_id, session);
                self.advance().await;
            }
            PlayerSignal::TrackErrored { session, reason } => {
                if !self.is_current(session) {
                    return Disposition::Keep;
                }
                warn!("⚠️ Guild {}: stream failed ({}), moving on", self.guild_id, reason);
                self.drop_looping_track();
                self.advance().await;
            }
            PlayerSignal::TrackStuck(session) => {
                if !self.is_current(session) {
                    return Disposition::Keep;
                }
                warn!("⚠️ Guild {}: stream stuck, moving on", self.guild_id);
                if let Err(e) = self.backend.stop(self.guild_id, session).await {
                    debug!("Guild {}: stop of stuck stream failed: {}", self.guild_id, e);
                }
                self.drop_looping_track();
                self.advance().await;
            }
            PlayerSignal::ConnectionLost(connection) => {
                if self.connection != Some(connection) || self.reconnect_timer.is_some() {
                    return Disposition::Keep;
                }
                warn!(
                    "🔌 Guild {}: voice connection lost, waiting {:?} for recovery",
                    self.guild_id, self.timings.reconnect_grace
                );
                let deadline = self.schedule(self.timings.reconnect_grace, PlayerSignal::ReconnectDeadline);
                self.reconnect_timer = Some(deadline);
            }
            PlayerSignal::ConnectionRestored(connection) => {
                if self.connection == Some(connection) && self.reconnect_timer.take().is_some() {
                    info!("🔄 Guild {}: voice connection recovered", self.guild_id);
                }
            }
            PlayerSignal::IdleTimeout(epoch) => {
                let armed = self.idle_timer.as_ref().is_some_and(|t| t.is(epoch));
                if armed && self.state == PlayerState::Idle {
                    info!("💤 Guild {}: idle for too long, leaving voice", self.guild_id);
                    self.shutdown().await;
                    return Disposition::Teardown;
                }
            }
            PlayerSignal::ReconnectDeadline(epoch) => {
                if self.reconnect_timer.as_ref().is_some_and(|t| t.is(epoch)) {
                    warn!("🔌 Guild {}: voice connection did not recover", self.guild_id);
                    self.shutdown().await;
                    return Disposition::Teardown;
                }
            }
        }

        Disposition::Keep
    }

    async fn connect(&mut self, channel_id: ChannelId) -> Result<(), MusicError> {
        self.set_state(PlayerState::Connecting);
        info!("🔌 Guild {}: connecting to voice channel {}", self.guild_id, channel_id);

        let attempt = tokio::time::timeout(
            self.timings.connect_timeout,
            self.backend.connect(self.guild_id, channel_id),
        )
        .await;

        let error = match attempt {
            Ok(Ok(connection)) => {
                self.set_connection(Some(connection));
                self.channel_id = Some(channel_id);
                self.set_state(PlayerState::Idle);
                info!("🔊 Guild {}: connected ({})", self.guild_id, connection);
                return Ok(());
            }
            Ok(Err(BackendError::Unavailable(msg))) => MusicError::BackendUnavailable(msg),
            Ok(Err(e)) => MusicError::Connection(e.to_string()),
            Err(_) => MusicError::Connection(format!(
                "timed out after {}s",
                self.timings.connect_timeout.as_secs()
            )),
        };

        // Fail closed: drop whatever half-open call the backend may hold.
        if let Err(e) = self.backend.disconnect(self.guild_id).await {
            debug!("Guild {}: cleanup after failed connect: {}", self.guild_id, e);
        }
        self.set_connection(None);
        self.channel_id = None;
        self.set_state(PlayerState::Disconnected);
        warn!("❌ Guild {}: {}", self.guild_id, error);
        Err(error)
    }

    /// Dequeues and starts the next playable track, or goes idle.
    ///
    /// Tracks that fail to start are skipped; at most one full pass over the
    /// queue is attempted so a queue of broken tracks cannot spin forever.
    async fn advance(&mut self) {
        self.idle_timer = None;
        let mut attempts = self.queue.cycle_len().max(1);

        while attempts > 0 {
            attempts -= 1;
            let Some(track) = self.queue.dequeue_next() else {
                break;
            };

            match self.backend.stream(self.guild_id, &track, self.queue.volume()).await {
                Ok(session) => {
                    self.set_state(PlayerState::Playing(session));
                    info!("🎵 Guild {}: now playing {}", self.guild_id, track);
                    let _ = self.history.record(self.guild_id, track.requested_by, &track);
                    return;
                }
                Err(e) => {
                    warn!("⚠️ Guild {}: could not start '{}': {}", self.guild_id, track.title, e);
                    self.drop_looping_track();
                }
            }
        }

        self.queue.drop_current();
        self.set_state(PlayerState::Idle);
        info!("📭 Guild {}: queue finished", self.guild_id);
        self.arm_idle_timer();
    }

    fn drop_looping_track(&mut self) {
        if self.queue.loop_mode() == LoopMode::Track {
            self.queue.drop_current();
        }
    }

    fn arm_idle_timer(&mut self) {
        self.idle_timer = self
            .timings
            .idle_timeout
            .map(|after| self.schedule(after, PlayerSignal::IdleTimeout));
    }

    fn schedule(&mut self, after: Duration, signal: fn(u64) -> PlayerSignal) -> Deadline {
        self.timer_epoch += 1;
        let epoch = self.timer_epoch;
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let signals = self.signals.clone();
        let guild_id = self.guild_id;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = signals.send(GuildSignal { guild_id, signal: signal(epoch) });
                }
            }
        });

        Deadline { epoch, cancel }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.state.session() == Some(session)
    }

    fn set_connection(&mut self, connection: Option<ConnectionId>) {
        self.connection = connection;
        self.live_connection.store(connection.map_or(0, |c| c.0), Ordering::SeqCst);
    }

    fn set_state(&mut self, state: PlayerState) {
        self.state = state;
        let raw = state.session().map_or(0, |s| s.0);
        self.live_session.store(raw, Ordering::SeqCst);
    }
}
