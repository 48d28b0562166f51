use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::JoinError,
    events::{CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent},
    input::YoutubeDl,
    tracks::{PlayMode, TrackHandle},
    Songbird,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use super::{
    backend::{ConnectionId, GuildSignal, PlayerSignal, SessionId, SignalSender, VoiceBackend},
    track::Track,
};
use crate::error::BackendError;

/// How long a freshly started stream may take to produce audio before it is
/// reported as stuck.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

struct LiveStream {
    session: SessionId,
    handle: TrackHandle,
}

/// [`VoiceBackend`] that streams through songbird, with yt-dlp doing the
/// media extraction.
pub struct SongbirdBackend {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    ytdlp: &'static str,
    signals: SignalSender,
    streams: DashMap<GuildId, LiveStream>,
    next_id: AtomicU64,
}

impl SongbirdBackend {
    pub fn new(manager: Arc<Songbird>, http: reqwest::Client, ytdlp: &'static str, signals: SignalSender) -> Self {
        Self {
            manager,
            http,
            ytdlp,
            signals,
            streams: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn handle_for(&self, guild_id: GuildId, session: SessionId) -> Result<TrackHandle, BackendError> {
        match self.streams.get(&guild_id) {
            Some(live) if live.session == session => Ok(live.handle.clone()),
            _ => Err(BackendError::UnknownSession(session.0)),
        }
    }

    fn watch_for_stall(&self, guild_id: GuildId, session: SessionId, ready: Arc<AtomicBool>) {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STALL_TIMEOUT).await;
            if !ready.load(Ordering::SeqCst) {
                let _ = signals.send(GuildSignal { guild_id, signal: PlayerSignal::TrackStuck(session) });
            }
        });
    }
}

/// Forwards track events of one session to the player.
struct TrackSignal {
    guild_id: GuildId,
    session: SessionId,
    signals: SignalSender,
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl VoiceEventHandler for TrackSignal {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::Track(states) = ctx else {
            return None;
        };
        let Some((state, _)) = states.first() else {
            return None;
        };

        let signal = match &state.playing {
            PlayMode::Play => {
                self.ready.store(true, Ordering::SeqCst);
                PlayerSignal::TrackStarted(self.session)
            }
            PlayMode::End | PlayMode::Stop => PlayerSignal::TrackEnded(self.session),
            PlayMode::Errored(e) => PlayerSignal::TrackErrored { session: self.session, reason: format!("{:?}", e) },
            _ => return None,
        };
        let _ = self.signals.send(GuildSignal { guild_id: self.guild_id, signal });
        None
    }
}

/// Marks a session as producing audio.
struct PlayableMarker(Arc<AtomicBool>);

#[async_trait]
impl VoiceEventHandler for PlayableMarker {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        self.0.store(true, Ordering::SeqCst);
        None
    }
}

/// Forwards driver connection changes of one connection to the player.
struct ConnectionSignal {
    guild_id: GuildId,
    connection: ConnectionId,
    signals: SignalSender,
}

#[async_trait]
impl VoiceEventHandler for ConnectionSignal {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let signal = match ctx {
            EventContext::DriverDisconnect(_) => PlayerSignal::ConnectionLost(self.connection),
            EventContext::DriverConnect(_) | EventContext::DriverReconnect(_) => {
                PlayerSignal::ConnectionRestored(self.connection)
            }
            _ => return None,
        };
        let _ = self.signals.send(GuildSignal { guild_id: self.guild_id, signal });
        None
    }
}

#[async_trait]
impl VoiceBackend for SongbirdBackend {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<ConnectionId, BackendError> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let connection = ConnectionId(self.next_id());
        let mut call = call.lock().await;
        // Handlers of an earlier connection would report under a stale id.
        call.remove_all_global_events();
        for event in [CoreEvent::DriverDisconnect, CoreEvent::DriverConnect, CoreEvent::DriverReconnect] {
            call.add_global_event(
                Event::Core(event),
                ConnectionSignal { guild_id, connection, signals: self.signals.clone() },
            );
        }

        info!("🔗 Joined voice channel {} in guild {} ({})", channel_id, guild_id, connection);
        Ok(connection)
    }

    async fn stream(&self, guild_id: GuildId, track: &Track, volume: u8) -> Result<SessionId, BackendError> {
        let call = self.manager.get(guild_id).ok_or(BackendError::NotConnected)?;
        let session = SessionId(self.next_id());
        let input = YoutubeDl::new_ytdl_like(self.ytdlp, self.http.clone(), track.url.clone());
        let ready = Arc::new(AtomicBool::new(false));

        let handle = {
            let mut call = call.lock().await;
            call.stop();
            call.play_input(input.into())
        };

        handle
            .set_volume(f32::from(volume) / 100.0)
            .map_err(|e| BackendError::Stream(e.to_string()))?;
        for event in [TrackEvent::Play, TrackEvent::End, TrackEvent::Error] {
            let signal = TrackSignal {
                guild_id,
                session,
                signals: self.signals.clone(),
                ready: ready.clone(),
            };
            handle
                .add_event(Event::Track(event), signal)
                .map_err(|e| BackendError::Stream(e.to_string()))?;
        }
        handle
            .add_event(Event::Track(TrackEvent::Playable), PlayableMarker(ready.clone()))
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        self.streams.insert(guild_id, LiveStream { session, handle });
        self.watch_for_stall(guild_id, session, ready);
        debug!("Guild {}: streaming {} as {}", guild_id, track.url, session);
        Ok(session)
    }

    async fn pause(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError> {
        self.handle_for(guild_id, session)?
            .pause()
            .map_err(|e| BackendError::Stream(e.to_string()))
    }

    async fn resume(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError> {
        self.handle_for(guild_id, session)?
            .play()
            .map_err(|e| BackendError::Stream(e.to_string()))
    }

    async fn stop(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError> {
        let handle = self.handle_for(guild_id, session)?;
        self.streams.remove_if(&guild_id, |_, live| live.session == session);
        handle.stop().map_err(|e| BackendError::Stream(e.to_string()))
    }

    async fn set_volume(&self, guild_id: GuildId, session: SessionId, volume: u8) -> Result<(), BackendError> {
        self.handle_for(guild_id, session)?
            .set_volume(f32::from(volume) / 100.0)
            .map_err(|e| BackendError::Stream(e.to_string()))
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), BackendError> {
        self.streams.remove(&guild_id);
        match self.manager.remove(guild_id).await {
            Ok(()) | Err(JoinError::NoCall) => Ok(()),
            Err(e) => {
                warn!("Guild {}: leaving voice failed: {}", guild_id, e);
                Err(BackendError::Connect(e.to_string()))
            }
        }
    }
}
