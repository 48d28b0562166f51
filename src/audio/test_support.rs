//! In-memory stand-ins for the voice backend and guild settings.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{
    backend::{ConnectionId, SessionId, VoiceBackend},
    track::{Platform, Track},
};
use crate::{
    error::BackendError,
    storage::{GuildSettings, SettingsStore},
};

pub fn track(title: &str, secs: u64) -> Track {
    Track::new(
        title,
        format!("https://youtu.be/{}", title),
        Duration::from_secs(secs),
        Platform::YouTube,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Connect(ChannelId),
    Stream { title: String, session: Option<SessionId> },
    Pause(SessionId),
    Resume(SessionId),
    Stop(SessionId),
    SetVolume(SessionId, u8),
    Disconnect,
}

/// Records every call and hands out sequential ids starting at 1.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<(GuildId, BackendCall)>>,
    next_id: AtomicU64,
    connect_delays: Mutex<HashMap<GuildId, Duration>>,
    refused: Mutex<HashSet<GuildId>>,
    failing_urls: Mutex<HashSet<String>>,
    last_connection: Mutex<Option<ConnectionId>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay_connect(&self, guild_id: GuildId, delay: Duration) {
        self.connect_delays.lock().insert(guild_id, delay);
    }

    pub fn refuse_connect(&self, guild_id: GuildId) {
        self.refused.lock().insert(guild_id);
    }

    pub fn fail_stream(&self, url: &str) {
        self.failing_urls.lock().insert(url.to_string());
    }

    pub fn calls(&self, guild_id: GuildId) -> Vec<BackendCall> {
        self.calls
            .lock()
            .iter()
            .filter(|(g, _)| *g == guild_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn count(&self, guild_id: GuildId, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls(guild_id).iter().filter(|c| pred(c)).count()
    }

    /// Titles that started streaming successfully, in order.
    pub fn streamed(&self, guild_id: GuildId) -> Vec<String> {
        self.calls(guild_id)
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Stream { title, session: Some(_) } => Some(title),
                _ => None,
            })
            .collect()
    }

    pub fn stream_attempts(&self, guild_id: GuildId) -> usize {
        self.count(guild_id, |c| matches!(c, BackendCall::Stream { .. }))
    }

    pub fn last_connection(&self) -> Option<ConnectionId> {
        *self.last_connection.lock()
    }

    fn record(&self, guild_id: GuildId, call: BackendCall) {
        self.calls.lock().push((guild_id, call));
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl VoiceBackend for FakeBackend {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<ConnectionId, BackendError> {
        self.record(guild_id, BackendCall::Connect(channel_id));

        let delay = self.connect_delays.lock().get(&guild_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refused.lock().contains(&guild_id) {
            return Err(BackendError::Connect("missing permissions".into()));
        }

        let connection = ConnectionId(self.next_id());
        *self.last_connection.lock() = Some(connection);
        Ok(connection)
    }

    async fn stream(&self, guild_id: GuildId, track: &Track, _volume: u8) -> Result<SessionId, BackendError> {
        if self.failing_urls.lock().contains(&track.url) {
            self.record(guild_id, BackendCall::Stream { title: track.title.clone(), session: None });
            return Err(BackendError::Stream("video unavailable".into()));
        }

        let session = SessionId(self.next_id());
        self.record(guild_id, BackendCall::Stream { title: track.title.clone(), session: Some(session) });
        Ok(session)
    }

    async fn pause(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError> {
        self.record(guild_id, BackendCall::Pause(session));
        Ok(())
    }

    async fn resume(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError> {
        self.record(guild_id, BackendCall::Resume(session));
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError> {
        self.record(guild_id, BackendCall::Stop(session));
        Ok(())
    }

    async fn set_volume(&self, guild_id: GuildId, session: SessionId, volume: u8) -> Result<(), BackendError> {
        self.record(guild_id, BackendCall::SetVolume(session, volume));
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), BackendError> {
        self.record(guild_id, BackendCall::Disconnect);
        Ok(())
    }
}

/// Same settings for every guild.
pub struct StaticSettings(pub GuildSettings);

#[async_trait]
impl SettingsStore for StaticSettings {
    async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings {
        GuildSettings { guild_id: guild_id.get(), ..self.0.clone() }
    }
}
