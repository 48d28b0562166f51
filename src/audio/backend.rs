use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::fmt;
use tokio::sync::mpsc;

use super::track::Track;
use crate::error::BackendError;

/// Identifies one stream started by the voice backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Identifies one voice connection. A reconnect to the same guild gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Everything that can asynchronously change a guild player's state.
///
/// Backend events carry the session or connection they refer to so the
/// player can discard signals that outlived their stream. Timer signals carry
/// the epoch of the timer that raised them for the same reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerSignal {
    TrackStarted(SessionId),
    TrackEnded(SessionId),
    TrackErrored { session: SessionId, reason: String },
    TrackStuck(SessionId),
    ConnectionLost(ConnectionId),
    ConnectionRestored(ConnectionId),
    IdleTimeout(u64),
    ReconnectDeadline(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSignal {
    pub guild_id: GuildId,
    pub signal: PlayerSignal,
}

pub type SignalSender = mpsc::UnboundedSender<GuildSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<GuildSignal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Voice transport the guild player drives.
///
/// Implementations report session and connection events through the
/// [`SignalSender`] they were built with.
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<ConnectionId, BackendError>;

    async fn stream(&self, guild_id: GuildId, track: &Track, volume: u8) -> Result<SessionId, BackendError>;

    async fn pause(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError>;

    async fn resume(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError>;

    async fn stop(&self, guild_id: GuildId, session: SessionId) -> Result<(), BackendError>;

    async fn set_volume(&self, guild_id: GuildId, session: SessionId, volume: u8) -> Result<(), BackendError>;

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), BackendError>;
}
