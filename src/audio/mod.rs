//! # Audio Module
//!
//! Playback core of the bot: per-guild queues, the player state machine and
//! the registry that owns one player per guild.
//!
//! ## Architecture
//!
//! ### [`registry`] - Player Registry
//! - One [`player::GuildPlayer`] per guild, created on first use
//! - Serializes every command and backend signal of a guild
//! - Removes players after stop, idle timeout or a lost connection
//!
//! ### [`player`] - Guild Player
//! - `Disconnected → Connecting → Idle ⇄ Playing ⇄ Paused` state machine
//! - Advances the queue on track end, skip, stream errors and stuck streams
//! - Idle and reconnect deadlines
//!
//! ### [`queue`] - Queue Management
//! - FIFO pending tracks with a capacity limit
//! - Track and queue loop modes, shuffle, volume
//!
//! ### [`songbird_backend`] - Voice Transport
//! - Voice connections and streaming through songbird + yt-dlp
//! - Reports track and connection events as [`backend::PlayerSignal`]s
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let (signals, rx) = backend::signal_channel();
//! let registry = PlayerRegistry::new(backend, resolver, history, settings, timings, signals);
//! registry.listen(rx);
//!
//! registry.play(guild_id, channel_id, "never gonna give you up", Some(user_id)).await?;
//! registry.skip(guild_id).await;
//! ```

pub mod backend;
pub mod history;
pub mod player;
pub mod queue;
pub mod registry;
pub mod songbird_backend;
pub mod track;

#[cfg(test)]
pub mod test_support;

pub use registry::PlayerRegistry;
