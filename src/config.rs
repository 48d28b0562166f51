use anyhow::{Context, Result};
use config::{builder::DefaultState, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::{
    audio::{player::PlayerTimings, queue::MAX_VOLUME},
    sources::ResolverOptions,
    storage::{GuildSettings, MAX_QUEUE_LIMIT},
};

/// Optional config file looked up in the working directory (`tunebridge.toml`).
const CONFIG_FILE: &str = "tunebridge";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Registers commands on a single guild for development

    // Playback
    pub default_volume: u8,
    pub volume_limit: u8,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub max_track_duration_secs: u64, // 0 accepts any length
    pub connect_timeout_secs: u64,
    pub reconnect_grace_secs: u64,
    pub idle_timeout_secs: u64, // 0 keeps idle players connected

    // Resolution
    pub resolve_timeout_secs: u64,
    pub search_cache_size: usize,
    pub search_cache_ttl_secs: u64,
    pub ytdlp_path: String,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    /// Reads `.env`, then layers defaults, `tunebridge.toml` and environment
    /// variables (`DISCORD_TOKEN`, `MAX_QUEUE_SIZE`, ...), and validates.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::build()?;
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;

        Ok(config)
    }

    /// Same layering as [`Config::load`] without validation.
    pub fn build() -> Result<Self> {
        let config = Self::defaults()?
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()
            .context("could not read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(config)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("discord_token", defaults.discord_token)?
            .set_default("application_id", defaults.application_id)?
            .set_default("default_volume", i64::from(defaults.default_volume))?
            .set_default("volume_limit", i64::from(defaults.volume_limit))?
            .set_default("max_queue_size", defaults.max_queue_size as u64)?
            .set_default("max_playlist_size", defaults.max_playlist_size as u64)?
            .set_default("max_track_duration_secs", defaults.max_track_duration_secs)?
            .set_default("connect_timeout_secs", defaults.connect_timeout_secs)?
            .set_default("reconnect_grace_secs", defaults.reconnect_grace_secs)?
            .set_default("idle_timeout_secs", defaults.idle_timeout_secs)?
            .set_default("resolve_timeout_secs", defaults.resolve_timeout_secs)?
            .set_default("search_cache_size", defaults.search_cache_size as u64)?
            .set_default("search_cache_ttl_secs", defaults.search_cache_ttl_secs)?
            .set_default("ytdlp_path", defaults.ytdlp_path)?
            .set_default("data_dir", defaults.data_dir.to_string_lossy().into_owned())?;
        Ok(builder)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - A Discord token must be present
    /// - Volume and volume limit must be between 0 and 100
    /// - Queue size must be between 1 and the global queue limit
    /// - Playlist size and timeouts must be greater than 0
    /// - Spotify credentials come in pairs
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN is not set");
        }

        if self.default_volume > MAX_VOLUME {
            anyhow::bail!("Default volume must be between 0 and {}, got: {}", MAX_VOLUME, self.default_volume);
        }

        if self.volume_limit > MAX_VOLUME {
            anyhow::bail!("Volume limit must be between 0 and {}, got: {}", MAX_VOLUME, self.volume_limit);
        }

        if self.max_queue_size == 0 || self.max_queue_size > MAX_QUEUE_LIMIT {
            anyhow::bail!(
                "Max queue size must be between 1 and {}, got: {}",
                MAX_QUEUE_LIMIT,
                self.max_queue_size
            );
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.connect_timeout_secs == 0 || self.resolve_timeout_secs == 0 {
            anyhow::bail!("Connect and resolve timeouts must be greater than 0");
        }

        if self.spotify_client_id.is_some() != self.spotify_client_secret.is_some() {
            anyhow::bail!("SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET must be set together");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Never includes the token or the Spotify secret.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Playback: {}% vol, {} queue, {} playlist, auto-leave {}\n  \
            Timeouts: connect {}s, reconnect grace {}s, resolve {}s\n  \
            Resolver: {} ({} cached for {}s), Spotify {}\n  \
            Data: {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.default_volume,
            self.max_queue_size,
            self.max_playlist_size,
            match self.idle_timeout_secs {
                0 => "off".to_string(),
                secs => humantime::format_duration(Duration::from_secs(secs)).to_string(),
            },
            self.connect_timeout_secs,
            self.reconnect_grace_secs,
            self.resolve_timeout_secs,
            self.ytdlp_path,
            self.search_cache_size,
            self.search_cache_ttl_secs,
            if self.spotify_credentials().is_some() { "enabled" } else { "disabled" },
            self.data_dir.display()
        )
    }

    pub fn player_timings(&self) -> PlayerTimings {
        PlayerTimings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect_grace: Duration::from_secs(self.reconnect_grace_secs),
            idle_timeout: (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs)),
        }
    }

    /// Settings for guilds that never changed theirs.
    pub fn default_guild_settings(&self) -> GuildSettings {
        GuildSettings {
            guild_id: 0,
            default_volume: self.default_volume,
            max_queue_size: self.max_queue_size,
            auto_leave_timeout: self.idle_timeout_secs,
            max_track_duration: self.max_track_duration_secs,
            volume_limit: self.volume_limit,
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            max_playlist_size: self.max_playlist_size,
            timeout: Duration::from_secs(self.resolve_timeout_secs),
            cache_capacity: self.search_cache_size,
            cache_ttl: Duration::from_secs(self.search_cache_ttl_secs),
        }
    }

    pub fn spotify_credentials(&self) -> Option<(String, String)> {
        let id = self.spotify_client_id.as_deref().filter(|s| !s.trim().is_empty())?;
        let secret = self.spotify_client_secret.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((id.to_string(), secret.to_string()))
    }
}

/// Default configuration values.
///
/// Used as fallbacks when neither the config file nor the environment
/// provides a value.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            // Playback defaults
            default_volume: 50,
            volume_limit: 100,
            max_queue_size: 100,
            max_playlist_size: 50,
            max_track_duration_secs: 3600,
            connect_timeout_secs: 30,
            reconnect_grace_secs: 5,
            idle_timeout_secs: 300,

            // Resolution defaults
            resolve_timeout_secs: 20,
            search_cache_size: 500,
            search_cache_ttl_secs: 1800,
            ytdlp_path: "yt-dlp".to_string(),
            spotify_client_id: None,
            spotify_client_secret: None,

            // Path defaults
            data_dir: "data".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use pretty_assertions::assert_eq;

    fn from_toml(toml: &str) -> Config {
        Config::defaults()
            .unwrap()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_file_values_override_defaults() {
        let config = from_toml(
            r#"
            discord_token = "token"
            guild_id = 1234
            idle_timeout_secs = 0
            max_playlist_size = 25
            max_track_duration_secs = 0
            volume_limit = 70
            "#,
        );

        assert_eq!(config.guild_id, Some(1234));
        assert_eq!(config.max_playlist_size, 25);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.player_timings().idle_timeout, None);
        assert_eq!(config.default_guild_settings().auto_leave_timeout, 0);
        assert_eq!(config.default_guild_settings().track_duration_limit(), None);
        assert_eq!(config.default_guild_settings().volume_limit, 70);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let valid = Config { discord_token: "token".into(), ..Config::default() };
        assert!(valid.validate().is_ok());

        assert!(Config::default().validate().is_err());
        assert!(Config { default_volume: 101, ..valid.clone() }.validate().is_err());
        assert!(Config { volume_limit: 101, ..valid.clone() }.validate().is_err());
        assert!(Config { max_queue_size: 0, ..valid.clone() }.validate().is_err());
        assert!(Config { max_queue_size: MAX_QUEUE_LIMIT + 1, ..valid.clone() }.validate().is_err());
        assert!(Config { spotify_client_id: Some("id".into()), ..valid.clone() }.validate().is_err());
    }

    #[test]
    fn test_summary_hides_secrets() {
        let config = Config {
            discord_token: "super-secret-token".into(),
            spotify_client_id: Some("id".into()),
            spotify_client_secret: Some("spotify-secret".into()),
            ..Config::default()
        };

        let summary = config.summary();

        assert!(!summary.contains("super-secret-token"));
        assert!(!summary.contains("spotify-secret"));
        assert!(summary.contains("Spotify enabled"));
        assert!(summary.contains("auto-leave 5m"));
    }
}
