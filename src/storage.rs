use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::{collections::HashMap, path::PathBuf, time::Duration};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

use crate::audio::{
    history::{HistoryEntry, HistoryStore},
    queue::MAX_VOLUME,
};

pub const MAX_QUEUE_LIMIT: usize = 1000;

/// Per-guild settings stored as JSON.
///
/// Fields missing from an older file take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    pub guild_id: u64,
    pub default_volume: u8,
    pub max_queue_size: usize,
    /// Seconds an idle player stays connected. Zero keeps it connected.
    pub auto_leave_timeout: u64,
    /// Longest accepted track in seconds. Zero accepts any length.
    pub max_track_duration: u64,
    /// Highest volume members may set.
    pub volume_limit: u8,
}

impl GuildSettings {
    pub fn track_duration_limit(&self) -> Option<Duration> {
        (self.max_track_duration > 0).then(|| Duration::from_secs(self.max_track_duration))
    }
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            guild_id: 0,
            default_volume: 50,
            max_queue_size: 100,
            auto_leave_timeout: 300,
            max_track_duration: 3600,
            volume_limit: MAX_VOLUME,
        }
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Never fails; falls back to defaults when the stored copy is unreadable.
    async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings;
}

/// File-backed storage under `data_dir`.
///
/// - `servers/guild_{id}.json`: [`GuildSettings`]
/// - `history/guild_{id}.jsonl`: one [`HistoryEntry`] per line
pub struct JsonStorage {
    data_dir: PathBuf,
    defaults: GuildSettings,
    servers_cache: RwLock<HashMap<u64, GuildSettings>>,
    history_lock: Mutex<()>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf, defaults: GuildSettings) -> Result<Self> {
        fs::create_dir_all(data_dir.join("servers")).await?;
        fs::create_dir_all(data_dir.join("history")).await?;

        info!("📁 Storage ready at {}", data_dir.display());

        let storage = Self {
            data_dir,
            defaults,
            servers_cache: RwLock::new(HashMap::new()),
            history_lock: Mutex::new(()),
        };
        storage.load_all_servers().await?;

        Ok(storage)
    }

    pub async fn get_server_config(&self, guild_id: u64) -> Result<GuildSettings> {
        if let Some(config) = self.servers_cache.read().get(&guild_id) {
            return Ok(config.clone());
        }

        let config = match self.load_server_config(guild_id).await {
            Ok(config) => config,
            Err(e) => {
                if !is_not_found(&e) {
                    warn!("Unreadable settings for guild {}, using defaults: {}", guild_id, e);
                }
                GuildSettings { guild_id, ..self.defaults.clone() }
            }
        };

        self.servers_cache.write().insert(guild_id, config.clone());
        Ok(config)
    }

    pub async fn update_server_config(&self, config: GuildSettings) -> Result<()> {
        self.save_server_config(&config).await?;
        info!("💾 Settings updated for guild {}", config.guild_id);
        self.servers_cache.write().insert(config.guild_id, config);
        Ok(())
    }

    pub async fn set_auto_leave_timeout(&self, guild_id: u64, seconds: u64) -> Result<GuildSettings> {
        let mut config = self.get_server_config(guild_id).await?;
        config.auto_leave_timeout = seconds;
        self.update_server_config(config.clone()).await?;
        Ok(config)
    }

    pub async fn set_max_queue_size(&self, guild_id: u64, size: usize) -> Result<GuildSettings> {
        let mut config = self.get_server_config(guild_id).await?;
        config.max_queue_size = size.clamp(1, MAX_QUEUE_LIMIT);
        self.update_server_config(config.clone()).await?;
        Ok(config)
    }

    pub async fn set_max_track_duration(&self, guild_id: u64, seconds: u64) -> Result<GuildSettings> {
        let mut config = self.get_server_config(guild_id).await?;
        config.max_track_duration = seconds;
        self.update_server_config(config.clone()).await?;
        Ok(config)
    }

    pub async fn set_volume_limit(&self, guild_id: u64, limit: u8) -> Result<GuildSettings> {
        let mut config = self.get_server_config(guild_id).await?;
        config.volume_limit = limit.min(MAX_VOLUME);
        self.update_server_config(config.clone()).await?;
        Ok(config)
    }

    /// Latest `limit` history entries of a guild, newest first.
    pub async fn recent_history(&self, guild_id: u64, limit: usize) -> Result<Vec<HistoryEntry>> {
        let content = match fs::read_to_string(self.history_file_path(guild_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<HistoryEntry> = content
            .lines()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping corrupt history line for guild {}: {}", guild_id, e);
                    None
                }
            })
            .collect();

        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    async fn load_server_config(&self, guild_id: u64) -> Result<GuildSettings> {
        let content = fs::read_to_string(self.server_file_path(guild_id)).await?;
        let config: GuildSettings = serde_json::from_str(&content)?;
        Ok(config)
    }

    async fn save_server_config(&self, config: &GuildSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        fs::write(self.server_file_path(config.guild_id), content).await?;
        Ok(())
    }

    async fn load_all_servers(&self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("servers")).await?;
        let mut loaded = HashMap::new();

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_server_config(guild_id).await {
                Ok(config) => {
                    loaded.insert(guild_id, config);
                }
                Err(e) => warn!("Could not load settings for guild {}: {}", guild_id, e),
            }
        }

        if !loaded.is_empty() {
            info!("📂 Loaded settings for {} guilds", loaded.len());
        }
        self.servers_cache.write().extend(loaded);
        Ok(())
    }

    fn server_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join("servers").join(format!("guild_{}.json", guild_id))
    }

    fn history_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join("history").join(format!("guild_{}.jsonl", guild_id))
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
}

#[async_trait]
impl SettingsStore for JsonStorage {
    async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings {
        match self.get_server_config(guild_id.get()).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Falling back to default settings for guild {}: {}", guild_id, e);
                GuildSettings { guild_id: guild_id.get(), ..self.defaults.clone() }
            }
        }
    }
}

#[async_trait]
impl HistoryStore for JsonStorage {
    async fn record_history(&self, entry: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        // Appends from concurrent guild players must not interleave.
        let _guard = self.history_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_file_path(entry.guild_id.get()))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
