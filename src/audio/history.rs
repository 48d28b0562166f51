use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, UserId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::track::{Platform, Track};

/// One "track started" record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub guild_id: GuildId,
    pub user_id: Option<UserId>,
    pub title: String,
    pub url: String,
    pub platform: Platform,
    pub duration_secs: u64,
    pub played_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(guild_id: GuildId, user_id: Option<UserId>, track: &Track) -> Self {
        Self {
            guild_id,
            user_id,
            title: track.title.clone(),
            url: track.url.clone(),
            platform: track.platform,
            duration_secs: track.duration_secs(),
            played_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_history(&self, entry: &HistoryEntry) -> Result<()>;
}

/// Fire-and-forget front for a [`HistoryStore`].
///
/// Writes run on their own task; errors end up in the log and nowhere else.
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Option<Arc<dyn HistoryStore>>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn record(&self, guild_id: GuildId, requester: Option<UserId>, track: &Track) -> Option<JoinHandle<()>> {
        let store = self.store.clone()?;
        let entry = HistoryEntry::new(guild_id, requester, track);

        Some(tokio::spawn(async move {
            match store.record_history(&entry).await {
                Ok(()) => debug!("📝 History recorded for guild {}: {}", guild_id, entry.title),
                Err(e) => warn!("Could not record history for guild {}: {:?}", guild_id, e),
            }
        }))
    }
}
