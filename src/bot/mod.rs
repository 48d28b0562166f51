//! # Bot Module
//!
//! Discord side of the bot: slash command registration, interaction
//! dispatch and gateway events that affect playback.
//!
//! ## Architecture
//!
//! [`MusicBot`] implements Serenity's [`EventHandler`]. Every music command
//! goes through the [`PlayerRegistry`]; guild settings and history come from
//! [`JsonStorage`].

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, Guild, GuildId, Interaction, Ready, UnavailableGuild, VoiceState},
    async_trait,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::PlayerRegistry,
    config::Config,
    sources::TrackResolver,
    storage::JsonStorage,
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Discord event handler.
///
/// ## Fields
///
/// - `config`: Bot configuration (token, limits, timeouts)
/// - `registry`: One music player per guild
/// - `storage`: Guild settings and play history
/// - `resolver`: Shared with the registry; kept here for cache maintenance
pub struct MusicBot {
    config: Arc<Config>,
    pub registry: PlayerRegistry,
    pub storage: Arc<JsonStorage>,
    resolver: Arc<TrackResolver>,
    maintenance_started: AtomicBool,
}

impl MusicBot {
    pub fn new(
        config: Arc<Config>,
        registry: PlayerRegistry,
        storage: Arc<JsonStorage>,
        resolver: Arc<TrackResolver>,
    ) -> Self {
        Self {
            config,
            registry,
            storage,
            resolver,
            maintenance_started: AtomicBool::new(false),
        }
    }

    /// Registers slash commands globally or, when `guild_id` is configured,
    /// on that guild only (faster propagation while developing).
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    anyhow::anyhow!("could not register commands on guild {}: {:?}", guild_id, e)
                })?;
                info!("✅ Guild commands registered for {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx)
                    .await
                    .map_err(|e| anyhow::anyhow!("could not register global commands: {:?}", e))?;
                info!("✅ Global commands registered");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Command registration failed: {:?}", e);
        }

        // `ready` fires again after every reconnect.
        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let resolver = self.resolver.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            maintenance_tasks(resolver, registry).await;
        });
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Command failed: {:?}", e);
            }
        }
    }

    /// Stops the guild's player when someone else disconnects the bot.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        if new.user_id != ctx.cache.current_user().id || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let old_channel = old.and_then(|state| state.channel_id);

        if self.registry.voice_disconnected(guild_id, old_channel).await {
            warn!("🔌 Disconnected from voice in guild {}, player stopped", guild_id);
        }
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // An outage is not a removal.
        if incomplete.unavailable {
            return;
        }
        if self.registry.stop(incomplete.id).await {
            info!("👋 Removed from guild {}, player stopped", incomplete.id);
        }
    }
}

/// Hourly housekeeping: drops expired resolution cache entries.
async fn maintenance_tasks(resolver: Arc<TrackResolver>, registry: PlayerRegistry) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    // The first tick fires immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        let purged = resolver.purge_expired();
        info!(
            "🧹 Maintenance done: {} cache entries purged, {} active players",
            purged,
            registry.len()
        );
    }
}
