use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{
    audio::{
        history::HistoryEntry,
        queue::{LoopMode, QueuePage, MAX_VOLUME},
        registry::PlayerStatus,
        track::{format_clock, Track},
    },
    bot::MusicBot,
    error::MusicError,
    sources::Resolved,
};

const QUEUE_PAGE_SIZE: usize = 10;
const HISTORY_LIMIT: usize = 10;

/// Dispatches a slash command.
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &MusicBot) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return respond(ctx, &command, "❌ This command only works in a server").await;
    };

    info!(
        "📝 /{} used by {} in guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await,
        "pause" => {
            let reply = if bot.registry.pause(guild_id).await {
                "⏸️ Paused"
            } else {
                "❌ Nothing is playing"
            };
            respond(ctx, &command, reply).await
        }
        "resume" => {
            let reply = if bot.registry.resume(guild_id).await {
                "▶️ Resumed"
            } else {
                "❌ Nothing is paused"
            };
            respond(ctx, &command, reply).await
        }
        "skip" => {
            let reply = if bot.registry.skip(guild_id).await {
                "⏭️ Skipped"
            } else {
                "❌ Nothing is playing"
            };
            respond(ctx, &command, reply).await
        }
        "stop" => {
            let reply = if bot.registry.stop(guild_id).await {
                "⏹️ Stopped and left the channel"
            } else {
                "❌ I'm not in a voice channel"
            };
            respond(ctx, &command, reply).await
        }
        "queue" => {
            let page = int_option(&command, "page").map_or(1, |p| p.max(1) as usize);
            let tracks = bot.registry.paginated_tracks(guild_id, page, QUEUE_PAGE_SIZE).await;
            let status = bot.registry.status(guild_id).await;
            respond(ctx, &command, &describe_queue(&tracks, status.as_ref())).await
        }
        "nowplaying" => {
            let reply = match bot.registry.status(guild_id).await {
                Some(status) => describe_now_playing(&status),
                None => "❌ Nothing is playing".to_string(),
            };
            respond(ctx, &command, &reply).await
        }
        "volume" => {
            let level = int_option(&command, "level").unwrap_or(i64::from(crate::audio::queue::DEFAULT_VOLUME));
            let reply = match bot.registry.set_volume(guild_id, level).await {
                Some(volume) => format!("🔊 Volume set to {}%", volume),
                None => "❌ Nothing is playing".to_string(),
            };
            respond(ctx, &command, &reply).await
        }
        "shuffle" => {
            let reply = if bot.registry.shuffle(guild_id).await {
                "🔀 Queue shuffled"
            } else {
                "❌ The queue is empty"
            };
            respond(ctx, &command, reply).await
        }
        "loop" => {
            let mode = str_option(&command, "mode").unwrap_or("off");
            let reply = match mode.parse::<LoopMode>() {
                Ok(mode) => {
                    if bot.registry.set_loop_mode(guild_id, mode).await {
                        format!("🔁 Loop mode: {}", mode)
                    } else {
                        "❌ Nothing is playing".to_string()
                    }
                }
                Err(e) => format!("❌ {}", e),
            };
            respond(ctx, &command, &reply).await
        }
        "remove" => {
            let position = int_option(&command, "position").unwrap_or(0);
            let removed = match usize::try_from(position) {
                Ok(position) => bot.registry.remove_track(guild_id, position).await,
                Err(_) => None,
            };
            let reply = match removed {
                Some(track) => format!("🗑️ Removed **{}**", track.title),
                None => format!("❌ There is no song at position {}", position),
            };
            respond(ctx, &command, &reply).await
        }
        "history" => {
            let entries = bot.storage.recent_history(guild_id.get(), HISTORY_LIMIT).await?;
            respond(ctx, &command, &describe_history(&entries)).await
        }
        "autoleave" => {
            let seconds = int_option(&command, "seconds").unwrap_or(0).max(0) as u64;
            let settings = bot.storage.set_auto_leave_timeout(guild_id.get(), seconds).await?;
            bot.registry.apply_settings(&settings).await;
            let reply = match seconds {
                0 => "💤 I will stay in idle voice channels".to_string(),
                secs => format!(
                    "💤 I will leave after {} of inactivity",
                    humantime::format_duration(Duration::from_secs(secs))
                ),
            };
            respond(ctx, &command, &reply).await
        }
        "maxqueue" => {
            let size = int_option(&command, "size").unwrap_or(1).max(1) as usize;
            let settings = bot.storage.set_max_queue_size(guild_id.get(), size).await?;
            bot.registry.apply_settings(&settings).await;
            respond(ctx, &command, &format!("📏 Queue limit set to {} songs", settings.max_queue_size)).await
        }
        "maxduration" => {
            let seconds = int_option(&command, "seconds").unwrap_or(0).max(0) as u64;
            let settings = bot.storage.set_max_track_duration(guild_id.get(), seconds).await?;
            bot.registry.apply_settings(&settings).await;
            let reply = match settings.track_duration_limit() {
                None => "⏱️ Songs of any length are allowed".to_string(),
                Some(limit) => format!("⏱️ Songs longer than {} are refused", humantime::format_duration(limit)),
            };
            respond(ctx, &command, &reply).await
        }
        "volumelimit" => {
            let level = int_option(&command, "level").unwrap_or(i64::from(MAX_VOLUME));
            let limit = level.clamp(0, i64::from(MAX_VOLUME)) as u8;
            let settings = bot.storage.set_volume_limit(guild_id.get(), limit).await?;
            bot.registry.apply_settings(&settings).await;
            respond(ctx, &command, &format!("🔊 Volume capped at {}%", settings.volume_limit)).await
        }
        _ => respond(ctx, &command, "❌ Unknown command").await,
    }
}

async fn handle_play(ctx: &Context, command: &CommandInteraction, bot: &MusicBot, guild_id: GuildId) -> Result<()> {
    let Some(query) = str_option(command, "query") else {
        return respond(ctx, command, "❌ Missing query").await;
    };
    let Some(channel_id) = get_user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, command, "❌ Join a voice channel first").await;
    };

    // Resolution and connecting can take a while.
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let reply = match bot.registry.play(guild_id, channel_id, query, Some(command.user.id)).await {
        Ok(resolved) => describe_resolved(&resolved),
        Err(e) => {
            if e.is_retryable() {
                warn!("Guild {}: play failed: {}", guild_id, e);
            } else {
                error!("Guild {}: play failed: {}", guild_id, e);
            }
            describe_error(&e)
        }
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(reply))
        .await?;
    Ok(())
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: &str) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().content(content)),
        )
        .await?;
    Ok(())
}

fn str_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild.voice_states.get(&user_id).and_then(|state| state.channel_id)
}

fn describe_resolved(resolved: &Resolved) -> String {
    match resolved {
        Resolved::Track(track) => format!("🎵 Queued **{}** ({})", track.title, format_clock(track.duration)),
        Resolved::Playlist(tracks) => {
            let total: Duration = tracks.iter().map(|t| t.duration).sum();
            format!("📃 Queued {} songs ({})", tracks.len(), format_clock(total))
        }
        Resolved::NotFound => "🔍 No results found".to_string(),
    }
}

fn describe_error(error: &MusicError) -> String {
    match error {
        MusicError::QueueFull(max) => format!("❌ The queue is full ({} songs)", max),
        MusicError::Connection(_) => "❌ I couldn't join your voice channel, try again".to_string(),
        MusicError::BackendUnavailable(_) => "⚠️ The music service is unavailable right now, try again later".to_string(),
        MusicError::Resolution(reason) => format!("❌ {}", reason),
        MusicError::TrackTooLong(secs) => format!(
            "❌ Songs longer than {} are not allowed here",
            humantime::format_duration(Duration::from_secs(*secs))
        ),
    }
}

fn describe_track(track: &Track) -> String {
    let requester = track
        .requested_by
        .map(|user| format!(" · <@{}>", user))
        .unwrap_or_default();
    format!("**{}** ({}){}", track.title, format_clock(track.duration), requester)
}

fn describe_now_playing(status: &PlayerStatus) -> String {
    match &status.now_playing {
        Some(track) => format!(
            "🎵 Now playing: {} · {}\n🔊 {}% · 🔁 {}",
            describe_track(track),
            track.platform,
            status.volume,
            status.loop_mode
        ),
        None => "❌ Nothing is playing".to_string(),
    }
}

fn describe_queue(page: &QueuePage, status: Option<&PlayerStatus>) -> String {
    let mut lines = Vec::new();
    if let Some(track) = status.and_then(|s| s.now_playing.as_ref()) {
        lines.push(format!("🎵 Now: {}", describe_track(track)));
    }

    if page.total_tracks == 0 {
        lines.push("📭 The queue is empty".to_string());
        return lines.join("\n");
    }

    let offset = (page.page - 1) * QUEUE_PAGE_SIZE;
    lines.extend(
        page.tracks
            .iter()
            .enumerate()
            .map(|(i, track)| format!("`{}.` {}", offset + i + 1, describe_track(track))),
    );

    let remaining = status.map(|s| s.queue_duration).unwrap_or_default();
    let loop_mode = status.map(|s| s.loop_mode).unwrap_or_default();
    lines.push(format!(
        "Page {}/{} · {} songs · {} remaining · 🔁 {}",
        page.page,
        page.total_pages,
        page.total_tracks,
        format_clock(remaining),
        loop_mode
    ));
    lines.join("\n")
}

fn describe_history(entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        return "📭 Nothing has been played yet".to_string();
    }

    let mut lines = vec!["🕘 Recently played:".to_string()];
    lines.extend(entries.iter().map(|entry| {
        format!(
            "• **{}** ({}) · <t:{}:R>",
            entry.title,
            format_clock(Duration::from_secs(entry.duration_secs)),
            entry.played_at.timestamp()
        )
    }));
    lines.join("\n")
}
