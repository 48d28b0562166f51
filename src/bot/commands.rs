use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{
        application::{Command, CommandOptionType},
        id::GuildId,
        Permissions,
    },
    prelude::Context,
};

use crate::{audio::queue::MAX_VOLUME, storage::MAX_QUEUE_LIMIT};

/// Registers commands globally (can take up to an hour to propagate).
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    Command::set_global_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

/// Registers commands for a single guild (development).
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

pub fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        stop_command(),
        queue_command(),
        nowplaying_command(),
        volume_command(),
        shuffle_command(),
        loop_command(),
        remove_command(),
        history_command(),
        autoleave_command(),
        maxqueue_command(),
        maxduration_command(),
        volumelimit_command(),
    ]
}

// Playback

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Play a song or playlist")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
                .required(true),
        )
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pause the current song")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Resume playback")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Skip to the next song")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback, clear the queue and leave the channel")
}

// Queue

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Show the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number").min_int_value(1),
        )
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Show the current song")
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Shuffle the queue")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Set the repeat mode")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Repeat mode")
                .add_string_choice("Off", "off")
                .add_string_choice("Track", "track")
                .add_string_choice("Queue", "queue")
                .required(true),
        )
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Remove a song from the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "position", "Position in the queue")
                .min_int_value(1)
                .required(true),
        )
}

fn history_command() -> CreateCommand {
    CreateCommand::new("history").description("Show recently played songs")
}

// Audio

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Set the playback volume")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "level",
                format!("Volume (0-{})", MAX_VOLUME),
            )
            .min_int_value(0)
            .max_int_value(MAX_VOLUME as u64)
            .required(true),
        )
}

// Settings

fn autoleave_command() -> CreateCommand {
    CreateCommand::new("autoleave")
        .description("Seconds to stay in an idle voice channel (0 = never leave)")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "seconds", "Idle seconds before leaving")
                .min_int_value(0)
                .max_int_value(86_400)
                .required(true),
        )
}

fn maxqueue_command() -> CreateCommand {
    CreateCommand::new("maxqueue")
        .description("Maximum number of queued songs")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "size", "Queue limit")
                .min_int_value(1)
                .max_int_value(MAX_QUEUE_LIMIT as u64)
                .required(true),
        )
}

fn maxduration_command() -> CreateCommand {
    CreateCommand::new("maxduration")
        .description("Longest song allowed, in seconds (0 = no limit)")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "seconds", "Maximum song length")
                .min_int_value(0)
                .max_int_value(86_400)
                .required(true),
        )
}

fn volumelimit_command() -> CreateCommand {
    CreateCommand::new("volumelimit")
        .description("Highest volume members may set")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "level",
                format!("Volume cap (0-{})", MAX_VOLUME),
            )
            .min_int_value(0)
            .max_int_value(MAX_VOLUME as u64)
            .required(true),
        )
}
