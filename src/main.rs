use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, model::id::ApplicationId, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod cache;
mod config;
mod error;
mod sources;
mod storage;

use crate::audio::{
    backend::signal_channel, history::HistoryRecorder, songbird_backend::SongbirdBackend, PlayerRegistry,
};
use crate::bot::MusicBot;
use crate::config::Config;
use crate::sources::{
    spotify::{SpotifyCatalog, SpotifyClient},
    ytdlp::YtDlpClient,
    TrackResolver,
};
use crate::storage::JsonStorage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunebridge=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting tunebridge v{}", env!("CARGO_PKG_VERSION"));

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let storage = Arc::new(JsonStorage::new(config.data_dir.clone(), config.default_guild_settings()).await?);

    let http = reqwest::Client::new();
    let ytdlp = Arc::new(YtDlpClient::new(config.ytdlp_path.clone()));
    match ytdlp.version().await {
        Ok(version) => info!("✅ yt-dlp version: {}", version),
        Err(e) => warn!("⚠️ {}; searches will fail until yt-dlp is installed", e),
    }

    let spotify = config.spotify_credentials().map(|(id, secret)| {
        Arc::new(SpotifyClient::new(http.clone(), id, secret)) as Arc<dyn SpotifyCatalog>
    });
    let resolver = Arc::new(TrackResolver::new(ytdlp, spotify, config.resolver_options()));

    // Songbird needs the program name for the whole process lifetime.
    let ytdlp_program: &'static str = Box::leak(config.ytdlp_path.clone().into_boxed_str());
    let songbird = Songbird::serenity();
    let (signals, signal_rx) = signal_channel();
    let backend = Arc::new(SongbirdBackend::new(songbird.clone(), http, ytdlp_program, signals.clone()));

    let registry = PlayerRegistry::new(
        backend,
        resolver.clone(),
        HistoryRecorder::new(storage.clone()),
        storage.clone(),
        config.player_timings(),
        signals,
    );
    registry.listen(signal_rx);

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let handler = MusicBot::new(config.clone(), registry.clone(), storage, resolver);

    let mut builder = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird);
    if config.application_id != 0 {
        builder = builder.application_id(ApplicationId::new(config.application_id));
    }
    let mut client = builder.await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, closing...");
        registry.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

async fn health_check() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::build().unwrap_or_default();
    let version = YtDlpClient::new(config.ytdlp_path).version().await?;
    println!("OK (yt-dlp {})", version);
    Ok(())
}
