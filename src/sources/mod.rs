//! Turning user queries into playable tracks.
//!
//! [`resolver::TrackResolver`] is the only entry point used by the player
//! layer. It talks to a [`SearchBackend`] (yt-dlp in production) and, for
//! Spotify links, to a [`spotify::SpotifyCatalog`] first.

pub mod resolver;
pub mod spotify;
pub mod ytdlp;

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::{
    audio::track::{Platform, Track},
    error::ResolveError,
};

pub use resolver::{Resolved, ResolverOptions, TrackResolver};

/// Raw result of a search backend, before it becomes a [`Track`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub url: Option<String>,
    pub duration: Option<Duration>,
    pub artist: Option<String>,
    pub thumbnail: Option<String>,
    /// Extractor that produced the entry, e.g. `Youtube` or `Soundcloud`.
    pub extractor: Option<String>,
}

impl TrackMetadata {
    /// `None` when the entry has no streamable URL.
    pub fn into_track(self) -> Option<Track> {
        let url = self.url.filter(|u| !u.trim().is_empty())?;
        let platform = self
            .extractor
            .as_deref()
            .and_then(Platform::from_extractor)
            .unwrap_or_else(|| Platform::from_url(&url));

        let mut track = Track::new(self.title, url, self.duration.unwrap_or_default(), platform);
        if let Some(artist) = self.artist {
            track = track.with_artist(artist);
        }
        if let Some(thumbnail) = self.thumbnail {
            track = track.with_thumbnail(thumbnail);
        }
        Some(track)
    }
}

/// External service that can search for and expand media links.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Best matches for free text or a single link, best first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<TrackMetadata>, ResolveError>;

    /// Entries of a playlist link, in playlist order, at most `limit`.
    async fn resolve_playlist(&self, url: &str, limit: usize) -> Result<Vec<TrackMetadata>, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Search,
    TrackUrl(Platform),
    PlaylistUrl(Platform),
}

/// Decides how a trimmed query has to be resolved.
pub fn classify_query(query: &str) -> QueryKind {
    if let Some(rest) = query.strip_prefix("spotify:") {
        return if rest.starts_with("playlist:") || rest.starts_with("album:") {
            QueryKind::PlaylistUrl(Platform::Spotify)
        } else {
            QueryKind::TrackUrl(Platform::Spotify)
        };
    }

    let Ok(url) = Url::parse(query) else {
        return QueryKind::Search;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return QueryKind::Search;
    }

    let platform = Platform::from_url(query);
    let path = url.path();
    let is_playlist = match platform {
        Platform::YouTube => {
            let has = |key: &str| url.query_pairs().any(|(k, _)| k == key);
            path.starts_with("/playlist") || (has("list") && !has("v"))
        }
        Platform::SoundCloud => path.contains("/sets/"),
        Platform::Spotify => path.contains("/playlist/") || path.contains("/album/"),
        Platform::Other => false,
    };

    if is_playlist {
        QueryKind::PlaylistUrl(platform)
    } else {
        QueryKind::TrackUrl(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classify_query() {
        assert_eq!(classify_query("never gonna give you up"), QueryKind::Search);
        assert_eq!(
            classify_query("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            QueryKind::TrackUrl(Platform::YouTube)
        );
        // A video opened from inside a playlist is still a single track.
        assert_eq!(
            classify_query("https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL123"),
            QueryKind::TrackUrl(Platform::YouTube)
        );
        assert_eq!(
            classify_query("https://www.youtube.com/playlist?list=PL123"),
            QueryKind::PlaylistUrl(Platform::YouTube)
        );
        assert_eq!(
            classify_query("https://soundcloud.com/artist/sets/best-of"),
            QueryKind::PlaylistUrl(Platform::SoundCloud)
        );
        assert_eq!(
            classify_query("https://open.spotify.com/album/1DFixLWuPkv3KT3TnV35m3"),
            QueryKind::PlaylistUrl(Platform::Spotify)
        );
        assert_eq!(
            classify_query("spotify:track:4uLU6hMCjMI75M1A2tKUQC"),
            QueryKind::TrackUrl(Platform::Spotify)
        );
        assert_eq!(classify_query("https://example.com/a.mp3"), QueryKind::TrackUrl(Platform::Other));
        assert_eq!(classify_query("ftp://example.com/a.mp3"), QueryKind::Search);
    }

    #[test]
    fn test_metadata_without_url_is_unplayable() {
        let meta = TrackMetadata { title: "ghost".into(), ..TrackMetadata::default() };
        assert_eq!(meta.into_track(), None);
    }

    #[test]
    fn test_metadata_platform_prefers_extractor() {
        let meta = TrackMetadata {
            title: "song".into(),
            url: Some("https://cdn.example.com/stream".into()),
            duration: Some(Duration::from_secs_f64(201.6)),
            extractor: Some("Soundcloud".into()),
            ..TrackMetadata::default()
        };

        let track = meta.into_track().unwrap();
        assert_eq!(track.platform, Platform::SoundCloud);
        assert_eq!(track.duration_secs(), 201);
    }
}
