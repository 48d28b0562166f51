use futures::{stream, StreamExt};
use serenity::model::id::UserId;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{
    classify_query,
    spotify::{parse_spotify_url, SpotifyCatalog, SpotifyKind, SpotifyTrack},
    QueryKind, SearchBackend, TrackMetadata,
};
use crate::{
    audio::track::{Platform, Track},
    cache::LRUCache,
    error::ResolveError,
};

/// Spotify entries looked up on the search backend at the same time.
const SPOTIFY_LOOKUP_CONCURRENCY: usize = 4;

/// Outcome of resolving a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Track(Track),
    /// Never empty.
    Playlist(Vec<Track>),
    NotFound,
}

impl Resolved {
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            Self::Track(track) => vec![track],
            Self::Playlist(tracks) => tracks,
            Self::NotFound => Vec::new(),
        }
    }

    fn with_requester(self, requester: Option<UserId>) -> Self {
        match self {
            Self::Track(track) => Self::Track(track.with_requester(requester)),
            Self::Playlist(tracks) => {
                Self::Playlist(tracks.into_iter().map(|t| t.with_requester(requester)).collect())
            }
            Self::NotFound => Self::NotFound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverOptions {
    pub max_playlist_size: usize,
    /// Upper bound for every single backend call.
    pub timeout: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_playlist_size: 50,
            timeout: Duration::from_secs(20),
            cache_capacity: 500,
            cache_ttl: Duration::from_secs(1800),
        }
    }
}

/// Resolves user queries into tracks.
///
/// Successful resolutions are cached by query. Cached values never carry a
/// requester; it is attached on the way out.
pub struct TrackResolver {
    search: Arc<dyn SearchBackend>,
    spotify: Option<Arc<dyn SpotifyCatalog>>,
    options: ResolverOptions,
    cache: LRUCache<String, Resolved>,
}

impl TrackResolver {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        spotify: Option<Arc<dyn SpotifyCatalog>>,
        options: ResolverOptions,
    ) -> Self {
        info!(
            "🔎 Resolver ready (playlist cap {}, cache {} entries, spotify {})",
            options.max_playlist_size,
            options.cache_capacity,
            if spotify.is_some() { "on" } else { "off" }
        );
        Self {
            search,
            spotify,
            options,
            cache: LRUCache::new(options.cache_capacity),
        }
    }

    pub async fn resolve(&self, query: &str, requester: Option<UserId>) -> Result<Resolved, ResolveError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Resolved::NotFound);
        }

        if let Some(hit) = self.cache.get(&query.to_string()) {
            debug!("Resolution cache hit for '{}'", query);
            return Ok(hit.with_requester(requester));
        }

        let resolved = match classify_query(query) {
            QueryKind::Search | QueryKind::TrackUrl(Platform::YouTube | Platform::SoundCloud | Platform::Other) => {
                self.resolve_single(query).await?
            }
            QueryKind::PlaylistUrl(Platform::Spotify) | QueryKind::TrackUrl(Platform::Spotify) => {
                self.resolve_spotify(query).await?
            }
            QueryKind::PlaylistUrl(_) => self.resolve_playlist(query).await?,
        };

        match &resolved {
            Resolved::NotFound => debug!("Nothing found for '{}'", query),
            _ => self
                .cache
                .insert_with_ttl(query.to_string(), resolved.clone(), Some(self.options.cache_ttl)),
        }

        Ok(resolved.with_requester(requester))
    }

    /// Drops expired cache entries.
    pub fn purge_expired(&self) -> usize {
        self.cache.cleanup_expired()
    }

    async fn resolve_single(&self, query: &str) -> Result<Resolved, ResolveError> {
        let results = self.bounded(self.search.search(query, 1)).await?;
        Ok(first_playable(results).map_or(Resolved::NotFound, Resolved::Track))
    }

    async fn resolve_playlist(&self, url: &str) -> Result<Resolved, ResolveError> {
        let limit = self.options.max_playlist_size;
        let entries = self.bounded(self.search.resolve_playlist(url, limit)).await?;
        let total = entries.len();

        let tracks: Vec<Track> = entries
            .into_iter()
            .filter_map(TrackMetadata::into_track)
            .take(limit)
            .collect();

        if tracks.len() < total {
            debug!("Playlist {}: kept {} of {} entries", url, tracks.len(), total);
        }
        Ok(playlist_or_not_found(tracks))
    }

    async fn resolve_spotify(&self, query: &str) -> Result<Resolved, ResolveError> {
        let Some(catalog) = &self.spotify else {
            return Err(ResolveError::Unsupported("Spotify links are not enabled on this bot".into()));
        };
        let Some((kind, id)) = parse_spotify_url(query) else {
            return Ok(Resolved::NotFound);
        };

        if kind == SpotifyKind::Track {
            let Some(track) = self.bounded(catalog.track(&id)).await? else {
                return Ok(Resolved::NotFound);
            };
            return Ok(self
                .find_spotify_track(&track)
                .await?
                .map_or(Resolved::NotFound, Resolved::Track));
        }

        let limit = self.options.max_playlist_size;
        let mut listing = self.bounded(catalog.collection(kind, &id, limit)).await?;
        listing.truncate(limit);

        let lookups: Vec<_> = listing.iter().map(|track| self.find_spotify_track(track)).collect();
        let lookups: Vec<Result<Option<Track>, ResolveError>> = stream::iter(lookups)
            .buffered(SPOTIFY_LOOKUP_CONCURRENCY)
            .collect()
            .await;

        let mut first_error = None;
        let mut tracks = Vec::with_capacity(lookups.len());
        for lookup in lookups {
            match lookup {
                Ok(Some(track)) => tracks.push(track),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if tracks.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        } else if tracks.len() < listing.len() {
            warn!("Spotify {}: {} of {} tracks not found", id, listing.len() - tracks.len(), listing.len());
        }
        Ok(playlist_or_not_found(tracks))
    }

    /// Best playable match for a Spotify track, tagged as Spotify.
    async fn find_spotify_track(&self, track: &SpotifyTrack) -> Result<Option<Track>, ResolveError> {
        let results = self.bounded(self.search.search(&track.search_query(), 1)).await?;
        Ok(first_playable(results).map(|mut found| {
            found.platform = Platform::Spotify;
            if found.duration.is_zero() {
                found.duration = Duration::from_secs(track.duration.as_secs());
            }
            found
        }))
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, ResolveError>>) -> Result<T, ResolveError> {
        tokio::time::timeout(self.options.timeout, call)
            .await
            .map_err(|_| ResolveError::Timeout(self.options.timeout.as_secs()))?
    }
}

fn first_playable(results: Vec<TrackMetadata>) -> Option<Track> {
    results.into_iter().find_map(TrackMetadata::into_track)
}

fn playlist_or_not_found(tracks: Vec<Track>) -> Resolved {
    if tracks.is_empty() {
        Resolved::NotFound
    } else {
        Resolved::Playlist(tracks)
    }
}
