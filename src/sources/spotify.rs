use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

use crate::error::ResolveError;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";
/// Largest page the tracks endpoints accept.
const PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotifyKind {
    Track,
    Playlist,
    Album,
}

impl SpotifyKind {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "track" => Some(Self::Track),
            "playlist" => Some(Self::Playlist),
            "album" => Some(Self::Album),
            _ => None,
        }
    }
}

/// Extracts kind and id from `https://open.spotify.com/...` links (with or
/// without an `intl-xx` prefix) and `spotify:kind:id` URIs.
pub fn parse_spotify_url(input: &str) -> Option<(SpotifyKind, String)> {
    if let Some(rest) = input.strip_prefix("spotify:") {
        let (kind, id) = rest.split_once(':')?;
        return Some((SpotifyKind::from_segment(kind)?, valid_id(id)?));
    }

    let url = Url::parse(input).ok()?;
    if !url.host_str()?.ends_with("spotify.com") {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let mut kind = segments.next()?;
    if kind.starts_with("intl-") {
        kind = segments.next()?;
    }
    Some((SpotifyKind::from_segment(kind)?, valid_id(segments.next()?)?))
}

fn valid_id(id: &str) -> Option<String> {
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())).then(|| id.to_string())
}

/// Minimal description of a Spotify track, enough to find it elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotifyTrack {
    pub name: String,
    pub artists: Vec<String>,
    pub duration: Duration,
}

impl SpotifyTrack {
    pub fn search_query(&self) -> String {
        if self.artists.is_empty() {
            self.name.clone()
        } else {
            format!("{} - {}", self.artists.join(", "), self.name)
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpotifyCatalog: Send + Sync {
    /// `None` when the id does not exist.
    async fn track(&self, id: &str) -> Result<Option<SpotifyTrack>, ResolveError>;

    /// Tracks of a playlist or album in order, at most `limit`.
    async fn collection(&self, kind: SpotifyKind, id: &str, limit: usize) -> Result<Vec<SpotifyTrack>, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiTrack {
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    #[serde(default)]
    duration_ms: u64,
}

impl From<ApiTrack> for SpotifyTrack {
    fn from(track: ApiTrack) -> Self {
        Self {
            name: track.name,
            artists: track.artists.into_iter().map(|a| a.name).collect(),
            duration: Duration::from_millis(track.duration_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<ApiTrack>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Spotify Web API client using the client-credentials flow.
pub struct SpotifyClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifyClient {
    pub fn new(http: reqwest::Client, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ResolveError> {
        if let Some(token) = self.token.lock().as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(ResolveError::Unavailable(format!(
                "spotify token request failed with {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await.map_err(malformed)?;
        // Refresh a minute early so in-flight requests never carry a stale token.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *self.token.lock() = Some(AccessToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!("Refreshed Spotify access token");
        Ok(token.access_token)
    }

    /// `Ok(None)` on 404.
    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>, ResolveError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Ok(None),
            status if status.is_success() => response.json().await.map(Some).map_err(malformed),
            status => Err(ResolveError::Unavailable(format!("spotify api returned {}", status))),
        }
    }
}

fn unavailable(err: reqwest::Error) -> ResolveError {
    ResolveError::Unavailable(err.to_string())
}

fn malformed(err: reqwest::Error) -> ResolveError {
    ResolveError::Malformed(err.to_string())
}

#[async_trait]
impl SpotifyCatalog for SpotifyClient {
    async fn track(&self, id: &str) -> Result<Option<SpotifyTrack>, ResolveError> {
        let track: Option<ApiTrack> = self.get(&format!("{}/tracks/{}", API_URL, id)).await?;
        Ok(track.map(SpotifyTrack::from))
    }

    async fn collection(&self, kind: SpotifyKind, id: &str, limit: usize) -> Result<Vec<SpotifyTrack>, ResolveError> {
        let mut tracks = Vec::new();
        let mut next = Some(match kind {
            SpotifyKind::Playlist => format!("{}/playlists/{}/tracks?limit={}", API_URL, id, PAGE_SIZE),
            SpotifyKind::Album => format!("{}/albums/{}/tracks?limit={}", API_URL, id, PAGE_SIZE),
            SpotifyKind::Track => return Ok(self.track(id).await?.into_iter().collect()),
        });

        while let Some(url) = next.take() {
            if tracks.len() >= limit {
                break;
            }
            next = match kind {
                SpotifyKind::Playlist => {
                    let Some(page) = self.get::<Page<PlaylistItem>>(&url).await? else {
                        break;
                    };
                    // Local files and removed tracks come back as null.
                    tracks.extend(page.items.into_iter().filter_map(|i| i.track).map(SpotifyTrack::from));
                    page.next
                }
                _ => {
                    let Some(page) = self.get::<Page<ApiTrack>>(&url).await? else {
                        break;
                    };
                    tracks.extend(page.items.into_iter().map(SpotifyTrack::from));
                    page.next
                }
            };
        }

        tracks.truncate(limit);
        info!("🎧 Spotify {:?} {}: {} track(s)", kind, id, tracks.len());
        Ok(tracks)
    }
}
