use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{fmt, time::Duration};
use url::Url;

/// Service a track was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Spotify,
    SoundCloud,
    Other,
}

impl Platform {
    /// Classifies a link by host name.
    pub fn from_url(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return Self::Other;
        };
        let Some(host) = parsed.host_str() else {
            return Self::Other;
        };
        let host = host.to_ascii_lowercase();

        if host == "youtu.be" || host == "youtube.com" || host.ends_with(".youtube.com") {
            Self::YouTube
        } else if host == "spotify.com" || host.ends_with(".spotify.com") {
            Self::Spotify
        } else if host == "soundcloud.com" || host.ends_with(".soundcloud.com") {
            Self::SoundCloud
        } else {
            Self::Other
        }
    }

    /// Maps a yt-dlp extractor key (`Youtube`, `YoutubeTab`, `Soundcloud`...) to a platform.
    pub fn from_extractor(key: &str) -> Option<Self> {
        let key = key.to_ascii_lowercase();
        if key.starts_with("youtube") {
            Some(Self::YouTube)
        } else if key.starts_with("soundcloud") {
            Some(Self::SoundCloud)
        } else if key.starts_with("spotify") {
            Some(Self::Spotify)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::Spotify => "spotify",
            Self::SoundCloud => "soundcloud",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved, playable audio item.
///
/// `url` is always something the voice backend can stream. For tracks that
/// came from Spotify it points at the matching YouTube video while `platform`
/// keeps recording where the user found it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub url: String,
    pub duration: Duration,
    pub platform: Platform,
    pub requested_by: Option<UserId>,
    pub artist: Option<String>,
    pub thumbnail: Option<String>,
}

impl Track {
    pub fn new(title: impl Into<String>, url: impl Into<String>, duration: Duration, platform: Platform) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            // Whole seconds only.
            duration: Duration::from_secs(duration.as_secs()),
            platform,
            requested_by: None,
            artist: None,
            thumbnail: None,
        }
    }

    pub fn with_requester(mut self, user_id: Option<UserId>) -> Self {
        self.requested_by = user_id;
        self
    }

    pub fn with_artist(mut self, artist: String) -> Self {
        self.artist = Some(artist);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: String) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration.as_secs()
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title, format_clock(self.duration))
    }
}

/// `m:ss`, or `h:mm:ss` past the hour.
pub fn format_clock(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
