use async_process::{Command, Stdio};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{sync::LazyLock, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{SearchBackend, TrackMetadata};
use crate::error::ResolveError;

/// Concurrent yt-dlp processes allowed at once.
const MAX_CONCURRENT_PROCESSES: usize = 3;

static NETWORK_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(unable to download|urlopen error|timed out|temporary failure|connection (refused|reset)|name or service not known|HTTP Error 5\d\d|HTTP Error 429)")
        .unwrap()
});

const UNAVAILABLE_TITLES: [&str; 2] = ["[Private video]", "[Deleted video]"];

/// Entry printed by `yt-dlp --dump-json`. Flat playlist entries carry far
/// fewer fields than full extractions, hence all the options.
#[derive(Debug, Deserialize)]
struct YtDlpEntry {
    title: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<YtDlpThumbnail>,
    extractor_key: Option<String>,
    ie_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: String,
}

impl From<YtDlpEntry> for TrackMetadata {
    fn from(entry: YtDlpEntry) -> Self {
        let url = entry.webpage_url.or(entry.url).map(|u| normalize_url(&u, entry.ie_key.as_deref()));
        Self {
            title: entry.title.unwrap_or_else(|| "Unknown title".to_string()),
            url,
            duration: entry
                .duration
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(Duration::from_secs_f64),
            artist: entry.uploader.or(entry.channel),
            thumbnail: entry.thumbnail.or_else(|| entry.thumbnails.into_iter().last().map(|t| t.url)),
            extractor: entry.extractor_key.or(entry.ie_key),
        }
    }
}

/// Flat YouTube entries sometimes carry a bare video id as `url`.
fn normalize_url(url: &str, ie_key: Option<&str>) -> String {
    if url.starts_with("http") || ie_key != Some("Youtube") {
        url.to_string()
    } else {
        format!("https://www.youtube.com/watch?v={}", url)
    }
}

/// [`SearchBackend`] backed by the `yt-dlp` binary.
pub struct YtDlpClient {
    binary: String,
    permits: Semaphore,
}

impl YtDlpClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            permits: Semaphore::new(MAX_CONCURRENT_PROCESSES),
        }
    }

    /// Installed version, used by the health check.
    pub async fn version(&self) -> Result<String, ResolveError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("{} not callable: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(ResolveError::Unavailable(format!("{} --version failed", self.binary)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: &[String]) -> Result<Vec<TrackMetadata>, ResolveError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ResolveError::Unavailable("yt-dlp client closed".into()))?;

        debug!("Running {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(["--dump-json", "--flat-playlist", "--skip-download", "--no-warnings"])
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("could not run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if NETWORK_FAILURE.is_match(&stderr) {
                warn!("yt-dlp could not reach the network: {}", stderr.trim());
                return Err(ResolveError::Unavailable(first_line(&stderr)));
            }
            // Unsupported or removed media: nothing usable, not an outage.
            debug!("yt-dlp found nothing: {}", stderr.trim());
            return Ok(Vec::new());
        }

        Ok(parse_entries(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn first_line(text: &str) -> String {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("yt-dlp failed").trim().to_string()
}

/// One JSON document per line; unreadable lines are skipped.
fn parse_entries(stdout: &str) -> Vec<TrackMetadata> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<YtDlpEntry>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable yt-dlp line: {}", e);
                None
            }
        })
        .filter(|entry| {
            entry
                .title
                .as_deref()
                .is_none_or(|title| !UNAVAILABLE_TITLES.contains(&title))
        })
        .map(TrackMetadata::from)
        .collect()
}

#[async_trait]
impl SearchBackend for YtDlpClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<TrackMetadata>, ResolveError> {
        let limit = limit.max(1);
        let target = if query.starts_with("http://") || query.starts_with("https://") {
            vec!["--no-playlist".to_string(), query.to_string()]
        } else {
            vec![format!("ytsearch{}:{}", limit, query)]
        };

        let mut results = self.run(&target).await?;
        results.truncate(limit);
        info!("🔍 yt-dlp: {} result(s) for '{}'", results.len(), query);
        Ok(results)
    }

    async fn resolve_playlist(&self, url: &str, limit: usize) -> Result<Vec<TrackMetadata>, ResolveError> {
        let args = vec![
            "--yes-playlist".to_string(),
            "--playlist-end".to_string(),
            limit.max(1).to_string(),
            url.to_string(),
        ];

        let entries = self.run(&args).await?;
        info!("📃 yt-dlp: playlist with {} entries", entries.len());
        Ok(entries)
    }
}
