use thiserror::Error;

/// Errors that stop a requested music operation from starting.
///
/// Faults that happen after playback is underway (a stream dying mid-track,
/// a dropped voice link) are handled inside the guild player and never reach
/// the command layer.
#[derive(Debug, Error)]
pub enum MusicError {
    /// Voice handshake failed or did not finish in time.
    #[error("could not connect to the voice channel: {0}")]
    Connection(String),

    /// Search or streaming backend unreachable. Worth retrying later.
    #[error("music backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Query could not be turned into tracks for a reason other than "no results".
    #[error("could not resolve query: {0}")]
    Resolution(String),

    #[error("the queue is full ({0} tracks)")]
    QueueFull(usize),

    /// Every requested track is longer than the guild allows (seconds).
    #[error("tracks longer than {0}s are not allowed")]
    TrackTooLong(u64),
}

impl MusicError {
    /// Whether the user can reasonably try the same command again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Connection(_))
    }
}

/// Failure modes of a search backend call.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("search backend unreachable: {0}")]
    Unavailable(String),

    #[error("search backend timed out after {0}s")]
    Timeout(u64),

    #[error("search backend returned unusable data: {0}")]
    Malformed(String),

    #[error("{0}")]
    Unsupported(String),
}

impl From<ResolveError> for MusicError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unavailable(_) | ResolveError::Timeout(_) => {
                MusicError::BackendUnavailable(err.to_string())
            }
            ResolveError::Malformed(msg) | ResolveError::Unsupported(msg) => MusicError::Resolution(msg),
        }
    }
}

/// Failures reported by the voice backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("voice connection failed: {0}")]
    Connect(String),

    #[error("no voice connection for this guild")]
    NotConnected,

    #[error("stream could not be started: {0}")]
    Stream(String),

    #[error("session {0} is no longer active")]
    UnknownSession(u64),

    #[error("voice backend unavailable: {0}")]
    Unavailable(String),
}
