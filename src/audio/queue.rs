use rand::seq::SliceRandom;
use std::{collections::VecDeque, fmt, str::FromStr, time::Duration};
use tracing::{debug, info};

use super::track::Track;
use crate::error::MusicError;

pub const DEFAULT_VOLUME: u8 = 50;
pub const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "track" | "song" => Ok(Self::Track),
            "queue" | "all" => Ok(Self::Queue),
            other => Err(format!("unknown loop mode '{}'", other)),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Track => "track",
            Self::Queue => "queue",
        })
    }
}

/// Pending tracks of one guild plus the state that decides what plays next.
///
/// The current track is held outside the pending sequence while it streams.
/// In [`LoopMode::Queue`] every track that finishes is appended to `played`;
/// once `pending` runs dry the played tracks become the new pending sequence
/// so the cycle restarts in its original order.
#[derive(Debug)]
pub struct GuildQueue {
    pending: VecDeque<Track>,
    current: Option<Track>,
    played: Vec<Track>,
    loop_mode: LoopMode,
    volume: u8,
    volume_limit: u8,
    max_size: usize,
}

impl GuildQueue {
    pub fn new(max_size: usize, volume: u8) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            played: Vec::new(),
            loop_mode: LoopMode::Off,
            volume: volume.min(MAX_VOLUME),
            volume_limit: MAX_VOLUME,
            max_size,
        }
    }

    /// Appends a track, failing when the queue is at capacity.
    pub fn enqueue(&mut self, track: Track) -> Result<(), MusicError> {
        if self.free_slots() == 0 {
            return Err(MusicError::QueueFull(self.max_size));
        }

        debug!("➕ Queued: {}", track.title);
        self.pending.push_back(track);
        Ok(())
    }

    /// Appends as many tracks as fit and returns how many were taken.
    pub fn enqueue_all(&mut self, tracks: Vec<Track>) -> usize {
        let to_add = tracks.len().min(self.free_slots());
        self.pending.extend(tracks.into_iter().take(to_add));

        debug!("➕ Queued {} tracks", to_add);
        to_add
    }

    /// Picks the next track to stream and makes it current.
    pub fn dequeue_next(&mut self) -> Option<Track> {
        if self.loop_mode == LoopMode::Track {
            if let Some(current) = &self.current {
                debug!("🔂 Repeating: {}", current.title);
                return Some(current.clone());
            }
        }

        if self.loop_mode == LoopMode::Queue {
            if let Some(finished) = self.current.take() {
                self.played.push(finished);
            }
            if self.pending.is_empty() && !self.played.is_empty() {
                debug!("🔁 Restarting queue loop with {} tracks", self.played.len());
                self.pending.extend(self.played.drain(..));
            }
        }

        self.current = self.pending.pop_front();
        self.current.clone()
    }

    /// Removes the track at a 1-based position of the pending sequence.
    pub fn remove_at(&mut self, position: usize) -> Option<Track> {
        if position == 0 || position > self.pending.len() {
            return None;
        }

        let removed = self.pending.remove(position - 1);
        if let Some(track) = &removed {
            debug!("❌ Removed #{}: {}", position, track.title);
        }
        removed
    }

    /// Uniform permutation of the pending tracks. The current track is not touched.
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.pending.make_contiguous().shuffle(&mut rng);
        info!("🔀 Shuffled {} tracks", self.pending.len());
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        if mode == self.loop_mode {
            return;
        }
        // A fresh queue cycle starts from whatever is current and pending right
        // now; the previous cycle's history is not carried across modes.
        self.played.clear();
        self.loop_mode = mode;

        match mode {
            LoopMode::Off => info!("➡️ Loop disabled"),
            LoopMode::Track => info!("🔂 Looping current track"),
            LoopMode::Queue => info!("🔁 Looping queue"),
        }
    }

    /// Stores the volume clamped into `0..=volume_limit` and returns the stored value.
    pub fn set_volume(&mut self, level: i64) -> u8 {
        self.volume = level.clamp(0, i64::from(self.volume_limit)) as u8;
        self.volume
    }

    /// Caps future volume changes; a louder current volume is lowered to the cap.
    pub fn set_volume_limit(&mut self, limit: u8) {
        self.volume_limit = limit.min(MAX_VOLUME);
        self.volume = self.volume.min(self.volume_limit);
    }

    /// Pages past the end show the last page.
    pub fn paginate(&self, page: usize, per_page: usize) -> QueuePage {
        let per_page = per_page.max(1);
        let total_tracks = self.pending.len();
        let total_pages = total_tracks.div_ceil(per_page).max(1);
        let page = page.clamp(1, total_pages);

        let tracks = self
            .pending
            .iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .cloned()
            .collect();

        QueuePage {
            tracks,
            page,
            total_pages,
            total_tracks,
        }
    }

    /// Sum of the pending tracks' durations. The current track is excluded.
    pub fn total_duration(&self) -> Duration {
        self.pending.iter().map(|track| track.duration).sum()
    }

    /// Forgets the current track so a loop cannot select it again.
    pub fn drop_current(&mut self) -> Option<Track> {
        self.current.take()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.played.clear();
        self.current = None;
        debug!("🗑️ Queue cleared");
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Upper bound on how many dequeues can yield distinct tracks in a row.
    pub fn cycle_len(&self) -> usize {
        self.pending.len() + self.played.len() + usize::from(self.current.is_some())
    }

    /// In queue loop the played tracks return to pending on the next
    /// restart, so they count against the limit too.
    pub fn free_slots(&self) -> usize {
        let held = match self.loop_mode {
            LoopMode::Queue => self.pending.len() + self.played.len(),
            _ => self.pending.len(),
        };
        self.max_size.saturating_sub(held)
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn volume_limit(&self) -> u8 {
        self.volume_limit
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Tracks already queued beyond a lowered limit stay queued.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.pending.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuePage {
    pub tracks: Vec<Track>,
    pub page: usize,
    pub total_pages: usize,
    pub total_tracks: usize,
}

impl QueuePage {
    /// Page shown for a guild without a player.
    pub fn empty() -> Self {
        Self {
            tracks: Vec::new(),
            page: 1,
            total_pages: 1,
            total_tracks: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::Platform;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn track(title: &str, secs: u64) -> Track {
        Track::new(
            title,
            format!("https://youtu.be/{}", title),
            Duration::from_secs(secs),
            Platform::YouTube,
        )
    }

    fn queue_of(titles: &[&str]) -> GuildQueue {
        let mut queue = GuildQueue::new(100, DEFAULT_VOLUME);
        for title in titles {
            queue.enqueue(track(title, 60)).unwrap();
        }
        queue
    }

    fn next_title(queue: &mut GuildQueue) -> Option<String> {
        queue.dequeue_next().map(|t| t.title)
    }

    #[test]
    fn test_track_loop_repeats_without_consuming() {
        let mut queue = queue_of(&["a", "b"]);
        assert_eq!(next_title(&mut queue).as_deref(), Some("a"));

        queue.set_loop_mode(LoopMode::Track);
        for _ in 0..5 {
            assert_eq!(next_title(&mut queue).as_deref(), Some("a"));
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_track_loop_without_current_pops_head() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Track);
        assert_eq!(next_title(&mut queue).as_deref(), Some("a"));
        assert_eq!(next_title(&mut queue).as_deref(), Some("a"));
    }

    #[test]
    fn test_queue_loop_restarts_in_original_order() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.set_loop_mode(LoopMode::Queue);

        let played: Vec<_> = (0..9).filter_map(|_| next_title(&mut queue)).collect();
        assert_eq!(played, ["a", "b", "c", "a", "b", "c", "a", "b", "c"]);
        // No duplicates pile up in pending across cycles.
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.cycle_len(), 3);
    }

    #[test]
    fn test_queue_loop_includes_track_current_when_enabled() {
        let mut queue = queue_of(&["a", "b"]);
        assert_eq!(next_title(&mut queue).as_deref(), Some("a"));

        queue.set_loop_mode(LoopMode::Queue);
        let played: Vec<_> = (0..4).filter_map(|_| next_title(&mut queue)).collect();
        assert_eq!(played, ["b", "a", "b", "a"]);
    }

    #[test]
    fn test_leaving_queue_loop_clears_played_tracks() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Queue);
        next_title(&mut queue);
        next_title(&mut queue);

        queue.set_loop_mode(LoopMode::Off);
        assert_eq!(next_title(&mut queue), None);
        assert_eq!(queue.current(), None);
    }

    #[test]
    fn test_volume_is_clamped() {
        let mut queue = GuildQueue::new(10, DEFAULT_VOLUME);
        assert_eq!(queue.volume(), 50);
        assert_eq!(queue.set_volume(-5), 0);
        assert_eq!(queue.set_volume(150), 100);
        assert_eq!(queue.set_volume(42), 42);
        assert_eq!(GuildQueue::new(10, 200).volume(), 100);
    }

    #[test]
    fn test_volume_limit_caps_volume() {
        let mut queue = GuildQueue::new(10, 80);

        queue.set_volume_limit(60);
        assert_eq!(queue.volume(), 60);
        assert_eq!(queue.set_volume(90), 60);
        assert_eq!(queue.set_volume(30), 30);

        // Raising the cap leaves the current volume alone.
        queue.set_volume_limit(200);
        assert_eq!(queue.volume_limit(), 100);
        assert_eq!(queue.volume(), 30);
        assert_eq!(queue.set_volume(150), 100);
    }

    #[test]
    fn test_remove_at_bounds() {
        let mut queue = queue_of(&["a", "b", "c"]);

        assert_eq!(queue.remove_at(0), None);
        assert_eq!(queue.remove_at(4), None);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.remove_at(2).map(|t| t.title).as_deref(), Some("b"));
        let remaining: Vec<_> = queue.tracks().map(|t| t.title.as_str()).collect();
        assert_eq!(remaining, ["a", "c"]);
    }

    #[test]
    fn test_total_duration_counts_pending_only() {
        let mut queue = GuildQueue::new(10, DEFAULT_VOLUME);
        queue.enqueue(track("a", 120)).unwrap();
        queue.enqueue(track("b", 180)).unwrap();
        assert_eq!(queue.total_duration(), Duration::from_secs(300));

        queue.dequeue_next();
        assert_eq!(queue.total_duration(), Duration::from_secs(180));
    }

    #[test]
    fn test_paginate() {
        let empty = GuildQueue::new(10, DEFAULT_VOLUME);
        let page = empty.paginate(1, 10);
        assert_eq!(page.total_pages, 1);
        assert!(page.tracks.is_empty());

        let titles: Vec<String> = (1..=12).map(|i| format!("t{}", i)).collect();
        let mut queue = GuildQueue::new(100, DEFAULT_VOLUME);
        for title in &titles {
            queue.enqueue(track(title, 30)).unwrap();
        }

        let second = queue.paginate(2, 5);
        assert_eq!(second.total_pages, 3);
        let names: Vec<_> = second.tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(names, ["t6", "t7", "t8", "t9", "t10"]);

        assert_eq!(queue.paginate(3, 5).tracks.len(), 2);
        // Page 0 is the first page, anything past the end the last one.
        assert_eq!(queue.paginate(0, 5).page, 1);
        let last = queue.paginate(9, 5);
        assert_eq!(last.page, 3);
        assert_eq!(last.tracks.len(), 2);

        let huge = queue.paginate(usize::MAX, 10);
        assert_eq!((huge.page, huge.total_pages), (2, 2));
        assert_eq!(huge.tracks.len(), 2);
        assert_eq!(empty.paginate(usize::MAX, usize::MAX).page, 1);
    }

    #[test]
    fn test_capacity() {
        let mut queue = GuildQueue::new(2, DEFAULT_VOLUME);
        queue.enqueue(track("a", 1)).unwrap();
        queue.enqueue(track("b", 1)).unwrap();
        assert!(matches!(queue.enqueue(track("c", 1)), Err(MusicError::QueueFull(2))));

        queue.dequeue_next();
        let added = queue.enqueue_all(vec![track("x", 1), track("y", 1), track("z", 1)]);
        assert_eq!(added, 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_queue_loop_capacity_counts_played_tracks() {
        let mut queue = GuildQueue::new(3, DEFAULT_VOLUME);
        queue.set_loop_mode(LoopMode::Queue);
        for title in ["a", "b", "c"] {
            queue.enqueue(track(title, 1)).unwrap();
        }

        next_title(&mut queue);
        next_title(&mut queue);
        assert_eq!(queue.free_slots(), 1);
        queue.enqueue(track("d", 1)).unwrap();
        assert!(matches!(queue.enqueue(track("e", 1)), Err(MusicError::QueueFull(3))));

        let played: Vec<_> = (0..8).filter_map(|_| next_title(&mut queue)).collect();
        assert_eq!(played, ["c", "d", "a", "b", "c", "d", "a", "b"]);
        assert!(queue.len() <= 3);
    }

    proptest! {
        #[test]
        fn fifo_order_with_loop_off(durations in prop::collection::vec(0u64..900, 0..40)) {
            let mut queue = GuildQueue::new(100, DEFAULT_VOLUME);
            for (i, secs) in durations.iter().enumerate() {
                queue.enqueue(track(&format!("t{}", i), *secs)).unwrap();
            }

            for i in 0..durations.len() {
                prop_assert_eq!(next_title(&mut queue), Some(format!("t{}", i)));
            }
            prop_assert_eq!(queue.dequeue_next(), None);
        }

        #[test]
        fn shuffle_preserves_tracks(count in 0usize..40, advance in any::<bool>()) {
            let mut queue = GuildQueue::new(100, DEFAULT_VOLUME);
            for i in 0..count {
                queue.enqueue(track(&format!("t{}", i), i as u64)).unwrap();
            }
            if advance {
                queue.dequeue_next();
            }
            let current_before = queue.current().cloned();
            let mut before: Vec<_> = queue.tracks().map(|t| t.title.clone()).collect();

            queue.shuffle();

            let mut after: Vec<_> = queue.tracks().map(|t| t.title.clone()).collect();
            prop_assert_eq!(after.len(), before.len());
            before.sort();
            after.sort();
            prop_assert_eq!(after, before);
            prop_assert_eq!(queue.current().cloned(), current_before);
        }
    }
}
