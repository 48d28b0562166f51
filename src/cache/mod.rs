//! # Cache Module
//!
//! Bounded, TTL-aware caching for query resolution.
//!
//! Resolving a query means spawning yt-dlp or calling the Spotify API, which
//! takes seconds. Popular queries ("lofi", a viral link pasted in several
//! guilds) are resolved once and served from memory afterwards.
//!
//! ## Behaviour
//!
//! - **TTL**: entries expire after a configurable time (`SEARCH_CACHE_TTL_SECS`)
//! - **LRU eviction**: when full, the least recently read entry is dropped
//! - **Thread safety**: backed by [`dashmap::DashMap`], clones share storage
//! - **Disable**: `SEARCH_CACHE_SIZE=0` turns caching off
//!
//! Expired entries are also purged by the hourly maintenance task started
//! when the bot becomes ready.

pub mod lru_cache;

pub use lru_cache::LRUCache;
