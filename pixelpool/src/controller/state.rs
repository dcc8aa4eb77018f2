//! Load states, observers, and per-slot statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::request::RequestKey;

/// Lifecycle state of a binding slot.
///
/// Normal progression is `Uninitialized → NotYetLoaded → Loading →
/// {Loaded | Failed}`. Rebinding resets to `Uninitialized` synchronously
/// and immediately re-evaluates the new key, so observers may see a
/// `Uninitialized` notification between two bindings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    /// No binding evaluated yet (or mid-rebind).
    #[default]
    Uninitialized,

    /// Bound to a key that missed the cache; decode not yet front of line.
    NotYetLoaded,

    /// The request reached the front of the delivery queue and is decoding.
    Loading,

    /// A buffer is held and available via `current_buffer`.
    Loaded,

    /// The bind was empty, the source was unavailable, or the decode
    /// failed. Terminal; a caller wanting a retry rebinds the key.
    Failed,
}

impl LoadState {
    /// Returns true for `Loaded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Loaded | Self::Failed)
    }

    /// Returns true if a buffer is held.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::NotYetLoaded => write!(f, "NotYetLoaded"),
            Self::Loading => write!(f, "Loading"),
            Self::Loaded => write!(f, "Loaded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Hook fired on every load-state transition.
///
/// The rendering collaborator typically redraws on each notification; this
/// crate never draws. Notifications run with no internal locks held, so an
/// observer may call back into the controller, but it must not block.
pub trait LoadObserver<K: RequestKey>: Send + Sync {
    /// Called after the slot transitions to `state` for `key` (`None` for
    /// an empty bind).
    fn on_load_state(&self, key: Option<&K>, state: LoadState);
}

/// Observer that ignores every notification.
#[derive(Debug, Default)]
pub struct NullObserver;

impl<K: RequestKey> LoadObserver<K> for NullObserver {
    fn on_load_state(&self, _key: Option<&K>, _state: LoadState) {}
}

/// Counters describing one slot's load activity.
///
/// `stale_discarded` makes the internal stale-result no-op path observable:
/// it counts decode outcomes that arrived for a superseded handle (or a
/// superseded binding) and were dropped without touching slot state.
#[derive(Debug, Default)]
pub struct LoadStats {
    cache_hits: AtomicU64,
    submissions: AtomicU64,
    loaded: AtomicU64,
    failed: AtomicU64,
    stale_discarded: AtomicU64,
}

impl LoadStats {
    /// Binds satisfied synchronously from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Decode jobs submitted.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Decodes delivered as `Loaded`.
    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Deliveries that ended in `Failed`.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Decode outcomes discarded as stale.
    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded.load(Ordering::Relaxed)
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_loaded(&self) {
        self.loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_discarded(&self) {
        self.stale_discarded.fetch_add(1, Ordering::Relaxed);
    }
}
