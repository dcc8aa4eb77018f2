//! The load controller: one binding slot's orchestration core.
//!
//! A [`LoadController`] binds a request key to a visual slot, resolves it
//! against the shared [`BufferCache`], dispatches decode work to the
//! [`DecodeExecutor`] on a miss, and routes completions through the
//! [`CompletionAggregator`] so observers see request-order delivery.
//!
//! # Threading
//!
//! `bind`, `unbind`, `set_decode_dimensions`, `pump`, and
//! `wait_completion` belong to the slot's owner context. Decode outcomes
//! arrive as [`DecodeEvent`] messages on the controller's channel and are
//! only applied when the owner drains them — workers never mutate slot
//! state directly. A delivery deferred by the aggregator later runs on
//! whichever controller context advances the ledger head; slot state sits
//! behind a mutex so that is safe, and a binding epoch recorded when the
//! completion was validated keeps a deferred delivery from touching a slot
//! that has since been rebound.
//!
//! # Staleness
//!
//! A decode result is applicable only if its handle is the slot's current
//! pending handle — key equality is not enough, because two different
//! binds can share an equal key. Results for superseded handles are
//! discarded (their storage offered back to the cache pool) and counted in
//! [`LoadStats::stale_discarded`].

mod state;

pub use state::{LoadObserver, LoadState, LoadStats, NullObserver};

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::aggregator::CompletionAggregator;
use crate::buffer::{Dimensions, PooledBuffer};
use crate::cache::{BufferCache, BufferLease};
use crate::decode::DecodeOutcome;
use crate::executor::{CompletionReceiver, CompletionSender, DecodeEvent, DecodeExecutor, DecodeHandle};
use crate::request::RequestKey;

struct Slot<K: RequestKey> {
    key: Option<K>,
    lease: Option<BufferLease<K>>,
    state: LoadState,
    pending: Option<DecodeHandle>,
    /// Whether the current key has a live aggregator expectation.
    expected: bool,
    decode_dims: Option<Dimensions>,
    /// Bumped on every bind; deliveries check it before applying.
    epoch: u64,
}

/// One binding slot: the asynchronous load lifecycle engine.
pub struct LoadController<K: RequestKey> {
    slot: Arc<Mutex<Slot<K>>>,
    cache: BufferCache<K>,
    aggregator: CompletionAggregator<K>,
    executor: DecodeExecutor,
    observer: Arc<dyn LoadObserver<K>>,
    stats: Arc<LoadStats>,
    events_tx: CompletionSender<K>,
    events_rx: CompletionReceiver<K>,
}

impl<K: RequestKey> LoadController<K> {
    /// Creates a controller over the shared cache, aggregator, and
    /// executor.
    pub fn new(
        cache: BufferCache<K>,
        aggregator: CompletionAggregator<K>,
        executor: DecodeExecutor,
        observer: Arc<dyn LoadObserver<K>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            slot: Arc::new(Mutex::new(Slot {
                key: None,
                lease: None,
                state: LoadState::Uninitialized,
                pending: None,
                expected: false,
                decode_dims: None,
                epoch: 0,
            })),
            cache,
            aggregator,
            executor,
            observer,
            stats: Arc::new(LoadStats::default()),
            events_tx,
            events_rx,
        }
    }

    /// Binds the slot to `key`, or fails it when `key` is `None`.
    ///
    /// Rebinding the key already bound is a no-op. Otherwise the slot is
    /// reset synchronously — pending decode cancelled, expectation
    /// forgotten, held buffer released — and the new key evaluated: a
    /// cache hit transitions to `Loaded` within this call; a miss parks
    /// the slot in `NotYetLoaded` and, once decode dimensions are known,
    /// registers an expectation and submits a decode.
    pub fn bind(&self, key: Option<K>) {
        // Reset under the lock; tear the old binding down after it.
        let (old_pending, old_lease, forget_key, reset_note) = {
            let mut slot = self.slot.lock().unwrap();
            if slot.key.is_some() && slot.key == key {
                tracing::trace!(key = ?key, "rebind of current key ignored");
                return;
            }
            slot.epoch += 1;
            let old_pending = slot.pending.take();
            let old_lease = slot.lease.take();
            let forget_key = if slot.expected { slot.key.take() } else { None };
            slot.expected = false;
            slot.key = key.clone();
            let changed = slot.state != LoadState::Uninitialized;
            slot.state = LoadState::Uninitialized;
            (old_pending, old_lease, forget_key, changed)
        };

        if let Some(handle) = old_pending {
            handle.cancel();
        }
        if let Some(old_key) = forget_key {
            self.aggregator.forget(&old_key);
        }
        drop(old_lease);
        if reset_note {
            self.observer.on_load_state(key.as_ref(), LoadState::Uninitialized);
        }

        // An empty bind is a terminal failure, not "not yet loaded".
        let Some(key) = key else {
            self.transition(LoadState::Failed);
            return;
        };

        match self.cache.checkout(&key) {
            Some(lease) => {
                {
                    let mut slot = self.slot.lock().unwrap();
                    slot.lease = Some(lease);
                    slot.state = LoadState::Loaded;
                }
                self.stats.record_cache_hit();
                self.observer.on_load_state(Some(&key), LoadState::Loaded);
            }
            None => {
                let dims = {
                    let mut slot = self.slot.lock().unwrap();
                    slot.state = LoadState::NotYetLoaded;
                    slot.decode_dims
                };
                self.observer
                    .on_load_state(Some(&key), LoadState::NotYetLoaded);
                match dims {
                    Some(dims) if !dims.is_empty() => self.start_decode(key, dims),
                    _ => {
                        tracing::trace!(key = ?key, "decode deferred until dimensions are set")
                    }
                }
            }
        }
    }

    /// Unbinds the slot. Equivalent to `bind(None)`.
    pub fn unbind(&self) {
        self.bind(None);
    }

    /// Sets the dimensions to decode into.
    ///
    /// A slot bound before its dimensions were known starts (or restarts)
    /// its decode now; a pending decode against the old dimensions is
    /// superseded.
    pub fn set_decode_dimensions(&self, width: u32, height: u32) {
        let dims = Dimensions::new(width, height);
        let (key, old_pending) = {
            let mut slot = self.slot.lock().unwrap();
            slot.decode_dims = Some(dims);
            let waiting = matches!(slot.state, LoadState::NotYetLoaded | LoadState::Loading);
            if dims.is_empty() || !waiting {
                (None, None)
            } else {
                (slot.key.clone(), slot.pending.take())
            }
        };

        if let Some(handle) = old_pending {
            handle.cancel();
        }
        if let Some(key) = key {
            self.start_decode(key, dims);
        }
    }

    /// Returns the current load state.
    pub fn state(&self) -> LoadState {
        self.slot.lock().unwrap().state
    }

    /// Returns the currently bound key, if any.
    pub fn key(&self) -> Option<K> {
        self.slot.lock().unwrap().key.clone()
    }

    /// Returns the held buffer, if the slot is loaded.
    pub fn buffer(&self) -> Option<PooledBuffer> {
        let slot = self.slot.lock().unwrap();
        slot.lease.as_ref().map(|lease| lease.buffer().clone())
    }

    /// Returns true if a decode is in flight for the current binding.
    pub fn has_pending_decode(&self) -> bool {
        self.slot.lock().unwrap().pending.is_some()
    }

    /// Returns this slot's load statistics.
    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// Applies every queued completion event without blocking.
    ///
    /// Returns the number of events applied. Intended for owners that poll
    /// (a frame loop); async owners use [`wait_completion`](Self::wait_completion).
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event);
            applied += 1;
        }
        applied
    }

    /// Waits until the decode pending for the current binding resolves.
    ///
    /// Stale events drained along the way are discarded. Returns `false`
    /// immediately when no decode is pending (cache hit, empty bind, or
    /// dimensions not yet set). Note the resulting delivery may still be
    /// deferred behind earlier requests in the aggregator; the final state
    /// then lands when those controllers drain their own completions.
    pub async fn wait_completion(&mut self) -> bool {
        loop {
            if !self.has_pending_decode() {
                return false;
            }
            match self.events_rx.recv().await {
                Some(event) => {
                    if self.apply_event(event) {
                        return true;
                    }
                }
                None => return false,
            }
        }
    }

    /// Validates one completion event against the pending handle and
    /// routes live results through the aggregator.
    ///
    /// Returns true if the event resolved the current pending decode.
    fn apply_event(&self, event: DecodeEvent<K>) -> bool {
        let resolved_epoch = {
            let mut slot = self.slot.lock().unwrap();
            let current = slot
                .pending
                .as_ref()
                .is_some_and(|handle| handle.id() == event.handle);
            if current {
                slot.pending = None;
                Some(slot.epoch)
            } else {
                None
            }
        };

        match resolved_epoch {
            None => {
                self.discard_stale(event);
                false
            }
            Some(epoch) => {
                let deliver = self.make_delivery(event.key.clone(), event.outcome, epoch);
                self.aggregator.execute(&event.key, deliver);
                true
            }
        }
    }

    /// Builds the delivery closure run by the aggregator, immediately or
    /// deferred. The closure re-checks the binding epoch: a rebind between
    /// validation and delivery turns it into a stale discard.
    fn make_delivery(
        &self,
        key: K,
        outcome: DecodeOutcome,
        epoch: u64,
    ) -> impl FnOnce() + Send + 'static {
        let slot = Arc::clone(&self.slot);
        let cache = self.cache.clone();
        let observer = Arc::clone(&self.observer);
        let stats = Arc::clone(&self.stats);

        move || {
            let mut guard = slot.lock().unwrap();
            if guard.epoch != epoch {
                drop(guard);
                stats.record_stale_discarded();
                tracing::debug!(key = ?key, "delivery superseded by rebind");
                if let DecodeOutcome::Decoded(buffer) = outcome {
                    cache.offer_storage(buffer);
                }
                return;
            }
            guard.expected = false;

            let new_state = match outcome {
                DecodeOutcome::Decoded(buffer) => {
                    let lease = cache.insert(key.clone(), buffer);
                    guard.lease = Some(lease);
                    guard.state = LoadState::Loaded;
                    stats.record_loaded();
                    LoadState::Loaded
                }
                DecodeOutcome::Failed(error) => {
                    tracing::debug!(key = ?key, %error, "decode failed");
                    guard.state = LoadState::Failed;
                    stats.record_failed();
                    LoadState::Failed
                }
            };
            drop(guard);
            observer.on_load_state(Some(&key), new_state);
        }
    }

    /// Registers the aggregator expectation and submits the decode.
    fn start_decode(&self, key: K, dims: Dimensions) {
        let slot = Arc::clone(&self.slot);
        let observer = Arc::clone(&self.observer);
        let epoch = self.slot.lock().unwrap().epoch;

        // Expectation first: if the ledger is empty the head observer
        // fires synchronously and flips the slot to Loading.
        self.aggregator.expect(key.clone(), move || {
            let mut guard = slot.lock().unwrap();
            if guard.epoch != epoch || guard.state != LoadState::NotYetLoaded {
                return;
            }
            guard.state = LoadState::Loading;
            let key = guard.key.clone();
            drop(guard);
            observer.on_load_state(key.as_ref(), LoadState::Loading);
        });

        let handle = self
            .executor
            .submit(key.clone(), dims, self.events_tx.clone());
        {
            let mut slot = self.slot.lock().unwrap();
            slot.pending = Some(handle);
            slot.expected = true;
        }
        self.stats.record_submission();
    }

    fn discard_stale(&self, event: DecodeEvent<K>) {
        self.stats.record_stale_discarded();
        tracing::debug!(
            handle = %event.handle,
            key = ?event.key,
            "discarding stale decode result"
        );
        if let DecodeOutcome::Decoded(buffer) = event.outcome {
            self.cache.offer_storage(buffer);
        }
    }

    fn transition(&self, new_state: LoadState) {
        let (changed, key) = {
            let mut slot = self.slot.lock().unwrap();
            let changed = slot.state != new_state;
            slot.state = new_state;
            (changed, slot.key.clone())
        };
        if changed {
            self.observer.on_load_state(key.as_ref(), new_state);
        }
    }
}

impl<K: RequestKey> std::fmt::Debug for LoadController<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock().unwrap();
        f.debug_struct("LoadController")
            .field("key", &slot.key)
            .field("state", &slot.state)
            .field("pending", &slot.pending.as_ref().map(|h| h.id()))
            .finish()
    }
}
