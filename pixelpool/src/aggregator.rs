//! Request-order serialization of out-of-order decode completions.
//!
//! Decodes run in parallel and finish in any order. When many slots are
//! bound near-simultaneously (a fast scroll through a list), letting
//! results appear in completion order looks jarring; the aggregator gives
//! observers the illusion of strictly sequential decoding.
//!
//! The ledger is an ordered sequence of expected keys. A completion for the
//! head key is delivered immediately; a completion for a later key is
//! buffered until everything ahead of it has been delivered or forgotten.
//! Forgetting a key (cancellation, rebind, unbind) removes its entry so an
//! abandoned request never blocks the requests behind it.
//!
//! Ordering is best-effort, delivery is mandatory: a completion for a key
//! with no ledger entry runs immediately.
//!
//! Delivery actions and head notifications always run after the ledger
//! lock has been dropped, on whichever context advanced the head.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::request::RequestKey;

/// A buffered delivery, run when its key reaches the head of the ledger.
pub type DeliveryAction = Box<dyn FnOnce() + Send>;

type HeadObserver = Box<dyn FnOnce() + Send>;

enum EntryState {
    /// Still decoding. The observer fires once when the entry becomes the
    /// head of the ledger (drives the `Loading` transition).
    Pending { on_head: Option<HeadObserver> },
    /// Decode finished before its turn; the delivery waits here.
    Completed { action: DeliveryAction },
}

struct Ledger<K> {
    order: VecDeque<K>,
    entries: HashMap<K, EntryState>,
}

impl<K: RequestKey> Ledger<K> {
    /// Pops deliverable work from the front of the ledger.
    ///
    /// Completed heads are drained in order; if the new head is still
    /// pending and has not been told it is first in line, its observer is
    /// handed back for the caller to fire. Runs under the lock; the
    /// returned work runs after it.
    fn drain_head(&mut self) -> (Vec<DeliveryAction>, Option<HeadObserver>) {
        let mut actions = Vec::new();
        let mut head_notice = None;

        while let Some(front) = self.order.front() {
            match self.entries.get_mut(front) {
                Some(EntryState::Completed { .. }) => {
                    let key = self.order.pop_front().expect("front exists");
                    if let Some(EntryState::Completed { action }) = self.entries.remove(&key) {
                        actions.push(action);
                    }
                }
                Some(EntryState::Pending { on_head }) => {
                    head_notice = on_head.take();
                    break;
                }
                None => {
                    // Entry removed but order not yet compacted; skip.
                    self.order.pop_front();
                }
            }
        }

        (actions, head_notice)
    }
}

/// Serializes completions from many concurrent bindings into request-order
/// delivery. Cloning is cheap; all clones share one ledger.
pub struct CompletionAggregator<K: RequestKey> {
    ledger: Arc<Mutex<Ledger<K>>>,
}

impl<K: RequestKey> Clone for CompletionAggregator<K> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
        }
    }
}

impl<K: RequestKey> Default for CompletionAggregator<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RequestKey> CompletionAggregator<K> {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                order: VecDeque::new(),
                entries: HashMap::new(),
            })),
        }
    }

    /// Appends `key` to the ledger.
    ///
    /// Call when a controller becomes the first to await the key — not on
    /// every rebind of an already-expected key; a duplicate expect keeps
    /// the existing entry and its position.
    ///
    /// `on_head` fires once, after the ledger lock is dropped, when the
    /// entry becomes the head while still pending (immediately, if the
    /// ledger was empty).
    pub fn expect(&self, key: K, on_head: impl FnOnce() + Send + 'static) {
        let notice = {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.entries.contains_key(&key) {
                tracing::trace!(key = ?key, "already expected");
                None
            } else {
                ledger.order.push_back(key.clone());
                ledger.entries.insert(
                    key.clone(),
                    EntryState::Pending {
                        on_head: Some(Box::new(on_head)),
                    },
                );
                if ledger.order.front() == Some(&key) {
                    match ledger.entries.get_mut(&key) {
                        Some(EntryState::Pending { on_head }) => on_head.take(),
                        _ => None,
                    }
                } else {
                    None
                }
            }
        };

        if let Some(notice) = notice {
            notice();
        }
    }

    /// Removes the ledger entry for `key`, dropping any buffered delivery.
    ///
    /// If the forgotten entry was the head, completions buffered behind it
    /// are delivered now — an abandoned request never gates its successors.
    pub fn forget(&self, key: &K) {
        let (actions, head_notice) = {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.entries.remove(key).is_none() {
                return;
            }
            tracing::trace!(key = ?key, "forgot expectation");
            if let Some(position) = ledger.order.iter().position(|k| k == key) {
                ledger.order.remove(position);
            }
            ledger.drain_head()
        };

        for action in actions {
            action();
        }
        if let Some(notice) = head_notice {
            notice();
        }
    }

    /// Routes a completed decode's delivery through the ledger.
    ///
    /// Head of the ledger: `action` runs now, the head advances, and any
    /// completed entries newly at the head cascade out behind it. Not the
    /// head: `action` is buffered until everything ahead has been delivered
    /// or forgotten. No entry at all (never expected, or already
    /// forgotten): `action` runs immediately.
    pub fn execute(&self, key: &K, action: impl FnOnce() + Send + 'static) {
        enum Routed {
            Immediate(DeliveryAction),
            Buffered,
            Head(Vec<DeliveryAction>, Option<HeadObserver>),
        }

        let routed = {
            let mut ledger = self.ledger.lock().unwrap();
            if !ledger.entries.contains_key(key) {
                Routed::Immediate(Box::new(action))
            } else if ledger.order.front() == Some(key) {
                ledger.order.pop_front();
                ledger.entries.remove(key);
                let (mut actions, head_notice) = ledger.drain_head();
                actions.insert(0, Box::new(action));
                Routed::Head(actions, head_notice)
            } else {
                match ledger.entries.get_mut(key) {
                    Some(state @ EntryState::Pending { .. }) => {
                        *state = EntryState::Completed {
                            action: Box::new(action),
                        };
                        Routed::Buffered
                    }
                    // A second completion for an equal key: the entry is
                    // already claimed, so this delivery cannot be ordered.
                    _ => Routed::Immediate(Box::new(action)),
                }
            }
        };

        match routed {
            Routed::Immediate(action) => {
                tracing::trace!(key = ?key, "no ledger entry; delivering immediately");
                action();
            }
            Routed::Buffered => {
                tracing::trace!(key = ?key, "completion buffered behind earlier requests");
            }
            Routed::Head(actions, head_notice) => {
                for action in actions {
                    action();
                }
                if let Some(notice) = head_notice {
                    notice();
                }
            }
        }
    }

    /// Number of entries currently expected or buffered.
    pub fn len(&self) -> usize {
        self.ledger.lock().unwrap().entries.len()
    }

    /// Returns true if nothing is expected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
