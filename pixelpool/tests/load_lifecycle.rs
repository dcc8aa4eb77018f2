//! Integration tests for the full bind → decode → deliver lifecycle.
//!
//! These tests drive several controllers against one shared cache,
//! aggregator, and executor, with a scripted decoder whose per-key gates
//! let each test dictate the order decodes complete in:
//! - idempotent rebind
//! - stale-result immunity across rapid rebinds
//! - request-order delivery over out-of-order completions
//! - forgotten expectations never gating their successors
//! - the reference-count invariant across slots sharing a key
//! - the capacity-two eviction scenario
//!
//! Run with: `cargo test --test load_lifecycle`

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use pixelpool::aggregator::CompletionAggregator;
use pixelpool::buffer::{Dimensions, Orientation, PooledBuffer};
use pixelpool::cache::BufferCache;
use pixelpool::controller::{LoadController, LoadObserver, LoadState, NullObserver};
use pixelpool::decode::{DecodeError, Decoder};
use pixelpool::executor::DecodeExecutor;
use pixelpool::request::{ByteSource, RequestKey, SourceError};

// ============================================================================
// Test Helpers
// ============================================================================

/// Buffer size produced by the scripted decoder: 100x1 RGBA = 400 bytes.
const BUFFER_BYTES: usize = 400;

/// Budget that fits exactly two scripted buffers.
const TWO_BUFFER_BUDGET: usize = 2 * BUFFER_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TestKey(&'static str);

impl RequestKey for TestKey {
    fn open_source(&self) -> Result<ByteSource, SourceError> {
        Ok(ByteSource::from_bytes(self.0.as_bytes().to_vec()))
    }
}

struct Gate {
    open: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            signal: Condvar::new(),
        })
    }

    fn wait_open(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.signal.wait(open).unwrap();
        }
    }

    fn release(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.signal.notify_all();
    }
}

/// Decoder whose completions are gated per key name.
///
/// Keys without a registered gate decode immediately. The produced buffer
/// is 100x1 with every byte set to the first byte of the key name, so
/// tests can tell whose pixels a slot ended up holding.
struct ScriptedDecoder {
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl ScriptedDecoder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gates: Mutex::new(HashMap::new()),
        })
    }

    /// Holds completions for `name` until [`release`](Self::release).
    fn hold(&self, name: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(name.to_string(), Gate::closed());
    }

    fn release(&self, name: &str) {
        let gate = self.gates.lock().unwrap().get(name).cloned();
        if let Some(gate) = gate {
            gate.release();
        }
    }
}

impl Decoder for ScriptedDecoder {
    fn decode(
        &self,
        source: ByteSource,
        _target: Dimensions,
        _recycled: Option<Vec<u8>>,
    ) -> Result<PooledBuffer, DecodeError> {
        let name_bytes = source
            .read_all()
            .map_err(|e| DecodeError::Decode(e.to_string()))?;
        let name = String::from_utf8_lossy(&name_bytes).to_string();

        let gate = self.gates.lock().unwrap().get(&name).cloned();
        if let Some(gate) = gate {
            gate.wait_open();
        }

        let fill = name_bytes.first().copied().unwrap_or(0);
        let dims = Dimensions::new((BUFFER_BYTES / 4) as u32, 1);
        Ok(PooledBuffer::new(
            vec![fill; BUFFER_BYTES],
            dims,
            Orientation::Deg0,
        ))
    }
}

/// Observer that appends the key name on every terminal delivery.
struct DeliveryRecorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl LoadObserver<TestKey> for DeliveryRecorder {
    fn on_load_state(&self, key: Option<&TestKey>, state: LoadState) {
        if state.is_terminal() {
            let name = key.map(|k| k.0.to_string()).unwrap_or_default();
            self.log.lock().unwrap().push(name);
        }
    }
}

struct Harness {
    cache: BufferCache<TestKey>,
    aggregator: CompletionAggregator<TestKey>,
    executor: DecodeExecutor,
    decoder: Arc<ScriptedDecoder>,
    deliveries: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(budget: usize) -> Self {
        let decoder = ScriptedDecoder::new();
        let cache = BufferCache::new(budget, 2);
        Self {
            cache: cache.clone(),
            aggregator: CompletionAggregator::new(),
            executor: DecodeExecutor::new(4, decoder.clone(), Some(Arc::new(cache))),
            decoder,
            deliveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn recording_controller(&self) -> LoadController<TestKey> {
        let controller = LoadController::new(
            self.cache.clone(),
            self.aggregator.clone(),
            self.executor.clone(),
            Arc::new(DeliveryRecorder {
                log: Arc::clone(&self.deliveries),
            }),
        );
        controller.set_decode_dimensions(100, 1);
        controller
    }

    fn silent_controller(&self) -> LoadController<TestKey> {
        let controller = LoadController::new(
            self.cache.clone(),
            self.aggregator.clone(),
            self.executor.clone(),
            Arc::new(NullObserver),
        );
        controller.set_decode_dimensions(100, 1);
        controller
    }

    fn delivered(&self) -> Vec<String> {
        self.deliveries.lock().unwrap().clone()
    }
}

async fn settle_stale(controller: &mut LoadController<TestKey>, expected: u64) {
    while controller.stats().stale_discarded() < expected {
        controller.pump();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_idempotent_rebind_submits_one_decode() {
    let harness = Harness::new(TWO_BUFFER_BUDGET);
    let mut slot = harness.silent_controller();

    slot.bind(Some(TestKey("A")));
    slot.bind(Some(TestKey("A")));
    slot.bind(Some(TestKey("A")));

    assert_eq!(slot.stats().submissions(), 1);
    assert!(slot.wait_completion().await);
    assert_eq!(slot.state(), LoadState::Loaded);
    assert_eq!(slot.stats().loaded(), 1);
}

#[tokio::test]
async fn test_cache_hit_path_is_synchronous() {
    let harness = Harness::new(TWO_BUFFER_BUDGET);

    let mut first = harness.silent_controller();
    first.bind(Some(TestKey("A")));
    first.wait_completion().await;

    let second = harness.silent_controller();
    second.bind(Some(TestKey("A")));

    assert_eq!(second.state(), LoadState::Loaded);
    assert_eq!(second.stats().submissions(), 0);
    assert_eq!(second.stats().cache_hits(), 1);
}

#[tokio::test]
async fn test_stale_result_immunity_across_rapid_rebind() {
    let harness = Harness::new(TWO_BUFFER_BUDGET);
    harness.decoder.hold("A");

    let mut slot = harness.silent_controller();
    slot.bind(Some(TestKey("A")));
    slot.bind(Some(TestKey("B")));

    assert!(slot.wait_completion().await);
    assert_eq!(slot.state(), LoadState::Loaded);

    // A's decode completes late; the slot must keep B's pixels.
    harness.decoder.release("A");
    settle_stale(&mut slot, 1).await;

    assert_eq!(slot.key(), Some(TestKey("B")));
    assert_eq!(slot.state(), LoadState::Loaded);
    let buffer = slot.buffer().unwrap();
    assert_eq!(buffer.pixels()[0], b'B');
    assert!(!harness.cache.contains(&TestKey("A")));
}

#[tokio::test]
async fn test_ordering_under_out_of_order_completion() {
    let harness = Harness::new(16 * BUFFER_BYTES);
    for name in ["K1", "K2", "K3"] {
        harness.decoder.hold(name);
    }

    let mut c1 = harness.recording_controller();
    let mut c2 = harness.recording_controller();
    let mut c3 = harness.recording_controller();

    c1.bind(Some(TestKey("K1")));
    c2.bind(Some(TestKey("K2")));
    c3.bind(Some(TestKey("K3")));

    // Completions arrive K3, K1, K2; deliveries must land K1, K2, K3.
    harness.decoder.release("K3");
    assert!(c3.wait_completion().await);
    assert_eq!(c3.state(), LoadState::NotYetLoaded, "K3 gated behind K1, K2");
    assert!(harness.delivered().is_empty());

    harness.decoder.release("K1");
    assert!(c1.wait_completion().await);
    assert_eq!(harness.delivered(), vec!["K1"]);
    assert_eq!(c3.state(), LoadState::NotYetLoaded, "K2 still pending");

    harness.decoder.release("K2");
    assert!(c2.wait_completion().await);
    assert_eq!(harness.delivered(), vec!["K1", "K2", "K3"]);
    assert_eq!(c3.state(), LoadState::Loaded);
}

#[tokio::test]
async fn test_forget_releases_the_gate() {
    let harness = Harness::new(16 * BUFFER_BYTES);
    for name in ["K1", "K2", "K3"] {
        harness.decoder.hold(name);
    }

    let mut c1 = harness.recording_controller();
    let c2 = harness.recording_controller();
    let mut c3 = harness.recording_controller();

    c1.bind(Some(TestKey("K1")));
    c2.bind(Some(TestKey("K2")));
    c3.bind(Some(TestKey("K3")));

    harness.decoder.release("K3");
    assert!(c3.wait_completion().await);
    assert_eq!(c3.state(), LoadState::NotYetLoaded);

    // Abandon K2 while K1 is still pending.
    c2.unbind();

    harness.decoder.release("K1");
    assert!(c1.wait_completion().await);

    // K3 must not wait on the forgotten K2.
    assert_eq!(c3.state(), LoadState::Loaded);
    let delivered = harness.delivered();
    let positions: Vec<&String> = delivered.iter().filter(|n| !n.is_empty()).collect();
    assert_eq!(positions, vec!["K1", "K3"]);

    // Unblock the abandoned decode so the worker can wind down.
    harness.decoder.release("K2");
}

#[tokio::test]
async fn test_refcount_matches_held_references() {
    let harness = Harness::new(16 * BUFFER_BYTES);

    let mut first = harness.silent_controller();
    first.bind(Some(TestKey("A")));
    first.wait_completion().await;
    assert_eq!(harness.cache.ref_count(&TestKey("A")), Some(1));

    let second = harness.silent_controller();
    let third = harness.silent_controller();
    second.bind(Some(TestKey("A")));
    third.bind(Some(TestKey("A")));
    assert_eq!(harness.cache.ref_count(&TestKey("A")), Some(3));

    second.unbind();
    assert_eq!(harness.cache.ref_count(&TestKey("A")), Some(2));

    first.unbind();
    third.unbind();
    assert_eq!(harness.cache.ref_count(&TestKey("A")), Some(0));
}

#[tokio::test]
async fn test_end_to_end_eviction_scenario() {
    // Capacity = two buffers. Load A and B, release both, then load C:
    // A (the LRU) is evicted and the cache holds {B, C}.
    let harness = Harness::new(TWO_BUFFER_BUDGET);

    let mut slot_a = harness.silent_controller();
    slot_a.bind(Some(TestKey("A")));
    assert!(slot_a.wait_completion().await);
    assert_eq!(slot_a.state(), LoadState::Loaded);

    let mut slot_b = harness.silent_controller();
    slot_b.bind(Some(TestKey("B")));
    assert!(slot_b.wait_completion().await);
    assert!(harness.cache.contains(&TestKey("A")));
    assert!(harness.cache.contains(&TestKey("B")));

    slot_a.unbind();
    slot_b.unbind();

    let mut slot_c = harness.silent_controller();
    slot_c.bind(Some(TestKey("C")));
    assert!(slot_c.wait_completion().await);

    assert!(!harness.cache.contains(&TestKey("A")), "LRU entry evicted");
    assert!(harness.cache.contains(&TestKey("B")));
    assert!(harness.cache.contains(&TestKey("C")));
    assert!(harness.cache.resident_bytes() <= harness.cache.budget_bytes());
}

#[tokio::test]
async fn test_rapid_rebind_storm_lands_on_final_key() {
    let harness = Harness::new(16 * BUFFER_BYTES);
    let mut slot = harness.silent_controller();

    for name in ["A", "B", "C", "D"] {
        slot.bind(Some(TestKey(name)));
    }

    assert!(slot.wait_completion().await);
    while slot.state() != LoadState::Loaded {
        slot.pump();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(slot.key(), Some(TestKey("D")));
    assert_eq!(slot.buffer().unwrap().pixels()[0], b'D');
}

#[tokio::test]
async fn test_unbind_mid_decode_discards_result() {
    let harness = Harness::new(TWO_BUFFER_BUDGET);
    harness.decoder.hold("A");

    let mut slot = harness.silent_controller();
    slot.bind(Some(TestKey("A")));
    slot.unbind();
    assert_eq!(slot.state(), LoadState::Failed);

    harness.decoder.release("A");
    settle_stale(&mut slot, 1).await;

    assert_eq!(slot.state(), LoadState::Failed);
    assert!(slot.buffer().is_none());
    assert!(!harness.cache.contains(&TestKey("A")));
}
