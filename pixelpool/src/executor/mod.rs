//! Bounded decode executor.
//!
//! The executor runs decode jobs on a bounded pool of blocking workers and
//! reports every job's outcome as a [`DecodeEvent`] on the channel the
//! submitter provided — success, failure, and cancellation all travel the
//! same way, exactly once per handle. Completion events arrive from worker
//! context; the submitting controller applies them on its own context.
//!
//! Cancellation is cooperative and best-effort: a job cancelled before it
//! acquires a worker never runs (and reports `Cancelled`); a job already
//! mid-decode runs to completion and reports its result, which the
//! controller discards as stale. Cancelling never blocks the caller.
//!
//! The executor is an injected capability, constructed by the service and
//! passed to controllers — never a process-wide singleton — so tests build
//! isolated pools with deterministic decoders.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::buffer::Dimensions;
use crate::cache::StorageRecycler;
use crate::decode::{DecodeError, DecodeOutcome, Decoder};
use crate::request::RequestKey;

/// Identity of one decode attempt.
///
/// Handles are never reused: a controller decides whether a completion is
/// stale by comparing handle identity, not key equality, because two
/// different binds can share an equal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decode-{}", self.0)
    }
}

/// A completed decode, as delivered to the submitting controller.
#[derive(Debug)]
pub struct DecodeEvent<K> {
    /// The handle returned by the `submit` call that started this job.
    pub handle: HandleId,
    /// The key the job was decoding.
    pub key: K,
    /// What the job produced.
    pub outcome: DecodeOutcome,
}

/// Channel end the executor reports completions to.
pub type CompletionSender<K> = mpsc::UnboundedSender<DecodeEvent<K>>;

/// Receiving end owned by the controller.
pub type CompletionReceiver<K> = mpsc::UnboundedReceiver<DecodeEvent<K>>;

/// Token for one submitted decode job.
pub struct DecodeHandle {
    id: HandleId,
    token: CancellationToken,
}

impl DecodeHandle {
    /// Returns the handle's identity.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Requests cancellation. Idempotent; never blocks.
    ///
    /// The job's completion event still fires exactly once (with a
    /// `Cancelled` failure if the job had not started).
    pub fn cancel(&self) {
        tracing::trace!(handle = %self.id, "cancel requested");
        self.token.cancel();
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for DecodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Bounded worker pool for decode jobs.
///
/// Cloning is cheap; all clones share the same workers.
#[derive(Clone)]
pub struct DecodeExecutor {
    shared: Arc<Shared>,
}

struct Shared {
    decoder: Arc<dyn Decoder>,
    recycler: Option<Arc<dyn StorageRecycler>>,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    workers: usize,
}

impl DecodeExecutor {
    /// Creates an executor with `workers` concurrent decode slots.
    ///
    /// # Arguments
    ///
    /// * `workers` - Maximum concurrent decodes (must be nonzero)
    /// * `decoder` - The decode implementation
    /// * `recycler` - Optional source of reusable pixel storage
    pub fn new(
        workers: usize,
        decoder: Arc<dyn Decoder>,
        recycler: Option<Arc<dyn StorageRecycler>>,
    ) -> Self {
        assert!(workers > 0, "decode executor needs at least one worker");
        Self {
            shared: Arc::new(Shared {
                decoder,
                recycler,
                permits: Arc::new(Semaphore::new(workers)),
                next_id: AtomicU64::new(0),
                workers,
            }),
        }
    }

    /// Returns the configured worker count.
    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    /// Enqueues a decode job and returns immediately.
    ///
    /// Exactly one [`DecodeEvent`] carrying the returned handle's id will
    /// be sent on `reply`, from worker context — never synchronously from
    /// this call.
    pub fn submit<K: RequestKey>(
        &self,
        key: K,
        target: Dimensions,
        reply: CompletionSender<K>,
    ) -> DecodeHandle {
        let id = HandleId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        let job_token = token.clone();
        let shared = Arc::clone(&self.shared);

        tracing::debug!(handle = %id, key = ?key, %target, "decode submitted");

        tokio::spawn(async move {
            let outcome = run_job(&shared, &job_token, key.clone(), target).await;
            if reply.send(DecodeEvent {
                handle: id,
                key,
                outcome,
            })
            .is_err()
            {
                tracing::trace!(handle = %id, "completion receiver dropped");
            }
        });

        DecodeHandle { id, token }
    }
}

impl fmt::Debug for DecodeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeExecutor")
            .field("workers", &self.shared.workers)
            .finish()
    }
}

/// Waits for a worker slot, then runs the decode on the blocking pool.
async fn run_job<K: RequestKey>(
    shared: &Arc<Shared>,
    token: &CancellationToken,
    key: K,
    target: Dimensions,
) -> DecodeOutcome {
    // A job cancelled while queued must not run.
    let permit = tokio::select! {
        _ = token.cancelled() => None,
        permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return DecodeOutcome::Failed(DecodeError::Cancelled);
    };
    if token.is_cancelled() {
        return DecodeOutcome::Failed(DecodeError::Cancelled);
    }

    let decoder = Arc::clone(&shared.decoder);
    let recycler = shared.recycler.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let source = match key.open_source() {
            Ok(source) => source,
            Err(e) => return Err(DecodeError::from(e)),
        };
        let recycled = recycler.as_ref().and_then(|r| r.reclaim(target));
        decoder.decode(source, target, recycled)
    })
    .await;

    match joined {
        Ok(Ok(buffer)) => DecodeOutcome::Decoded(buffer),
        Ok(Err(e)) => DecodeOutcome::Failed(e),
        Err(join_err) => DecodeOutcome::Failed(DecodeError::Worker(join_err.to_string())),
    }
}
