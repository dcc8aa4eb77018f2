//! High-level facade wiring the pool's components together.
//!
//! Most callers construct one [`PixelPool`] per process (or per screen)
//! and mint a [`LoadController`] per visual slot. The pool owns the shared
//! cache, the completion aggregator, and the decode executor; controllers
//! borrow clones of all three.

use std::sync::Arc;

use crate::aggregator::CompletionAggregator;
use crate::cache::{BufferCache, CacheStats};
use crate::config::PoolConfig;
use crate::controller::{LoadController, LoadObserver, NullObserver};
use crate::decode::{Decoder, ImageDecoder};
use crate::executor::DecodeExecutor;
use crate::request::RequestKey;

/// Shared loading infrastructure for a set of binding slots.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use pixelpool::config::PoolConfig;
/// use pixelpool::controller::NullObserver;
/// use pixelpool::request::FileKey;
/// use pixelpool::service::PixelPool;
///
/// # async fn demo() {
/// let pool: PixelPool<FileKey> = PixelPool::with_image_decoder(PoolConfig::default());
/// let controller = pool.controller(Arc::new(NullObserver));
/// controller.set_decode_dimensions(256, 256);
/// controller.bind(Some(FileKey::new("photo.jpg")));
/// # }
/// ```
pub struct PixelPool<K: RequestKey> {
    cache: BufferCache<K>,
    aggregator: CompletionAggregator<K>,
    executor: DecodeExecutor,
}

impl<K: RequestKey> PixelPool<K> {
    /// Creates a pool with the given decoder.
    pub fn new(config: PoolConfig, decoder: Arc<dyn Decoder>) -> Self {
        let cache = BufferCache::new(config.cache_budget_bytes, config.free_pool_depth);
        let executor = DecodeExecutor::new(
            config.effective_workers(),
            decoder,
            Some(Arc::new(cache.clone())),
        );
        tracing::info!(
            budget = config.cache_budget_bytes,
            workers = executor.workers(),
            "pixel pool ready"
        );
        Self {
            cache,
            aggregator: CompletionAggregator::new(),
            executor,
        }
    }

    /// Creates a pool using the default [`ImageDecoder`].
    pub fn with_image_decoder(config: PoolConfig) -> Self {
        Self::new(config, Arc::new(ImageDecoder::new()))
    }

    /// Mints a controller for one binding slot.
    pub fn controller(&self, observer: Arc<dyn LoadObserver<K>>) -> LoadController<K> {
        LoadController::new(
            self.cache.clone(),
            self.aggregator.clone(),
            self.executor.clone(),
            observer,
        )
    }

    /// Mints a controller with no observer.
    pub fn silent_controller(&self) -> LoadController<K> {
        self.controller(Arc::new(NullObserver))
    }

    /// Returns the shared buffer cache.
    pub fn cache(&self) -> &BufferCache<K> {
        &self.cache
    }

    /// Returns a snapshot of the cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
