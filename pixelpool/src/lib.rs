//! pixelpool - Asynchronous image loading into pooled pixel buffers
//!
//! This library loads images identified by opaque request keys into a
//! bounded pool of reusable pixel buffers, decoding them asynchronously on
//! a bounded worker pool and notifying observers of load-state
//! transitions. Completions are delivered to observers in request order
//! even though decodes race and finish out of order.
//!
//! # High-Level API
//!
//! The [`service::PixelPool`] facade wires the shared pieces together; one
//! [`controller::LoadController`] drives each visual slot:
//!
//! ```ignore
//! use std::sync::Arc;
//! use pixelpool::config::PoolConfig;
//! use pixelpool::request::FileKey;
//! use pixelpool::service::PixelPool;
//!
//! let pool: PixelPool<FileKey> = PixelPool::with_image_decoder(PoolConfig::default());
//!
//! let mut slot = pool.controller(Arc::new(MyRedrawObserver));
//! slot.set_decode_dimensions(256, 256);
//! slot.bind(Some(FileKey::new("photo.jpg")));
//! slot.wait_completion().await;
//! ```

pub mod aggregator;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod controller;
pub mod decode;
pub mod executor;
pub mod request;
pub mod service;

pub use buffer::{Dimensions, Orientation, PooledBuffer};
pub use cache::{BufferCache, BufferLease, CacheError, CacheStats};
pub use controller::{LoadController, LoadObserver, LoadState, LoadStats};
pub use request::{ByteSource, FileKey, RequestKey, SourceError};
pub use service::PixelPool;

/// Version of the pixelpool library.
///
/// Synchronized across the workspace; injected at compile time from
/// `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
