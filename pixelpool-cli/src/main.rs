//! PixelPool CLI - load images through the pooled decode pipeline.
//!
//! Binds each given path to its own slot, drives the asynchronous decodes
//! to completion, and reports load states and cache statistics. Transitions
//! are logged as they happen (set `RUST_LOG=debug` for the full picture).

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pixelpool::config::PoolConfig;
use pixelpool::controller::{LoadObserver, LoadState};
use pixelpool::request::FileKey;
use pixelpool::service::PixelPool;

#[derive(Parser)]
#[command(name = "pixelpool")]
#[command(about = "Load images into a bounded pool of reusable pixel buffers", long_about = None)]
#[command(version = pixelpool::VERSION)]
struct Args {
    /// Image files to load
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Decode target width in pixels
    #[arg(long, default_value = "256")]
    width: u32,

    /// Decode target height in pixels
    #[arg(long, default_value = "256")]
    height: u32,

    /// Cache budget in mebibytes
    #[arg(long, default_value = "64")]
    budget_mib: usize,

    /// Decode worker count (defaults to available parallelism + 1)
    #[arg(long)]
    workers: Option<usize>,
}

/// Logs every load-state transition.
struct TransitionLogger;

impl LoadObserver<FileKey> for TransitionLogger {
    fn on_load_state(&self, key: Option<&FileKey>, state: LoadState) {
        match key {
            Some(key) => tracing::info!(%key, %state, "transition"),
            None => tracing::info!(%state, "transition"),
        }
    }
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    if args.width == 0 || args.height == 0 {
        eprintln!("Error: decode dimensions must be nonzero");
        process::exit(1);
    }
    if args.budget_mib == 0 {
        eprintln!("Error: cache budget must be nonzero");
        process::exit(1);
    }

    let mut config =
        PoolConfig::default().with_cache_budget_bytes(args.budget_mib * 1024 * 1024);
    if let Some(workers) = args.workers {
        if workers == 0 {
            eprintln!("Error: worker count must be nonzero");
            process::exit(1);
        }
        config = config.with_decode_workers(workers);
    }

    let pool: PixelPool<FileKey> = PixelPool::with_image_decoder(config);

    // One slot per path, bound in order so deliveries arrive in order.
    let mut slots = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        let slot = pool.controller(Arc::new(TransitionLogger));
        slot.set_decode_dimensions(args.width, args.height);
        slot.bind(Some(FileKey::new(path)));
        slots.push(slot);
    }

    for slot in &mut slots {
        slot.wait_completion().await;
    }

    let mut failures = 0usize;
    for (path, slot) in args.paths.iter().zip(&slots) {
        match slot.state() {
            LoadState::Loaded => {
                let buffer = slot.buffer().expect("loaded slot holds a buffer");
                println!(
                    "{}: loaded {} ({} bytes)",
                    path.display(),
                    buffer.dims(),
                    buffer.size_bytes()
                );
            }
            state => {
                failures += 1;
                println!("{}: {}", path.display(), state);
            }
        }
    }

    let stats = pool.cache_stats();
    println!(
        "cache: {} entries, {} bytes resident, {} hits / {} misses, {} evictions",
        stats.entry_count, stats.resident_bytes, stats.hits, stats.misses, stats.evictions
    );

    if failures > 0 {
        eprintln!("{} of {} images failed to load", failures, args.paths.len());
        process::exit(1);
    }
}
