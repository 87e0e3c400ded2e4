//! imgpool CLI: inspect pool configuration and stress a pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use imgpool_core::config::PoolConfig;
use imgpool_core::memory::{MemoryTrimType, TrimmableRegistryImpl};
use imgpool_mem::{PeakUsageTracker, PoolFactory, PoolStatsSource, PoolStatsTracker, PoolTrackers};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgpool")]
#[command(about = "Inspect and stress bounded-memory image pools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective pool configuration (after env overrides) as JSON
    Params,

    /// Run concurrent get/release cycles against one pool and print its stats
    Stress {
        /// Pool to exercise
        #[arg(long, value_enum, default_value = "native")]
        pool: PoolKind,

        /// Worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Get/release cycles per thread
        #[arg(long, default_value_t = 1000)]
        iterations: usize,

        /// Requested size in bytes
        #[arg(long, default_value_t = 16384)]
        size: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PoolKind {
    Native,
    Bytes,
    Bitmap,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Params => {
            if let Err(e) = print_params() {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Stress {
            pool,
            threads,
            iterations,
            size,
        } => {
            if let Err(e) = run_stress(pool, threads, iterations, size) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn print_params() -> Result<(), Box<dyn std::error::Error>> {
    let config = PoolConfig::from_env();
    config.validate()?;
    println!("{}", config.to_json()?);
    Ok(())
}

fn run_stress(
    kind: PoolKind,
    threads: usize,
    iterations: usize,
    size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    if threads == 0 {
        return Err("threads must be positive".into());
    }

    let registry = Arc::new(TrimmableRegistryImpl::new());
    let tracker = Arc::new(PeakUsageTracker::new());
    let shared: Arc<dyn PoolStatsTracker> = tracker.clone();
    let trackers = PoolTrackers {
        bitmap: shared.clone(),
        native_memory_chunk: shared.clone(),
        small_byte_array: shared,
    };
    let factory = PoolFactory::with_registry(PoolConfig::from_env(), registry.clone(), trackers)?;

    let started = Instant::now();
    let (before_trim, failures) = match kind {
        PoolKind::Native => {
            let pool = factory.native_memory_chunk_pool()?.clone();
            let failures = spawn_workers(threads, iterations, move || {
                let chunk = pool.get(size)?;
                chunk.write(0, &[0xAB])?;
                pool.release(chunk);
                Ok(())
            })?;
            (factory.native_memory_chunk_pool()?.stats(), failures)
        }
        PoolKind::Bytes => {
            let pool = factory.small_byte_array_pool()?.clone();
            let failures = spawn_workers(threads, iterations, move || {
                let array = pool.get(size)?;
                pool.release(array);
                Ok(())
            })?;
            (factory.small_byte_array_pool()?.stats(), failures)
        }
        PoolKind::Bitmap => {
            let pool = factory.bitmap_pool()?.clone();
            let failures = spawn_workers(threads, iterations, move || {
                let bitmap = pool.get(size)?;
                pool.release(bitmap);
                Ok(())
            })?;
            (factory.bitmap_pool()?.stats(), failures)
        }
    };
    let elapsed = started.elapsed();

    registry.trim_all(MemoryTrimType::OnAppBackgrounded);
    let after_trim = match kind {
        PoolKind::Native => factory.native_memory_chunk_pool()?.stats(),
        PoolKind::Bytes => factory.small_byte_array_pool()?.stats(),
        PoolKind::Bitmap => factory.bitmap_pool()?.stats(),
    };

    let report = serde_json::json!({
        "pool": format!("{:?}", kind).to_lowercase(),
        "threads": threads,
        "iterations": iterations,
        "size": size,
        "elapsed_ms": elapsed.as_millis() as u64,
        "failures": failures,
        "stats": sorted(before_trim),
        "stats_after_trim": sorted(after_trim),
        "usage": tracker.counts(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run `cycle` `iterations` times on each of `threads` threads. Returns the
/// number of failed cycles.
fn spawn_workers<F>(threads: usize, iterations: usize, cycle: F) -> Result<usize, Box<dyn std::error::Error>>
where
    F: Fn() -> imgpool_mem::Result<()> + Send + Sync + 'static,
{
    let cycle = Arc::new(cycle);
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cycle = Arc::clone(&cycle);
            thread::spawn(move || {
                let mut failures = 0usize;
                for _ in 0..iterations {
                    if let Err(e) = cycle() {
                        tracing::warn!(error = %e, "stress cycle failed");
                        failures += 1;
                    }
                }
                failures
            })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        failures += handle.join().map_err(|_| "stress worker panicked")?;
    }
    Ok(failures)
}

fn sorted(stats: HashMap<String, usize>) -> std::collections::BTreeMap<String, usize> {
    stats.into_iter().collect()
}
