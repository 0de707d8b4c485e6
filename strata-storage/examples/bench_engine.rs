use byte_unit::{Byte, ParseError};
use clap::Parser;
use easy_parallel::Parallel;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use strata_storage::prelude::*;

fn main() {
    let args = Args::parse();
    let mut config = EngineConfig::default().slices(args.slices).slice(
        SliceConfig::default()
            .block_size(args.block_size as u64)
            .max_key_size(args.key_size.max(16)),
    );
    if let Some(dir) = &args.main_dir {
        config = config.main_dir(dir);
    }
    let engine = config.build().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let start = Instant::now();
    let res = Parallel::new()
        .each(0..args.threads, |thd_id| {
            smol::block_on(worker(&engine, thd_id as u64, &args, &stop))
        })
        .finish({
            let stop = Arc::clone(&stop);
            let duration = args.duration;
            move || {
                std::thread::sleep(duration);
                stop.store(true, Ordering::SeqCst);
            }
        });
    let dur = start.elapsed();
    let (counts, _) = res;
    let total: u64 = counts.iter().map(|c| c.0).sum();
    let sets: u64 = counts.iter().map(|c| c.1).sum();
    let stats = smol::block_on(engine.verify()).unwrap();
    let entries: usize = stats.iter().map(|s| s.entries).sum();
    let depth = stats.iter().map(|s| s.depth).max().unwrap_or(0);
    println!(
        "threads={},slices={},dur={}ms,ops={},sets={},ops/s={:.0},entries={},max_depth={}",
        args.threads,
        args.slices,
        dur.as_millis(),
        total,
        sets,
        total as f64 * 1_000_000_000f64 / dur.as_nanos() as f64,
        entries,
        depth,
    );
}

async fn worker(engine: &Engine, thd_id: u64, args: &Args, stop: &AtomicBool) -> (u64, u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(thd_id);
    let mut ops = 0u64;
    let mut sets = 0u64;
    let value = vec![b'v'; args.value_size];
    while !stop.load(Ordering::Relaxed) {
        let k = rng.random_range(0..args.keys);
        let key = format!("{:0width$}", k, width = args.key_size);
        if rng.random_bool(args.write_ratio) {
            engine.set(key.as_bytes(), &value).await.unwrap();
            sets += 1;
        } else {
            engine.get(key.as_bytes()).await.unwrap();
        }
        ops += 1;
    }
    (ops, sets)
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    /// client thread count
    #[arg(long, default_value = "4")]
    threads: usize,

    #[arg(long, default_value = "4")]
    slices: usize,

    #[arg(long, default_value = "4KiB", value_parser = parse_byte_size)]
    block_size: usize,

    /// Data directory, in memory if absent
    #[arg(long)]
    main_dir: Option<String>,

    /// Number of distinct keys
    #[arg(long, default_value = "100000")]
    keys: u64,

    #[arg(long, default_value = "16")]
    key_size: usize,

    #[arg(long, default_value = "100")]
    value_size: usize,

    #[arg(long, default_value = "0.5")]
    write_ratio: f64,

    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    duration: Duration,
}

#[inline]
fn parse_byte_size(input: &str) -> std::result::Result<usize, ParseError> {
    Byte::parse_str(input, true).map(|b| b.as_u64() as usize)
}
