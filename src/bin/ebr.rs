use anyhow::{anyhow, bail};
use crossbeam_ebr::Collector;
use crossbeam_utils::thread::scope;
use log::info;
use rand::prelude::*;
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::any::Any;
use std::cmp::max;
use std::path::Path;
use std::sync::Barrier;
use std::thread::available_parallelism;
use std::time::Instant;
use typenum::{Unsigned, U1, U4};

use bst_benchmark::config::set::{setup, BenchWriter, Config, Op, OpsPerCs, Perf};
use bst_benchmark::ds_impl::ebr::{ConcurrentSet, BST};

fn main() -> anyhow::Result<()> {
    let mm = Path::new(file!())
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ebr")
        .to_string();
    let Some((config, output)) = setup(mm)? else {
        return Ok(());
    };
    TermLogger::init(
        config.log_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;
    match config.ops_per_cs {
        OpsPerCs::One => bench::<BST, U1>(&config, output),
        OpsPerCs::Four => bench::<BST, U4>(&config, output),
    }
}

fn panicked(_: Box<dyn Any + Send>) -> anyhow::Error {
    anyhow!("a benchmark thread panicked")
}

fn bench<S: ConcurrentSet<i32> + Send + Sync, N: Unsigned>(
    config: &Config,
    output: BenchWriter,
) -> anyhow::Result<()> {
    println!("{}", config);
    let collector = &Collector::new();
    let set = &S::new();

    prefill(config, set, collector)?;
    let (ops_per_sec, peak_mem, avg_mem) = bench_set::<S, N>(config, set, collector)?;
    println!("end");
    let (size, key_sum) = verify(config, set, collector)?;

    let perf = Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
        size,
        key_sum,
    };
    output.write_record(config, &perf)?;
    println!("{}", perf);
    Ok(())
}

/// Inserts `config.prefill` distinct random keys, with multiple threads.
fn prefill<S: ConcurrentSet<i32> + Send + Sync>(
    config: &Config,
    set: &S,
    collector: &Collector,
) -> anyhow::Result<()> {
    let threads = available_parallelism().map(|v| v.get()).unwrap_or(1);
    info!("prefilling {} keys with {} threads", config.prefill, threads);
    scope(|s| {
        for t in 0..threads {
            s.spawn(move |_| {
                let handle = collector.register();
                let rng = &mut rand::thread_rng();
                let count =
                    config.prefill / threads + if t < config.prefill % threads { 1 } else { 0 };
                let mut inserted = 0;
                while inserted < count {
                    let key = config.key_dist.sample(rng);
                    if set.insert(key, &handle.pin()) {
                        inserted += 1;
                    }
                }
            });
        }
    })
    .map_err(panicked)?;
    info!("prefilled");
    Ok(())
}

/// Runs the timed workload. Returns throughput and the peak and average allocated bytes.
fn bench_set<S: ConcurrentSet<i32> + Send + Sync, N: Unsigned>(
    config: &Config,
    set: &S,
    collector: &Collector,
) -> anyhow::Result<(u64, usize, usize)> {
    let barrier = &Barrier::new(config.threads + config.aux_thread);

    let (ops, mem) = scope(|s| {
        // memory sampling thread
        let sampler = (config.aux_thread > 0).then(|| {
            s.spawn(move |_| {
                let mut samples = 0usize;
                let mut acc = 0usize;
                let mut peak = 0usize;
                barrier.wait();

                let start = Instant::now();
                let mut next_sampling = start + config.sampling_period;
                while start.elapsed() < config.duration {
                    let now = Instant::now();
                    if now > next_sampling {
                        let allocated = config.mem_sampler.sample();
                        samples += 1;
                        acc += allocated;
                        peak = max(peak, allocated);
                        next_sampling = now + config.sampling_period;
                    }
                    std::thread::sleep(config.aux_thread_period);
                }
                (peak, if samples > 0 { acc / samples } else { 0 })
            })
        });

        let workers: Vec<_> = (0..config.threads)
            .map(|_| {
                s.spawn(move |_| {
                    let mut ops: u64 = 0;
                    let rng = &mut rand::thread_rng();
                    let handle = collector.register();
                    barrier.wait();
                    let start = Instant::now();

                    let mut guard = handle.pin();
                    while start.elapsed() < config.duration {
                        let key = config.key_dist.sample(rng);
                        match Op::OPS[config.op_dist.sample(rng)] {
                            Op::Contains => {
                                set.contains(&key, &guard);
                            }
                            Op::Insert => {
                                set.insert(key, &guard);
                            }
                            Op::Remove => {
                                set.remove(&key, &guard);
                            }
                        }
                        ops += 1;
                        if ops % N::to_u64() == 0 {
                            guard.repin();
                        }
                    }
                    ops
                })
            })
            .collect();

        let ops = workers
            .into_iter()
            .map(|w| w.join())
            .sum::<std::thread::Result<u64>>();
        let mem = match sampler {
            Some(sampler) => sampler.join(),
            None => Ok((0, 0)),
        };
        (ops, mem)
    })
    .map_err(panicked)?;

    let ops = ops.map_err(panicked)?;
    let (peak_mem, avg_mem) = mem.map_err(panicked)?;
    Ok((ops / config.interval, peak_mem, avg_mem))
}

/// Cross-checks the quiescent aggregates against lookups over the whole key range.
fn verify<S: ConcurrentSet<i32>>(
    config: &Config,
    set: &S,
    collector: &Collector,
) -> anyhow::Result<(usize, i64)> {
    let handle = collector.register();
    let guard = &handle.pin();
    let size = set.size(guard);
    let key_sum = set.key_sum(guard);

    let mut found = 0usize;
    let mut found_sum = 0i64;
    for key in 0..config.key_range {
        if set.contains(&key, guard) {
            found += 1;
            found_sum += key as i64;
        }
    }
    if found != size || found_sum != key_sum {
        bail!(
            "size {} and key sum {} disagree with lookups ({} keys, sum {})",
            size,
            key_sum,
            found,
            found_sum
        );
    }
    info!("verified {} keys, key sum {}", size, key_sum);
    Ok((size, key_sum))
}
