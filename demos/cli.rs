// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run example pipelines.

use clap::{Parser, ValueEnum};
use pipelight::{
    merge, take, CancellationToken, PoolLimit, Stream, Task, WorkerPool, WorkerPoolBuilder,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let pool = WorkerPoolBuilder {
        limit: match cli.limit {
            Some(limit) => PoolLimit::Count(limit),
            None => PoolLimit::AvailableParallelism,
        },
        stack_size: None,
    }
    .build();

    let guard = CancellationToken::new().drop_guard();
    let cancel = guard.token();
    let start = Instant::now();

    match cli.scenario {
        Scenario::Merge => {
            let (sources, producers) = spawn_sources(&cli);
            let count = merge(cancel, sources).iter().count();
            join_all(producers);
            println!("merged {count} values in {:?}", start.elapsed());
        }
        Scenario::Take => {
            let (sources, producers) = spawn_sources(&cli);
            let merged = merge(cancel, sources);
            let first = take(cancel, &merged, cli.take);
            let count = first.iter().count();
            // Cancelling releases the forwarders and producers still blocked
            // on the remainder.
            cancel.cancel();
            drop(merged);
            join_all(producers);
            println!("took {count} values in {:?}", start.elapsed());
        }
        Scenario::Pipeline => {
            let (sources, producers) = spawn_sources(&cli);
            let merged = merge(cancel, sources);
            let first = take(cancel, &merged, cli.take);
            let sum = run_pool(&pool, first, &cli);
            cancel.cancel();
            drop(merged);
            join_all(producers);
            println!(
                "processed {} tasks (sum = {sum}) in {:?}",
                pool.stats().completed,
                start.elapsed()
            );
        }
        Scenario::Stop => {
            let (sources, producers) = spawn_sources(&cli);
            let merged = merge(cancel, sources);

            let sum = std::thread::scope(|scope| {
                scope.spawn(|| {
                    std::thread::sleep(Duration::from_millis(cli.stop_after_ms));
                    pool.stop();
                });
                run_pool(&pool, merged, &cli)
            });
            cancel.cancel();
            join_all(producers);
            let stats = pool.stats();
            println!(
                "stopped after {} tasks, {} abandoned (sum = {sum}) in {:?}",
                stats.completed,
                stats.abandoned,
                start.elapsed()
            );
        }
    }
}

/// Spawns one producer thread per source, each sending random values.
fn spawn_sources(cli: &Cli) -> (Vec<Stream<u64>>, Vec<JoinHandle<()>>) {
    (0..cli.sources)
        .map(|i| {
            let (sender, stream) = crossbeam_channel::bounded(0);
            let items = cli.items_per_source;
            let producer = std::thread::spawn(move || {
                let mut rng = ChaCha12Rng::seed_from_u64(i as u64);
                for _ in 0..items {
                    if sender.send(rng.random_range(0..1000)).is_err() {
                        break;
                    }
                }
            });
            (stream, producer)
        })
        .unzip()
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Runs one task per input value on the pool, returning the sum of the values
/// processed.
fn run_pool(pool: &WorkerPool, values: Stream<u64>, cli: &Cli) -> u64 {
    let (sender, tasks) = crossbeam_channel::bounded::<Task>(0);
    pool.start(tasks);

    let sum = Arc::new(AtomicU64::new(0));
    let task_duration = Duration::from_micros(cli.task_micros);
    for x in values.iter() {
        let sum = sum.clone();
        let task: Task = Box::new(move || {
            std::thread::sleep(task_duration);
            sum.fetch_add(x, Ordering::Relaxed);
        });
        if sender.send(task).is_err() {
            // The pool was stopped.
            break;
        }
    }
    drop(sender);
    pool.wait();

    sum.load(Ordering::Relaxed)
}

/// CLI tool to run example pipelines.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Maximum number of concurrent tasks. Default to the available
    /// parallelism.
    #[arg(long)]
    limit: Option<NonZeroUsize>,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of input streams.
    #[arg(long, default_value_t = 4)]
    sources: usize,

    /// Number of values sent by each input stream.
    #[arg(long, default_value_t = 1_000)]
    items_per_source: usize,

    /// Number of values to take. Used only for the take and pipeline
    /// scenarios.
    #[arg(long, default_value_t = 100)]
    take: usize,

    /// Duration of each task, in microseconds.
    #[arg(long, default_value_t = 100)]
    task_micros: u64,

    /// Delay before stopping the pool, in milliseconds. Used only for the stop
    /// scenario.
    #[arg(long, default_value_t = 10)]
    stop_after_ms: u64,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Merge all the sources.
    Merge,
    /// Take the first values of the merged sources.
    Take,
    /// Run one task per value taken from the merged sources.
    Pipeline,
    /// Run one task per merged value, stopping the pool midway.
    Stop,
}
