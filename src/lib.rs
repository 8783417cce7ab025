// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod cancel;
mod error;
mod macros;
mod semaphore;
pub mod stream;
mod util;
mod worker_pool;

pub use cancel::{CancellationToken, DropGuard};
pub use error::Error;
pub use stream::{merge, stream_of, take, Stream};
pub use worker_pool::{PoolLimit, PoolState, PoolStats, Task, WorkerPool, WorkerPoolBuilder};

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Feeds a worker pool from the first values of several merged streams.
    #[test]
    fn merge_take_into_pool() {
        let cancel = CancellationToken::new();
        let merged = merge(
            &cancel,
            [stream_of(0..100u64), stream_of(1000..1100), stream_of(5000..5100)],
        );
        let first = take(&cancel, &merged, 150);

        let (sender, tasks) = crossbeam_channel::bounded::<Task>(0);
        let pool = WorkerPool::new(4usize).unwrap();
        pool.start(tasks);

        let sum = Arc::new(Mutex::new(0));
        let count = Arc::new(AtomicUsize::new(0));
        for x in first.iter() {
            let sum = sum.clone();
            let count = count.clone();
            sender
                .send(Box::new(move || {
                    *sum.lock().unwrap() += x;
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        drop(sender);
        pool.wait();

        assert_eq!(count.load(Ordering::SeqCst), 150);
        // Release the forwarders still blocked on the remainder of the merge.
        cancel.cancel();
        let rest = merged.iter().count();
        assert!(rest <= 3, "{rest} values after cancellation");
    }

    /// Cancelling through a guard releases every forwarder of a pipeline.
    #[test]
    fn drop_guard_releases_pipeline() {
        let guard = CancellationToken::new().drop_guard();
        let (_senders, sources): (Vec<_>, Vec<_>) = (0..4)
            .map(|_| crossbeam_channel::unbounded::<u32>())
            .unzip();
        let merged = merge(guard.token(), sources);
        let output = take(guard.token(), &merged, 10);

        drop(guard);
        assert_eq!(
            output.recv_timeout(Duration::from_secs(5)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        );
        assert_eq!(
            merged.recv_timeout(Duration::from_secs(5)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        );
    }
}
