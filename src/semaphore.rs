// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A counting semaphore whose acquisition can be cancelled.

use crate::cancel::CancellationToken;
use crossbeam_channel::{select, Receiver, Sender};
use std::num::NonZeroUsize;

/// A counting semaphore with a fixed number of slots.
///
/// Slots are tokens in a bounded channel of capacity `capacity`: acquiring a
/// slot sends a token (blocking while the channel is full) and releasing it
/// receives one.
pub struct Semaphore {
    capacity: NonZeroUsize,
    acquire: Sender<()>,
    release: Receiver<()>,
}

impl Semaphore {
    /// Creates a semaphore with `capacity` free slots.
    pub fn new(capacity: NonZeroUsize) -> Self {
        let (acquire, release) = crossbeam_channel::bounded(capacity.get());
        Self {
            capacity,
            acquire,
            release,
        }
    }

    /// Returns the number of slots currently held.
    #[cfg(test)]
    pub fn held(&self) -> usize {
        self.acquire.len()
    }

    /// Waits for a free slot, unless `cancel` fires first.
    ///
    /// Returns [`None`] if cancelled. A token that is already cancelled wins
    /// even if a slot is free.
    pub fn acquire(&self, cancel: &CancellationToken) -> Option<Permit> {
        if cancel.is_cancelled() {
            return None;
        }
        select! {
            send(self.acquire, ()) -> res => {
                // Both channel halves live in `self`.
                debug_assert!(res.is_ok());
                Some(self.permit())
            }
            recv(cancel.signal()) -> _ => None,
        }
    }

    /// Waits until every slot is free and keeps all of them, so that no
    /// further [`acquire()`](Self::acquire) ever succeeds.
    pub fn acquire_all(&self) {
        for _ in 0..self.capacity.get() {
            let _ = self.acquire.send(());
        }
    }

    fn permit(&self) -> Permit {
        Permit {
            release: self.release.clone(),
        }
    }
}

/// A slot of a [`Semaphore`], released when dropped.
///
/// The permit owns what it needs to release its slot, so it can be moved to
/// another thread.
pub struct Permit {
    release: Receiver<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        // This permit's token is in the channel until now, so this can't be empty.
        let released = self.release.try_recv();
        debug_assert!(released.is_ok());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn semaphore(capacity: usize) -> Semaphore {
        Semaphore::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn acquire_up_to_capacity() {
        let sem = semaphore(3);
        let cancel = CancellationToken::new();

        let permits = (0..3)
            .map(|_| sem.acquire(&cancel).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(sem.held(), 3);

        drop(permits);
        assert_eq!(sem.held(), 0);
        assert!(sem.acquire(&cancel).is_some());
    }

    #[test]
    fn acquire_when_full_is_cancellable() {
        let sem = Arc::new(semaphore(1));
        let cancel = CancellationToken::new();
        let _permit = sem.acquire(&cancel).unwrap();

        let waiter = {
            let sem = sem.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || sem.acquire(&cancel).is_some())
        };
        std::thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        assert!(!waiter.join().unwrap());
        assert_eq!(sem.held(), 1);
    }

    #[test]
    fn acquire_when_cancelled_fails() {
        let sem = semaphore(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(sem.acquire(&cancel).is_none());
        assert_eq!(sem.held(), 0);
    }

    #[test]
    fn release_wakes_up_waiter() {
        let sem = Arc::new(semaphore(1));
        let cancel = CancellationToken::new();
        let permit = sem.acquire(&cancel).unwrap();

        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.acquire(&cancel).is_some())
        };
        std::thread::sleep(Duration::from_millis(10));
        drop(permit);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn acquire_all_waits_for_permits() {
        let sem = Arc::new(semaphore(2));
        let cancel = CancellationToken::new();
        let permit = sem.acquire(&cancel).unwrap();

        let drainer = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.acquire_all())
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(!drainer.is_finished());

        // Permits can move across threads.
        std::thread::spawn(move || drop(permit)).join().unwrap();
        drainer.join().unwrap();
        assert_eq!(sem.held(), 2);

        let cancel_later = CancellationToken::new();
        let canceller = {
            let cancel_later = cancel_later.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                cancel_later.cancel();
            })
        };
        assert!(sem.acquire(&cancel_later).is_none());
        canceller.join().unwrap();
    }
}
