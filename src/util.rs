// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Spawns a named thread.
///
/// # Panics
///
/// Panics if the operating system fails to create the thread, like
/// [`std::thread::spawn()`].
pub fn spawn_named<T: Send + 'static>(
    name: String,
    f: impl FnOnce() -> T + Send + 'static,
) -> JoinHandle<T> {
    match std::thread::Builder::new().name(name.clone()).spawn(f) {
        Ok(handle) => handle,
        Err(e) => panic!("Failed to spawn thread {name}: {e}"),
    }
}

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// The mutex is only ever held to inspect or flip the status, never across a
/// blocking operation on a channel.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status without waiting on any condition.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Runs `f` on the status under the lock, then notifies all waiting
    /// threads.
    pub fn update_and_notify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.mutex.lock().unwrap());
        self.condvar.notify_all();
        result
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}
