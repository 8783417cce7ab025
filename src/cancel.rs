// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Cooperative cancellation.

use crate::macros::log_debug;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A broadcast, level-triggered cancellation signal.
///
/// Once [`cancel()`](Self::cancel) has been called, the token stays cancelled
/// forever. Cancelling more than once has the same effect as cancelling once.
///
/// Blocking operations observe the token by selecting on
/// [`signal()`](Self::signal): this receiver never yields a value, but it
/// becomes disconnected (and therefore permanently ready) upon cancellation.
///
/// ```
/// # use pipelight::CancellationToken;
/// # use crossbeam_channel::select;
/// let token = CancellationToken::new();
/// let clone = token.clone();
/// std::thread::spawn(move || clone.cancel());
///
/// select! {
///     recv(token.signal()) -> _ => assert!(token.is_cancelled()),
/// }
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    /// Fast path for polling.
    cancelled: CachePadded<AtomicBool>,
    /// Dropped upon cancellation, which disconnects `signal`.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancellationToken {
    /// Creates a new token, not cancelled yet.
    pub fn new() -> Self {
        let (trigger, signal) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: CachePadded::new(AtomicBool::new(false)),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Requests cancellation. This is idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if self.inner.trigger.lock().unwrap().take().is_some() {
            log_debug!("[cancel] Cancellation requested.");
        }
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a receiver that becomes ready (disconnected) once this token is
    /// cancelled, to be used in a [`crossbeam_channel::select!`].
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Blocks until this token is cancelled.
    pub fn wait(&self) {
        // Nothing is ever sent, so this only returns on disconnection.
        let _ = self.inner.signal.recv();
    }

    /// Blocks until this token is cancelled or the timeout elapses, returning
    /// whether the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Returns a guard that cancels this token when dropped.
    pub fn drop_guard(self) -> DropGuard {
        DropGuard { token: Some(self) }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancels the wrapped [`CancellationToken`] when dropped, unless
/// [`disarm()`](Self::disarm) was called.
///
/// This is handy to tie the lifetime of forwarding threads to a scope: once
/// the consumer is done reading, dropping the guard releases every thread
/// still waiting on the token.
#[must_use = "the token is cancelled as soon as the guard is dropped"]
pub struct DropGuard {
    token: Option<CancellationToken>,
}

impl DropGuard {
    /// Returns the guarded token.
    pub fn token(&self) -> &CancellationToken {
        // Only `disarm()` takes the token, and it consumes the guard.
        self.token.as_ref().unwrap()
    }

    /// Releases the token without cancelling it.
    pub fn disarm(mut self) -> CancellationToken {
        self.token.take().unwrap()
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::select;
    use std::time::Instant;

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::ZERO));

        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::ZERO));
        // The signal stays ready.
        for _ in 0..3 {
            assert!(token.signal().recv().is_err());
        }
    }

    #[test]
    fn not_cancelled_times_out() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_wakes_up_all_clones() {
        let token = CancellationToken::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let token = token.clone();
                std::thread::spawn(move || {
                    token.wait();
                    token.is_cancelled()
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(10));
        token.cancel();
        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn signal_is_selectable() {
        let token = CancellationToken::new();
        let (_tx, rx) = crossbeam_channel::unbounded::<u32>();
        token.cancel();

        let cancelled = select! {
            recv(rx) -> _ => false,
            recv(token.signal()) -> _ => true,
        };
        assert!(cancelled);
    }

    #[test]
    fn drop_guard_cancels() {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        assert!(!guard.token().is_cancelled());
        drop(guard);
        assert!(token.is_cancelled());
    }

    #[test]
    fn disarmed_guard_does_not_cancel() {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let released = guard.disarm();
        assert!(!token.is_cancelled());
        released.cancel();
        assert!(token.is_cancelled());
    }
}
