// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Streams of values and the combinators relaying between them.
//!
//! A [`Stream`] is the receiving half of a
//! [`crossbeam_channel`](crossbeam_channel) channel. The stream ends once every
//! sender connected to it has been dropped. Output streams returned by
//! [`merge()`] and [`take()`] are rendezvous channels: a value is handed over
//! only when the consumer reads it, so a forwarder blocked on a slow consumer
//! can still be cancelled.

mod merge;
mod take;

pub use merge::merge;
pub use take::take;

use crate::cancel::CancellationToken;
use crate::macros::log_trace;
use crossbeam_channel::{select, Receiver, Sender};
use std::num::NonZeroUsize;

/// An ordered, possibly unbounded sequence of values, ending when all its
/// producers have disconnected.
pub type Stream<T> = Receiver<T>;

/// Returns a finite stream yielding the given items in order, already closed
/// on the producer side.
///
/// ```
/// # use pipelight::stream_of;
/// let stream = stream_of([1, 2, 3]);
/// assert_eq!(stream.iter().collect::<Vec<_>>(), [1, 2, 3]);
/// ```
pub fn stream_of<T>(items: impl IntoIterator<Item = T>) -> Stream<T> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    for item in items {
        // The receiver is alive in this scope, so sending can't fail.
        let _ = sender.send(item);
    }
    receiver
}

/// Reason why a forwarding loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The source stream ended.
    Exhausted,
    /// The cancellation token fired.
    Cancelled,
    /// The consumer of the output stream went away.
    Disconnected,
    /// The maximum number of values was forwarded.
    LimitReached,
}

/// Copies values from `source` to `sink` until `source` ends, `cancel` fires,
/// the consumer of `sink` disconnects, or `limit` values have been written.
///
/// Returns the number of values written and the reason for stopping. Reading
/// from `source` and writing to `sink` both race against cancellation, so a
/// value is either fully handed over or dropped, never duplicated.
pub(crate) fn forward<T>(
    cancel: &CancellationToken,
    source: &Receiver<T>,
    sink: &Sender<T>,
    limit: Option<NonZeroUsize>,
) -> (usize, Termination) {
    let mut forwarded = 0;
    loop {
        if limit.is_some_and(|limit| forwarded >= limit.get()) {
            return (forwarded, Termination::LimitReached);
        }
        // `select!` picks randomly among ready operations, so check the token
        // first: otherwise a busy source could keep winning after cancellation.
        if cancel.is_cancelled() {
            return (forwarded, Termination::Cancelled);
        }

        let value = select! {
            recv(source) -> msg => match msg {
                Ok(value) => value,
                Err(_) => return (forwarded, Termination::Exhausted),
            },
            recv(cancel.signal()) -> _ => return (forwarded, Termination::Cancelled),
        };

        select! {
            send(sink, value) -> res => {
                if res.is_err() {
                    return (forwarded, Termination::Disconnected);
                }
            }
            recv(cancel.signal()) -> _ => return (forwarded, Termination::Cancelled),
        }
        forwarded += 1;
        log_trace!(
            "[{}] Forwarded value #{forwarded}.",
            std::thread::current().name().unwrap_or("forwarder")
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn forward_until_exhausted() {
        let cancel = CancellationToken::new();
        let source = stream_of([1, 2, 3]);
        let (sink, output) = crossbeam_channel::unbounded();

        let result = forward(&cancel, &source, &sink, None);
        assert_eq!(result, (3, Termination::Exhausted));
        drop(sink);
        assert_eq!(output.iter().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn forward_until_limit() {
        let cancel = CancellationToken::new();
        let source = stream_of([1, 2, 3]);
        let (sink, output) = crossbeam_channel::unbounded();

        let result = forward(&cancel, &source, &sink, NonZeroUsize::new(2));
        assert_eq!(result, (2, Termination::LimitReached));
        drop(sink);
        assert_eq!(output.iter().collect::<Vec<_>>(), [1, 2]);
        // The remainder wasn't consumed.
        assert_eq!(source.recv(), Ok(3));
    }

    #[test]
    fn forward_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = stream_of([1, 2, 3]);
        let (sink, output) = crossbeam_channel::unbounded();

        let result = forward(&cancel, &source, &sink, None);
        assert_eq!(result, (0, Termination::Cancelled));
        drop(sink);
        assert!(output.is_empty());
        assert_eq!(source.len(), 3);
    }

    #[test]
    fn forward_cancelled_while_reading() {
        let cancel = CancellationToken::new();
        // The sender is kept alive, so the source never ends.
        let (_sender, source) = crossbeam_channel::unbounded::<u32>();
        let (sink, _output) = crossbeam_channel::unbounded();

        let forwarder = {
            let cancel = cancel.clone();
            std::thread::spawn(move || forward(&cancel, &source, &sink, None))
        };
        std::thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        assert_eq!(forwarder.join().unwrap(), (0, Termination::Cancelled));
    }

    #[test]
    fn forward_cancelled_while_writing() {
        let cancel = CancellationToken::new();
        let source = stream_of([1, 2, 3]);
        // Nobody reads from this rendezvous channel.
        let (sink, _output) = crossbeam_channel::bounded(0);

        let forwarder = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                let result = forward(&cancel, &source, &sink, None);
                (result, source.len())
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        // The first value was read then dropped, the others were left alone.
        assert_eq!(forwarder.join().unwrap(), ((0, Termination::Cancelled), 2));
    }

    #[test]
    fn forward_consumer_disconnected() {
        let cancel = CancellationToken::new();
        let source = stream_of([1, 2, 3]);
        let (sink, output) = crossbeam_channel::bounded(0);
        drop(output);

        let result = forward(&cancel, &source, &sink, None);
        assert_eq!(result, (0, Termination::Disconnected));
    }
}
