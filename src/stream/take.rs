// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use super::{forward, Stream};
use crate::cancel::CancellationToken;
use crate::macros::log_debug;
use crate::util::spawn_named;
use std::num::NonZeroUsize;

/// Relays at most the first `count` values of `source` onto an output stream.
///
/// The output yields, in order, the values read from `source` until `count`
/// of them have been forwarded, `source` ends, or `cancel` fires, whichever
/// happens first. Then the output ends. With a `count` of zero, the output is
/// empty and already ended, and no thread is spawned.
///
/// # Remaining input
///
/// `take()` does **not** own its input: it reads through a clone of the
/// `source` receiver and never drains it. Once `count` values have been
/// forwarded, any values that the producer of `source` still sends stay in
/// `source`. The caller remains responsible for reading the rest of `source`
/// (or dropping it), otherwise a producer blocked on sending to `source` will
/// never finish.
///
/// ```
/// # use pipelight::{take, CancellationToken};
/// let cancel = CancellationToken::new();
/// let (sender, source) = crossbeam_channel::unbounded();
/// for x in [1, 2, 3] {
///     sender.send(x).unwrap();
/// }
/// drop(sender);
///
/// let output = take(&cancel, &source, 2);
/// assert_eq!(output.iter().collect::<Vec<_>>(), [1, 2]);
/// // The rest is still there.
/// assert_eq!(source.recv(), Ok(3));
/// ```
///
/// # Panics
///
/// Panics if the forwarding thread cannot be spawned.
pub fn take<T: Send + 'static>(
    cancel: &CancellationToken,
    source: &Stream<T>,
    count: usize,
) -> Stream<T> {
    let (sink, output) = crossbeam_channel::bounded(0);

    let Some(count) = NonZeroUsize::new(count) else {
        return output;
    };

    let cancel = cancel.clone();
    let source = source.clone();
    spawn_named("pipelight-take".to_owned(), move || {
        let (_forwarded, _termination) = forward(&cancel, &source, &sink, Some(count));
        log_debug!("[take] Forwarded {_forwarded}/{count} value(s), stopping: {_termination:?}.");
        // Dropping `sink` here ends the output, after the last value was
        // handed over.
    });

    output
}
