// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use super::{forward, Stream};
use crate::cancel::CancellationToken;
use crate::macros::{log_debug, log_trace};
use crate::util::spawn_named;

/// Multiplexes the given streams onto a single output stream.
///
/// The output yields every value of every source. Values from the same source
/// keep their relative order, but values from different sources are
/// interleaved in an unspecified way. The output ends once all the sources
/// have ended, or earlier if `cancel` fires. With no sources at all, the
/// output is empty and already ended.
///
/// One forwarding thread is spawned per source. Each forwarder exits as soon
/// as its source ends, `cancel` fires, or the output stream is dropped.
/// Values that a source still holds at cancellation are never forwarded.
///
/// ```
/// # use pipelight::{merge, stream_of, CancellationToken};
/// let cancel = CancellationToken::new();
/// let output = merge(&cancel, [stream_of([1, 2]), stream_of([10, 20, 30])]);
///
/// let mut values = output.iter().collect::<Vec<_>>();
/// values.sort();
/// assert_eq!(values, [1, 2, 10, 20, 30]);
/// ```
///
/// # Panics
///
/// Panics if a forwarding thread cannot be spawned.
pub fn merge<T, I>(cancel: &CancellationToken, sources: I) -> Stream<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Stream<T>>,
{
    let (sink, output) = crossbeam_channel::bounded(0);

    for (id, source) in sources.into_iter().enumerate() {
        let cancel = cancel.clone();
        let sink = sink.clone();
        spawn_named(format!("pipelight-merge-{id}"), move || {
            log_trace!("[merge forwarder #{id}] Started.");
            let (_forwarded, _termination) = forward(&cancel, &source, &sink, None);
            log_debug!(
                "[merge forwarder #{id}] Forwarded {_forwarded} value(s), stopping: {_termination:?}."
            );
        });
    }

    // Each forwarder owns a clone of the sender, so the output ends exactly
    // when the last forwarder exits.
    drop(sink);
    output
}
