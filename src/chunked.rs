// Copyright 2026 Joyent, Inc.

//! Half-duplex (chunked HTTP response) binding.
//!
//! One-directional server-to-client streaming over a response body read as a
//! sequence of text-delimited events.  The actual network exchange is
//! deferred: nothing is sent until the downstream's first unit of demand,
//! at which point the request is issued and a body-reader task starts
//! feeding the shared pull consumer.
//!
//! There is no reverse channel, so no REQUEST_ELEMENT can reach the server;
//! the binding pulls from the body itself and meters elements out through
//! the consumer's demand contract.  That internal pull is bounded: the body
//! is only read while the buffer holds fewer than the configured cap, which
//! is as much backpressure as a one-way carrier allows.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Future, Stream, StreamExt};
use slog::{debug, Logger};

use crate::client::CallerConfig;
use crate::codec::PayloadCodec;
use crate::consumer::{PullSource, SharedChannel};
use crate::errors::RpcError;
use crate::protocol::RETURN_CHANNEL;

/// The deferred network exchange: issuing it yields the response body as a
/// stream of byte chunks.  Chunk boundaries carry no meaning; events are
/// re-delimited by the parser.
pub trait EventExchange: Send + 'static {
    type Body: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static;

    fn issue(self) -> impl Future<Output = Result<Self::Body, RpcError>> + Send;
}

/// Any `FnOnce` producing a body stream works as an exchange, which keeps
/// call sites free of one-off adapter types.
impl<F, Fut, B> EventExchange for F
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<B, RpcError>> + Send,
    B: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
{
    type Body = B;

    fn issue(self) -> impl Future<Output = Result<B, RpcError>> + Send {
        self()
    }
}

pub(crate) fn open<T, X>(
    exchange: X,
    codec: Arc<dyn PayloadCodec>,
    config: &CallerConfig,
    log: Logger,
) -> PullSource<T>
where
    X: EventExchange,
{
    let shared = SharedChannel::new(RETURN_CHANNEL, log.clone());
    let cap = config.chunked_buffer.max(1);
    let reader_shared = shared.clone();
    let starter: Box<dyn FnOnce() + Send> = Box::new(move || {
        tokio::spawn(read_body(exchange, reader_shared, cap, log));
    });
    PullSource::new(shared, codec, None, Some(starter), config.credit_window)
}

async fn read_body<X: EventExchange>(
    exchange: X,
    shared: Arc<SharedChannel>,
    cap: usize,
    log: Logger,
) {
    let mut body = match exchange.issue().await {
        Ok(body) => body,
        Err(e) => {
            shared.fail(e);
            return;
        }
    };
    debug!(log, "chunked exchange issued on first demand");

    let mut parser = EventParser::default();
    loop {
        let chunk = match body.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                shared.fail(RpcError::Transport(e));
                return;
            }
            None => break,
        };
        for event in parser.feed(&chunk) {
            if !shared.wait_room(cap).await {
                // Downstream cancelled; dropping the body aborts the
                // exchange.
                return;
            }
            shared.push(event);
        }
    }
    // A final event is legal without a trailing blank line.
    if let Some(event) = parser.finish() {
        if !shared.wait_room(cap).await {
            return;
        }
        shared.push(event);
    }
    shared.complete();
}

/// Incremental parser for the server-sent-event wire form: `data:` lines
/// accumulate an event, a blank line ends it, comment and non-data fields
/// are ignored.  Chunk boundaries may fall anywhere, including mid-line.
#[derive(Default)]
struct EventParser {
    line: Vec<u8>,
    data: Vec<u8>,
    has_data: bool,
}

impl EventParser {
    /// Feed one chunk; returns the payloads of every event completed by it.
    fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut events = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                if let Some(event) = self.end_line() {
                    events.push(event);
                }
            } else {
                self.line.push(*byte);
            }
        }
        events
    }

    /// Flush any unterminated trailing event at end of body.
    fn finish(&mut self) -> Option<Vec<u8>> {
        if !self.line.is_empty() {
            if let Some(event) = self.end_line() {
                return Some(event);
            }
        }
        if self.has_data {
            self.has_data = false;
            return Some(std::mem::take(&mut self.data));
        }
        None
    }

    fn end_line(&mut self) -> Option<Vec<u8>> {
        let mut line = std::mem::take(&mut self.line);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            // Blank line: event boundary.
            if self.has_data {
                self.has_data = false;
                return Some(std::mem::take(&mut self.data));
            }
            return None;
        }
        if line.starts_with(b":") {
            // Comment; keep-alives arrive this way.
            return None;
        }
        if let Some(rest) = line.strip_prefix(b"data:") {
            let rest = rest.strip_prefix(b" ").unwrap_or(rest);
            if self.has_data {
                // Multi-line data joins with a newline, per the event-stream
                // format.
                self.data.push(b'\n');
            }
            self.data.extend_from_slice(rest);
            self.has_data = true;
        }
        // Other fields (event:, id:, retry:) carry nothing for this layer.
        None
    }
}
