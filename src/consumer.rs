// Copyright 2026 Joyent, Inc.

//! Inbound pull consumer.
//!
//! One [`SharedChannel`] holds the receive-side state of a single
//! multiplexed channel: the buffer of received-but-undelivered elements, the
//! outstanding-credit counter, and the terminal flags.  The network dispatch
//! loop mutates it through [`push`]/[`complete`]/[`fail`]; the downstream
//! subscriber pulls through a [`PullSource`], which implements
//! `futures::Stream`.  Both transport bindings sit on this same state
//! machine.
//!
//! [`push`]: SharedChannel::push
//! [`complete`]: SharedChannel::complete
//! [`fail`]: SharedChannel::fail

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::Stream;
use serde::de::DeserializeOwned;
use slog::{debug, warn, Logger};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::codec::PayloadCodec;
use crate::errors::RpcError;
use crate::protocol::Message;

struct ChannelState {
    /// Elements received but not yet pulled downstream.
    buffer: VecDeque<Vec<u8>>,
    /// Credit outstanding to the remote: elements requested via
    /// REQUEST_ELEMENT and not yet received.  Unused on the half-duplex
    /// binding, which has no reverse channel.
    demand: u64,
    /// Terminal flag; once set nothing further may be buffered.
    completed: bool,
    /// Terminal failure, delivered at most once and only after the buffer
    /// drains.
    fault: Option<RpcError>,
    /// Downstream cancelled; late elements are discarded.
    cancelled: bool,
    /// First downstream demand has been seen (lazy start done, initial
    /// credit issued).
    started: bool,
    waker: Option<Waker>,
}

/// Receive-side state of one channel, shared between the dispatch loop (or
/// body-reader task) and the downstream [`PullSource`].  The counter and
/// buffer live behind a single mutex; two actors mutate them concurrently
/// and neither ever does a read-then-write outside the lock.
pub(crate) struct SharedChannel {
    channel: i64,
    state: Mutex<ChannelState>,
    /// Producer-side signal that buffer room opened up (half-duplex body
    /// readers park on this when the internal buffer is at capacity).
    room: Notify,
    log: Logger,
}

impl SharedChannel {
    pub(crate) fn new(channel: i64, log: Logger) -> Arc<SharedChannel> {
        Arc::new(SharedChannel {
            channel,
            state: Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                demand: 0,
                completed: false,
                fault: None,
                cancelled: false,
                started: false,
                waker: None,
            }),
            room: Notify::new(),
            log,
        })
    }

    /// Buffer one received element.  Elements arriving after cancellation
    /// (the producer may have one in flight when it learns of a CANCEL) or
    /// after a terminal signal are discarded, not delivered.
    pub(crate) fn push(&self, payload: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            debug!(self.log, "discarding element received after cancel";
                   "channel" => self.channel);
            return;
        }
        if state.completed {
            warn!(self.log, "dropping element received after terminal signal";
                  "channel" => self.channel);
            return;
        }
        state.buffer.push_back(payload);
        state.demand = state.demand.saturating_sub(1);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Mark orderly completion.  Buffered elements still deliver first; the
    /// completion signal reaches the downstream only once the buffer drains.
    pub(crate) fn complete(&self) {
        let mut state = self.state.lock().unwrap();
        if state.completed {
            warn!(self.log, "dropping duplicate terminal signal";
                  "channel" => self.channel);
            return;
        }
        state.completed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Record a terminal failure.  Buffered elements still deliver first;
    /// errors do not pre-empt already-promised elements.
    pub(crate) fn fail(&self, err: RpcError) {
        let mut state = self.state.lock().unwrap();
        if state.completed {
            warn!(self.log, "dropping failure received after terminal signal";
                  "channel" => self.channel, "err" => %err);
            return;
        }
        state.completed = true;
        state.fault = Some(err);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Park until the buffer holds fewer than `cap` elements or the
    /// downstream cancels.  Returns false on cancellation.  This is what
    /// bounds the half-duplex binding's internal pull from the response
    /// body.
    pub(crate) async fn wait_room(&self, cap: usize) -> bool {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.cancelled {
                    return false;
                }
                if state.buffer.len() < cap {
                    return true;
                }
            }
            self.room.notified().await;
        }
    }
}

/// Demand-driven stream of decoded elements from one channel.
///
/// The classic reactive pull contract: nothing is delivered that was not
/// polled for.  On the full-duplex binding each poll-driven delivery renews
/// one unit of credit upstream; the first poll issues the initial credit
/// window (and, on the half-duplex binding, triggers the deferred network
/// exchange).  Dropping the source mid-stream cancels it.
pub struct PullSource<T> {
    shared: Arc<SharedChannel>,
    codec: Arc<dyn PayloadCodec>,
    /// Present on the full-duplex binding only; the path for
    /// REQUEST_ELEMENT and CANCEL messages back to the remote.
    outbound: Option<UnboundedSender<Message>>,
    /// Deferred work to run on first demand.
    starter: Option<Box<dyn FnOnce() + Send>>,
    window: u64,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PullSource<T> {
    pub(crate) fn new(
        shared: Arc<SharedChannel>,
        codec: Arc<dyn PayloadCodec>,
        outbound: Option<UnboundedSender<Message>>,
        starter: Option<Box<dyn FnOnce() + Send>>,
        window: u64,
    ) -> PullSource<T> {
        PullSource {
            shared,
            codec,
            outbound,
            starter,
            window: window.max(1),
            done: false,
            _marker: PhantomData,
        }
    }

    /// Stop consuming: discard buffered elements, tell the remote (CANCEL on
    /// the full-duplex binding) and release the body reader (half-duplex).
    /// One element may already be in flight; it will be discarded on
    /// arrival.
    pub fn cancel(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.buffer.clear();
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        drop(state);
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(Message::cancel(self.shared.channel));
        }
        self.shared.room.notify_one();
        self.done = true;
    }
}

impl<T: DeserializeOwned> Stream for PullSource<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(starter) = this.starter.take() {
            starter();
        }

        let mut state = this.shared.state.lock().unwrap();
        if state.cancelled {
            this.done = true;
            return Poll::Ready(None);
        }
        if !state.started {
            state.started = true;
            if let Some(outbound) = &this.outbound {
                let _ = outbound
                    .send(Message::request_element(this.shared.channel, this.window));
                state.demand = this.window;
            }
        }

        if let Some(payload) = state.buffer.pop_front() {
            // Renew one unit of credit for the element being handed over,
            // unless the channel already reached its terminal state.
            if let Some(outbound) = &this.outbound {
                if !state.completed {
                    let _ = outbound.send(Message::request_element(this.shared.channel, 1));
                    state.demand = state.demand.saturating_add(1);
                }
            }
            drop(state);
            this.shared.room.notify_one();
            let item = this
                .codec
                .decode(&payload)
                .and_then(|value| {
                    serde_json::from_value(value).map_err(|e| RpcError::Payload(e.to_string()))
                });
            return Poll::Ready(Some(item));
        }

        if state.completed {
            this.done = true;
            return match state.fault.take() {
                Some(err) => Poll::Ready(Some(Err(err))),
                None => Poll::Ready(None),
            };
        }

        // Buffer empty, channel open: make sure credit is outstanding, then
        // park until the dispatch loop wakes us.
        if state.demand == 0 {
            if let Some(outbound) = &this.outbound {
                let _ = outbound
                    .send(Message::request_element(this.shared.channel, this.window));
                state.demand = this.window;
            }
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> Drop for PullSource<T> {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::protocol::RETURN_CHANNEL;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    fn test_logger() -> Logger {
        crate::fallback_logger()
    }

    fn source_for(shared: &Arc<SharedChannel>) -> PullSource<i64> {
        PullSource::new(shared.clone(), Arc::new(JsonCodec), None, None, 4)
    }

    #[tokio::test]
    async fn buffered_element_waits_for_demand() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        shared.push(b"7".to_vec());

        let mut source = source_for(&shared);
        assert_eq!(source.next().await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn completion_signals_after_buffer_drains() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        shared.push(b"1".to_vec());
        shared.push(b"2".to_vec());
        shared.complete();

        let mut source = source_for(&shared);
        assert_eq!(source.next().await.unwrap().unwrap(), 1);
        assert_eq!(source.next().await.unwrap().unwrap(), 2);
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn failure_waits_for_buffer_and_fires_once() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        shared.push(b"1".to_vec());
        shared.fail(RpcError::ConnectionClosed);
        // A second terminal signal must be dropped.
        shared.fail(RpcError::Timeout);

        let mut source = source_for(&shared);
        assert_eq!(source.next().await.unwrap().unwrap(), 1);
        match source.next().await {
            Some(Err(RpcError::ConnectionClosed)) => (),
            other => panic!("expected buffered value then failure, got {:?}", other),
        }
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn push_after_cancel_is_discarded() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        let mut source = source_for(&shared);
        shared.push(b"1".to_vec());
        source.cancel();
        // Late in-flight element.
        shared.push(b"2".to_vec());

        assert!(source.next().await.is_none());
        assert!(shared.state.lock().unwrap().buffer.is_empty());
    }

    #[tokio::test]
    async fn push_after_complete_is_dropped() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        shared.complete();
        shared.push(b"9".to_vec());

        let mut source = source_for(&shared);
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn first_poll_issues_window_and_deliveries_renew_credit() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source: PullSource<i64> =
            PullSource::new(shared.clone(), Arc::new(JsonCodec), Some(tx), None, 3);

        shared.push(b"5".to_vec());
        assert_eq!(source.next().await.unwrap().unwrap(), 5);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.count(), 3);
        let renewal = rx.recv().await.unwrap();
        assert_eq!(renewal.count(), 1);
        drop(source);
    }

    #[tokio::test]
    async fn drop_mid_stream_sends_cancel() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source: PullSource<i64> =
            PullSource::new(shared.clone(), Arc::new(JsonCodec), Some(tx), None, 3);
        drop(source);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind(), crate::protocol::MessageKind::Cancel);
        assert!(shared.is_cancelled());
    }

    #[tokio::test]
    async fn wait_room_blocks_at_cap_and_resumes() {
        let shared = SharedChannel::new(RETURN_CHANNEL, test_logger());
        shared.push(b"1".to_vec());
        shared.push(b"2".to_vec());

        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.wait_room(2).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let mut source = source_for(&shared);
        assert_eq!(source.next().await.unwrap().unwrap(), 1);
        assert!(waiter.await.unwrap());
    }
}
