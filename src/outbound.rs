// Copyright 2026 Joyent, Inc.

//! Outbound stream worker.
//!
//! One worker task per streamed argument bridges the caller's local producer
//! onto the wire under remote-issued credit.  The worker owns its source
//! exclusively and is driven purely by messages: credit grants and
//! cancellation arrive on a command channel from the dispatch loop, elements
//! leave through the shared outbound queue.  At most one pull is in flight
//! at any time; credit arriving mid-pull only raises the counter.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use slog::{debug, Logger};
use tokio::sync::mpsc;

use crate::codec::PayloadCodec;
use crate::errors::RpcError;
use crate::protocol::{Message, STATUS_INTERNAL};

/// A streamed argument: the caller's local producer of elements.  Yielding
/// an `Err` converts to a FAIL record on the wire and stops the channel.
pub type ValueStream = BoxStream<'static, Result<Value, RpcError>>;

#[derive(Debug)]
pub(crate) enum WorkerCmd {
    /// REQUEST_ELEMENT arrived: raise the channel's credit by `n`.
    Credit(u64),
    /// CANCEL arrived (or the session is tearing down): stop pulling,
    /// release the source, emit nothing further.
    Cancel,
}

pub(crate) struct WorkerHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<WorkerCmd>,
}

pub(crate) fn spawn_worker(
    channel: i64,
    source: ValueStream,
    codec: Arc<dyn PayloadCodec>,
    outbound: mpsc::UnboundedSender<Message>,
    log: Logger,
) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(channel, source, codec, outbound, cmd_rx, log));
    WorkerHandle { cmd_tx }
}

async fn run_worker(
    channel: i64,
    mut source: ValueStream,
    codec: Arc<dyn PayloadCodec>,
    outbound: mpsc::UnboundedSender<Message>,
    mut cmd_rx: mpsc::UnboundedReceiver<WorkerCmd>,
    log: Logger,
) {
    let mut credit: u64 = 0;
    loop {
        // Idle until the remote grants credit.  The source is not touched
        // before the first REQUEST_ELEMENT.
        while credit == 0 {
            match cmd_rx.recv().await {
                Some(WorkerCmd::Credit(n)) => credit = credit.saturating_add(n),
                Some(WorkerCmd::Cancel) | None => {
                    debug!(log, "outbound worker released"; "channel" => channel);
                    return;
                }
            }
        }

        // One pull in flight; stay responsive to commands while it runs.
        let item = tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                Some(WorkerCmd::Credit(n)) => {
                    credit = credit.saturating_add(n);
                    continue;
                }
                Some(WorkerCmd::Cancel) | None => {
                    debug!(log, "outbound worker cancelled"; "channel" => channel);
                    return;
                }
            },
            item = source.next() => item,
        };

        match item {
            Some(Ok(value)) => match codec.encode(&value) {
                Ok(bytes) => {
                    if outbound.send(Message::consume(channel, &bytes)).is_err() {
                        return;
                    }
                    credit -= 1;
                }
                Err(e) => {
                    let _ = outbound.send(Message::fail(
                        channel,
                        STATUS_INTERNAL,
                        &e.to_string(),
                        &BTreeMap::new(),
                    ));
                    return;
                }
            },
            Some(Err(e)) => {
                let _ = outbound.send(Message::fail(
                    channel,
                    STATUS_INTERNAL,
                    &e.to_string(),
                    &BTreeMap::new(),
                ));
                return;
            }
            None => {
                let _ = outbound.send(Message::complete(channel));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::protocol::MessageKind;
    use futures::stream;
    use serde_json::json;
    use std::time::Duration;

    fn spawn_numbers(n: i64) -> (WorkerHandle, mpsc::UnboundedReceiver<Message>) {
        let source: ValueStream =
            stream::iter((0..n).map(|i| Ok(json!(i)))).boxed();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            0,
            source,
            Arc::new(JsonCodec),
            out_tx,
            crate::fallback_logger(),
        );
        (handle, out_rx)
    }

    #[tokio::test]
    async fn emits_nothing_without_credit() {
        let (_handle, mut out_rx) = spawn_numbers(5);
        let quiet = tokio::time::timeout(Duration::from_millis(50), out_rx.recv()).await;
        assert!(quiet.is_err(), "worker emitted before any credit arrived");
    }

    #[tokio::test]
    async fn emits_exactly_the_granted_credit() {
        let (handle, mut out_rx) = spawn_numbers(10);
        handle.cmd_tx.send(WorkerCmd::Credit(4)).unwrap();

        for i in 0..4 {
            let msg = out_rx.recv().await.unwrap();
            assert_eq!(msg.kind(), MessageKind::Consume);
            assert_eq!(msg.entity(), Some(i.to_string().as_bytes()));
        }
        let quiet = tokio::time::timeout(Duration::from_millis(50), out_rx.recv()).await;
        assert!(quiet.is_err(), "worker overran its credit");

        // Fresh credit resumes the channel where it stopped.
        handle.cmd_tx.send(WorkerCmd::Credit(6)).unwrap();
        for i in 4..10 {
            let msg = out_rx.recv().await.unwrap();
            assert_eq!(msg.entity(), Some(i.to_string().as_bytes()));
        }
        assert_eq!(out_rx.recv().await.unwrap().kind(), MessageKind::Complete);
    }

    #[tokio::test]
    async fn cancel_stops_without_terminal_record() {
        let (handle, mut out_rx) = spawn_numbers(10);
        handle.cmd_tx.send(WorkerCmd::Credit(1)).unwrap();
        assert_eq!(out_rx.recv().await.unwrap().kind(), MessageKind::Consume);

        handle.cmd_tx.send(WorkerCmd::Cancel).unwrap();
        assert!(out_rx.recv().await.is_none(), "nothing may follow a cancel");
    }

    #[tokio::test]
    async fn source_failure_becomes_fail_record() {
        let source: ValueStream = stream::iter(vec![
            Ok(json!(1)),
            Err(RpcError::Payload("bad element".to_string())),
        ])
        .boxed();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            2,
            source,
            Arc::new(JsonCodec),
            out_tx,
            crate::fallback_logger(),
        );
        handle.cmd_tx.send(WorkerCmd::Credit(5)).unwrap();

        assert_eq!(out_rx.recv().await.unwrap().kind(), MessageKind::Consume);
        let fail = out_rx.recv().await.unwrap();
        assert_eq!(fail.kind(), MessageKind::Fail);
        assert_eq!(fail.channel(), 2);
        assert_eq!(fail.error_code(), STATUS_INTERNAL);
        assert!(out_rx.recv().await.is_none());
    }
}
