// Copyright 2026 Joyent, Inc.

//! Invocation session driver.
//!
//! One driver task per invocation owns the connection for its whole life:
//! it forwards queued outbound records onto the wire and dispatches inbound
//! records strictly in receipt order.  Dispatch is an exhaustive match over
//! the message kinds, so a new kind forces review of every arm.  The driver
//! is the only place connection-level failure is observed; it fans the
//! terminal outcome to the unary waiter, the return-channel consumer, and
//! every outbound worker so that nothing is left dangling.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use slog::{debug, warn, Logger};
use tokio::sync::{mpsc, oneshot};

use crate::codec::PayloadCodec;
use crate::consumer::SharedChannel;
use crate::errors::{Fault, FaultRegistry, RpcError};
use crate::outbound::{WorkerCmd, WorkerHandle};
use crate::protocol::{Message, MessageKind, RETURN_CHANNEL, STATUS_OK};
use crate::transport::{FrameTransport, CLOSE_NORMAL};

/// How the invocation's return value comes back.
pub(crate) enum ReturnShape {
    /// One RESPONSE record wakes the blocked caller through this sender.
    Unary(oneshot::Sender<Result<Value, RpcError>>),
    /// CONSUME/COMPLETE/FAIL records feed the return-channel consumer.
    Streaming(Arc<SharedChannel>),
}

pub(crate) struct SessionDriver<Tr> {
    transport: Tr,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    unary: Option<oneshot::Sender<Result<Value, RpcError>>>,
    ret: Option<Arc<SharedChannel>>,
    workers: HashMap<i64, WorkerHandle>,
    codec: Arc<dyn PayloadCodec>,
    registry: Arc<FaultRegistry>,
    operation: String,
    log: Logger,
}

enum Flow {
    Continue,
    /// The invocation reached its terminal state; wind the connection down.
    Stop,
}

enum Step {
    Outbound(Option<Message>),
    Inbound(io::Result<Option<Bytes>>),
}

impl<Tr: FrameTransport + Send + 'static> SessionDriver<Tr> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        transport: Tr,
        outbound_rx: mpsc::UnboundedReceiver<Message>,
        ret: ReturnShape,
        workers: HashMap<i64, WorkerHandle>,
        codec: Arc<dyn PayloadCodec>,
        registry: Arc<FaultRegistry>,
        operation: String,
        log: Logger,
    ) {
        let (unary, ret) = match ret {
            ReturnShape::Unary(tx) => (Some(tx), None),
            ReturnShape::Streaming(consumer) => (None, Some(consumer)),
        };
        let driver = SessionDriver {
            transport,
            outbound_rx,
            unary,
            ret,
            workers,
            codec,
            registry,
            operation,
            log,
        };
        tokio::spawn(driver.run());
    }

    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                outbound = self.outbound_rx.recv() => Step::Outbound(outbound),
                inbound = self.transport.recv() => Step::Inbound(inbound),
            };
            match step {
                Step::Outbound(Some(msg)) => {
                    let kind = msg.kind();
                    let channel = msg.channel();
                    if let Err(e) = self.transport.send(msg.to_bytes()).await {
                        self.fan_out_failure(RpcError::Transport(e));
                        return;
                    }
                    if kind == MessageKind::Cancel {
                        if channel == RETURN_CHANNEL {
                            // The caller abandoned the return stream; the
                            // invocation is over.
                            self.wind_down().await;
                            return;
                        }
                        // A locally-originated argument-channel cancel
                        // (deadline teardown): stop that worker too.
                        if let Some(worker) = self.workers.remove(&channel) {
                            let _ = worker.cmd_tx.send(WorkerCmd::Cancel);
                        }
                    }
                }
                Step::Outbound(None) => {
                    // Every local handle is gone: workers finished and the
                    // pull source (if any) was dropped or drained.
                    self.wind_down().await;
                    return;
                }
                Step::Inbound(Ok(Some(frame))) => {
                    let msg = Message::decode(&frame);
                    if let Flow::Stop = self.dispatch(msg) {
                        self.wind_down().await;
                        return;
                    }
                }
                Step::Inbound(Ok(None)) => {
                    self.fan_out_failure(RpcError::ConnectionClosed);
                    return;
                }
                Step::Inbound(Err(e)) => {
                    self.fan_out_failure(RpcError::Transport(e));
                    return;
                }
            }
        }
    }

    /// Apply one inbound record to the session state machine.  Runs on the
    /// driver task only, strictly in receipt order.
    fn dispatch(&mut self, msg: Message) -> Flow {
        match msg.kind() {
            MessageKind::Response => self.on_response(msg),
            MessageKind::Consume => {
                match (&self.ret, msg.channel()) {
                    (Some(consumer), RETURN_CHANNEL) => match msg.entity() {
                        Some(entity) => consumer.push(entity.to_vec()),
                        None => warn!(self.log, "dropping consume without entity"),
                    },
                    _ => warn!(self.log, "dropping consume for unknown channel";
                               "channel" => msg.channel()),
                }
                Flow::Continue
            }
            MessageKind::Complete => match (&self.ret, msg.channel()) {
                (Some(consumer), RETURN_CHANNEL) => {
                    consumer.complete();
                    Flow::Stop
                }
                _ => {
                    warn!(self.log, "dropping complete for unknown channel";
                          "channel" => msg.channel());
                    Flow::Continue
                }
            },
            MessageKind::Fail => match (&self.ret, msg.channel()) {
                (Some(consumer), RETURN_CHANNEL) => {
                    let fault = Fault::from_fail(&msg);
                    consumer.fail(self.registry.reconstruct(&self.operation, fault));
                    Flow::Stop
                }
                _ => {
                    warn!(self.log, "dropping fail for unknown channel";
                          "channel" => msg.channel());
                    Flow::Continue
                }
            },
            MessageKind::RequestElement => {
                match self.workers.get(&msg.channel()) {
                    Some(worker) => {
                        let _ = worker.cmd_tx.send(WorkerCmd::Credit(msg.count()));
                    }
                    None => warn!(self.log, "dropping credit for unknown channel";
                                  "channel" => msg.channel()),
                }
                Flow::Continue
            }
            MessageKind::Cancel => {
                match self.workers.remove(&msg.channel()) {
                    Some(worker) => {
                        let _ = worker.cmd_tx.send(WorkerCmd::Cancel);
                    }
                    None => warn!(self.log, "dropping cancel for unknown channel";
                                  "channel" => msg.channel()),
                }
                Flow::Continue
            }
            MessageKind::Request => {
                warn!(self.log, "dropping request received on caller connection");
                Flow::Continue
            }
            MessageKind::Unknown => {
                debug!(self.log, "dropping message of unrecognized kind");
                Flow::Continue
            }
        }
    }

    fn on_response(&mut self, msg: Message) -> Flow {
        let waiter = match self.unary.take() {
            Some(waiter) => waiter,
            None => {
                // Either a second RESPONSE for a resolved session or a
                // RESPONSE on a streaming invocation; both are protocol
                // violations that must not sever anything.
                warn!(self.log, "dropping response for resolved session");
                return Flow::Continue;
            }
        };
        let result = if msg.error_code() == STATUS_OK {
            match msg.entity() {
                Some(entity) => self.codec.decode(entity),
                None => Ok(Value::Null),
            }
        } else {
            let fault = Fault::from_response(&msg);
            Err(self.registry.reconstruct(&self.operation, fault))
        };
        // The caller may have stopped waiting (deadline); that is its
        // business, the session still winds down.
        let _ = waiter.send(result);
        Flow::Stop
    }

    /// Orderly end of the invocation: release every worker, close the
    /// connection.  Buffered return elements still drain through the shared
    /// consumer state after the driver is gone.
    async fn wind_down(mut self) {
        for (_, worker) in self.workers.drain() {
            let _ = worker.cmd_tx.send(WorkerCmd::Cancel);
        }
        if let Err(e) = self.transport.close(CLOSE_NORMAL, "session complete").await {
            debug!(self.log, "close after session end failed"; "err" => %e);
        }
    }

    /// The connection died under the invocation: every open outcome gets
    /// exactly one terminal signal.
    fn fan_out_failure(&mut self, err: RpcError) {
        warn!(self.log, "connection failed under open session"; "err" => %err);
        if let Some(waiter) = self.unary.take() {
            let _ = waiter.send(Err(err));
        } else if let Some(consumer) = &self.ret {
            consumer.fail(err);
        }
        for (_, worker) in self.workers.drain() {
            let _ = worker.cmd_tx.send(WorkerCmd::Cancel);
        }
    }
}
