// Copyright 2026 Joyent, Inc.

//! Call-site API.
//!
//! A [`Caller`] bundles the payload codec, the fault registry, and tuning
//! knobs; each invocation is handed an already-connected transport (routing
//! an operation name to a socket or URL happens a layer above).  Plain
//! arguments travel as one `serde_json::Value`; streamed arguments are
//! passed as [`ValueStream`]s and are assigned channel indices 0..n in the
//! order given.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use slog::{debug, Logger};
use tokio::sync::{mpsc, oneshot};

use crate::chunked::{self, EventExchange};
use crate::codec::{JsonCodec, PayloadCodec};
use crate::consumer::{PullSource, SharedChannel};
use crate::errors::{FaultRegistry, RpcError};
use crate::outbound::{spawn_worker, WorkerHandle};
pub use crate::outbound::ValueStream;
use crate::protocol::{Message, OPERATION_VERSION, RETURN_CHANNEL};
use crate::session::{ReturnShape, SessionDriver};
use crate::transport::FrameTransport;

/// Tuning knobs for one caller.
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Elements of credit issued to the remote when the downstream first
    /// demands, and the high-water mark credit is topped back up to.
    pub credit_window: u64,
    /// Cap on the half-duplex binding's internal buffer: the response body
    /// is only read while fewer than this many elements wait undelivered.
    pub chunked_buffer: usize,
    /// Deadline for unary responses.  On expiry the session is torn down
    /// (argument channels cancelled) and the caller gets
    /// [`RpcError::Timeout`].
    pub unary_deadline: Option<Duration>,
}

impl Default for CallerConfig {
    fn default() -> CallerConfig {
        CallerConfig {
            credit_window: 8,
            chunked_buffer: 256,
            unary_deadline: None,
        }
    }
}

pub struct Caller {
    codec: Arc<dyn PayloadCodec>,
    registry: Arc<FaultRegistry>,
    config: CallerConfig,
    log: Logger,
}

impl Caller {
    pub fn new(
        registry: FaultRegistry,
        config: CallerConfig,
        log: Option<&Logger>,
    ) -> Caller {
        Caller::with_codec(Arc::new(JsonCodec), registry, config, log)
    }

    pub fn with_codec(
        codec: Arc<dyn PayloadCodec>,
        registry: FaultRegistry,
        config: CallerConfig,
        log: Option<&Logger>,
    ) -> Caller {
        let log = log.cloned().unwrap_or_else(crate::fallback_logger);
        Caller {
            codec,
            registry: Arc::new(registry),
            config,
            log,
        }
    }

    /// Invoke an operation declared to return a single value.  Blocks the
    /// calling task until the RESPONSE record arrives, the connection dies,
    /// or the configured deadline expires.
    pub async fn invoke_unary<T, Tr>(
        &self,
        transport: Tr,
        operation: &str,
        args: Value,
        streams: Vec<ValueStream>,
    ) -> Result<T, RpcError>
    where
        T: DeserializeOwned,
        Tr: FrameTransport + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (outbound_tx, stream_count) =
            self.start_session(transport, operation, args, streams, ReturnShape::Unary(reply_tx))?;

        let value = match self.config.unary_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, reply_rx).await {
                Ok(reply) => reply.map_err(|_| RpcError::ConnectionClosed)?,
                Err(_elapsed) => {
                    debug!(self.log, "unary deadline expired, tearing session down";
                           "operation" => operation);
                    for index in 0..stream_count {
                        let _ = outbound_tx.send(Message::cancel(index as i64));
                    }
                    return Err(RpcError::Timeout);
                }
            },
            None => reply_rx.await.map_err(|_| RpcError::ConnectionClosed)?,
        }?;
        serde_json::from_value(value).map_err(|e| RpcError::Payload(e.to_string()))
    }

    /// Invoke an operation declared to return a stream.  Returns the pull
    /// source immediately; elements flow only as it is polled, and dropping
    /// it cancels the remote stream.
    pub async fn invoke_streaming<T, Tr>(
        &self,
        transport: Tr,
        operation: &str,
        args: Value,
        streams: Vec<ValueStream>,
    ) -> Result<PullSource<T>, RpcError>
    where
        T: DeserializeOwned,
        Tr: FrameTransport + Send + 'static,
    {
        let consumer = SharedChannel::new(RETURN_CHANNEL, self.log.clone());
        let (outbound_tx, _) = self.start_session(
            transport,
            operation,
            args,
            streams,
            ReturnShape::Streaming(consumer.clone()),
        )?;
        Ok(PullSource::new(
            consumer,
            self.codec.clone(),
            Some(outbound_tx),
            None,
            self.config.credit_window,
        ))
    }

    /// Open a half-duplex (chunked HTTP response) stream.  The network
    /// exchange itself is deferred until the first unit of demand.
    pub fn open_events<T, X>(&self, exchange: X) -> PullSource<T>
    where
        T: DeserializeOwned,
        X: EventExchange,
    {
        chunked::open(
            exchange,
            self.codec.clone(),
            &self.config,
            self.log.clone(),
        )
    }

    /// Common session setup: workers for every streamed argument, the
    /// driver task, and the REQUEST record.
    fn start_session<Tr>(
        &self,
        transport: Tr,
        operation: &str,
        args: Value,
        streams: Vec<ValueStream>,
        ret: ReturnShape,
    ) -> Result<(mpsc::UnboundedSender<Message>, usize), RpcError>
    where
        Tr: FrameTransport + Send + 'static,
    {
        let request = self.request_message(operation, &args, streams.len())?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let mut workers: HashMap<i64, WorkerHandle> = HashMap::new();
        let stream_count = streams.len();
        for (index, source) in streams.into_iter().enumerate() {
            workers.insert(
                index as i64,
                spawn_worker(
                    index as i64,
                    source,
                    self.codec.clone(),
                    outbound_tx.clone(),
                    self.log.clone(),
                ),
            );
        }

        SessionDriver::spawn(
            transport,
            outbound_rx,
            ret,
            workers,
            self.codec.clone(),
            self.registry.clone(),
            operation.to_string(),
            self.log.clone(),
        );

        outbound_tx
            .send(request)
            .map_err(|_| RpcError::ConnectionClosed)?;
        Ok((outbound_tx, stream_count))
    }

    fn request_message(
        &self,
        operation: &str,
        args: &Value,
        stream_count: usize,
    ) -> Result<Message, RpcError> {
        let entity = self.codec.encode(args)?;
        let mut extensions = BTreeMap::new();
        extensions.insert("operation".to_string(), operation.to_string());
        extensions.insert("ts".to_string(), Utc::now().to_rfc3339());
        if stream_count > 0 {
            extensions.insert("streams".to_string(), stream_count.to_string());
        }
        Ok(Message::request(
            self.codec.format(),
            OPERATION_VERSION,
            &extensions,
            &entity,
        ))
    }
}
