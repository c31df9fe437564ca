// Copyright 2026 Joyent, Inc.

//! Full-duplex transport bindings.
//!
//! The session driver speaks to the network through [`FrameTransport`]: a
//! carrier of whole binary frames, one encoded message per frame.  The
//! binding owns no buffering beyond the frame in flight; all element
//! buffering belongs to the consumer and worker layers.  Three carriers are
//! provided: WebSocket, length-prefix-framed byte streams (TCP and friends),
//! and an in-process pair for tests.

use std::future::Future;
use std::io::{self, Error, ErrorKind};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Framed;

use crate::protocol::FrameCodec;

/// WebSocket close code for an orderly end of session.
pub const CLOSE_NORMAL: u16 = 1000;

/// A full-duplex carrier of binary frames.
///
/// `recv` must be cancellation-safe: the driver polls it inside a select and
/// may drop the future between frames without losing data.
pub trait FrameTransport {
    fn send(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Next inbound frame; `None` on orderly close.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    fn close(&mut self, code: u16, reason: &str) -> impl Future<Output = io::Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// WebSocket carrier.  Messages travel as binary frames, one per record;
/// pings are answered inline and a peer close surfaces as end-of-stream.
pub struct WebSocketTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S> {
    pub fn new(inner: WebSocketStream<S>) -> WebSocketTransport<S> {
        WebSocketTransport { inner }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

fn ws_io_error(e: WsError) -> Error {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            Error::new(ErrorKind::NotConnected, "websocket closed")
        }
        WsError::Io(e) => e,
        other => Error::new(ErrorKind::Other, other.to_string()),
    }
}

impl<S> FrameTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.inner
            .send(WsMessage::Binary(frame.to_vec()))
            .await
            .map_err(ws_io_error)
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = self.inner.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => (),
                Some(Ok(WsMessage::Text(_))) => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "text frames not allowed",
                    ));
                }
                Some(Ok(WsMessage::Frame(_))) => (),
                Some(Err(WsError::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(ws_io_error(e)),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        match self.inner.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_io_error(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Length-prefix-framed byte streams
// ---------------------------------------------------------------------------

/// Carrier over any async byte stream (TCP, Unix sockets), framed by the
/// protocol's 4-byte length prefix.  Close codes have no wire representation
/// here; closing flushes and shuts the stream down.
pub struct FramedStream<S> {
    inner: Framed<S, FrameCodec>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> FramedStream<S> {
        FramedStream {
            inner: Framed::new(stream, FrameCodec),
        }
    }
}

impl<S> FrameTransport for FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.inner.send(frame).await
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.inner.next().await.transpose()
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> io::Result<()> {
        SinkExt::close(&mut self.inner).await
    }
}

// ---------------------------------------------------------------------------
// In-process pair
// ---------------------------------------------------------------------------

/// In-process carrier backed by a pair of bounded channels.  No IO, no
/// serialization beyond the frames themselves; handy for exercising the
/// session machinery (and scripted peers in tests) without networking.
pub struct MemoryTransport {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

/// Create two connected [`MemoryTransport`]s: frames sent on one arrive on
/// the other.
pub fn memory_pair(buffer: usize) -> (MemoryTransport, MemoryTransport) {
    let (tx_a, rx_b) = mpsc::channel(buffer);
    let (tx_b, rx_a) = mpsc::channel(buffer);
    (
        MemoryTransport {
            tx: Some(tx_a),
            rx: rx_a,
        },
        MemoryTransport {
            tx: Some(tx_b),
            rx: rx_b,
        },
    )
}

impl FrameTransport for MemoryTransport {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| Error::new(ErrorKind::BrokenPipe, "peer dropped")),
            None => Err(Error::new(ErrorKind::NotConnected, "transport closed")),
        }
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> io::Result<()> {
        // Dropping the sender is the close; the peer reads end-of-stream.
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_delivers_and_closes() {
        let (mut a, mut b) = memory_pair(4);
        a.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"hello"));

        a.close(CLOSE_NORMAL, "done").await.unwrap();
        assert!(b.recv().await.unwrap().is_none());
        assert!(a.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn framed_stream_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = FramedStream::new(client);
        let mut server = FramedStream::new(server);

        client.send(Bytes::from_static(b"one")).await.unwrap();
        client.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(server.recv().await.unwrap().unwrap(), "one");
        assert_eq!(server.recv().await.unwrap().unwrap(), "two");
    }
}
