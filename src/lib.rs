// Copyright 2026 Joyent, Inc.

//! Sluice: a credit-based streaming RPC transport
//!
//! Sluice lets a caller invoke a remote operation that returns either a
//! single value or an open-ended stream of values, and that may itself
//! supply one or more streamed arguments.  Everything for one invocation is
//! multiplexed over a single full-duplex connection (a WebSocket or a framed
//! byte stream); one-directional server-to-client streaming can instead ride
//! a chunked HTTP response consumed as server-sent events.
//!
//! Protocol definition
//!
//! Every wire record is a self-describing tag-length-value (TLV) message:
//! an ordered set of fields, each encoded as
//!
//! * TAG      1-byte field tag
//! * LEN      4-byte big-endian unsigned integer, the value length in bytes
//! * VALUE    LEN bytes of payload
//!
//! A field's value may itself be an encoded message, so records nest.
//! Numeric field values (message kind, channel index, credit counts, status
//! codes) are carried as decimal ASCII text to remain endian-agnostic;
//! entity payloads are opaque bytes interpreted by the payload codec.
//! Decoding is total: unknown tags are skipped and malformed trailing bytes
//! end the parse without severing the connection.
//!
//! Message kinds: REQUEST, RESPONSE, CONSUME, COMPLETE, FAIL,
//! REQUEST_ELEMENT, CANCEL.  Anything else decodes as UNKNOWN and is logged
//! and dropped.
//!
//! Channels: each streamed argument of an invocation is assigned a
//! non-negative channel index in signature order; the reserved index -1
//! identifies the return-value channel.  A producer may only emit CONSUME
//! records against credit previously granted by the consumer through
//! REQUEST_ELEMENT, so neither side ever buffers unboundedly.

#![allow(missing_docs)]

pub mod chunked;
pub mod client;
pub mod codec;
pub mod consumer;
pub mod errors;
pub mod outbound;
pub mod protocol;
pub mod session;
pub mod transport;

use slog::{o, Drain, Logger};

/// Root logger used when a component is not handed one, backed by the
/// standard `log` facade.
pub(crate) fn fallback_logger() -> Logger {
    Logger::root(slog_stdlog::StdLog.fuse(), o!())
}
