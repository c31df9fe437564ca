// Copyright 2026 Joyent, Inc.

//! Wire message model and codecs.
//!
//! A [`Message`] is an ordered set of tagged fields.  Field tags are one
//! byte; values are length-prefixed byte strings and may themselves be
//! encoded messages.  The well-known tags below cover every record shape in
//! the protocol; receivers skip tags they do not recognize.

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind};
use std::str;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num::{FromPrimitive as _, ToPrimitive as _};
use num_derive::{FromPrimitive, ToPrimitive};
use tokio_util::codec::{Decoder, Encoder};

/// Message kind, the "type" field of every record.
pub const FIELD_KIND: u8 = 0x01;
/// Channel index of channel-bearing records; absent means the return channel.
pub const FIELD_CHANNEL: u8 = 0x02;
/// Payload data format label, e.g. "json".
pub const FIELD_FORMAT: u8 = 0x03;
/// Operation version label.
pub const FIELD_VERSION: u8 = 0x04;
/// Entity payload bytes, opaque to this layer.
pub const FIELD_ENTITY: u8 = 0x05;
/// Status code of a RESPONSE or FAIL record, decimal text.
pub const FIELD_ERROR_CODE: u8 = 0x06;
/// Human-readable error message of a RESPONSE or FAIL record.
pub const FIELD_ERROR_MESSAGE: u8 = 0x07;
/// Credit count of a REQUEST_ELEMENT record, decimal text.
pub const FIELD_COUNT: u8 = 0x08;
/// Extensions map of REQUEST/RESPONSE records, a nested message.
pub const FIELD_EXTENSIONS: u8 = 0x09;
/// Properties map of a FAIL record, a nested message.
pub const FIELD_PROPERTIES: u8 = 0x0a;

/// Reserved channel index of the callee-to-caller return-value flow.
/// Non-negative indices identify streamed arguments in signature order.
pub const RETURN_CHANNEL: i64 = -1;

/// Status code denoting success in a RESPONSE record.  An absent status
/// field means the same thing.
pub const STATUS_OK: u32 = 0;

/// Status code used for locally-originated failures forwarded as FAIL.
pub const STATUS_INTERNAL: u32 = 1;

/// Operation version stamped on outbound REQUEST records.
pub const OPERATION_VERSION: &str = "1";

/// Tag values for the message kind field.  Unrecognized values decode as
/// `Unknown` so that newer peers never sever the connection; dispatch logs
/// and drops them.
#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Unknown = 0,
    Request = 1,
    Response = 2,
    Consume = 3,
    Complete = 4,
    Fail = 5,
    RequestElement = 6,
    Cancel = 7,
}

/// One wire record: a set of tagged fields, unique per tag.
///
/// Decoding is total.  Unknown tags are retained verbatim (and re-encoded on
/// a roundtrip), a truncated trailing field ends the parse with whatever was
/// recognized so far, and a duplicated tag keeps its first occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    fields: BTreeMap<u8, Vec<u8>>,
}

impl Message {
    fn with_kind(kind: MessageKind) -> Message {
        let mut msg = Message::default();
        msg.put_number(FIELD_KIND, kind.to_i64().unwrap_or(0));
        msg
    }

    pub fn request(
        format: &str,
        version: &str,
        extensions: &BTreeMap<String, String>,
        entity: &[u8],
    ) -> Message {
        let mut msg = Message::with_kind(MessageKind::Request);
        msg.put(FIELD_FORMAT, format.as_bytes().to_vec());
        msg.put(FIELD_VERSION, version.as_bytes().to_vec());
        msg.put_map(FIELD_EXTENSIONS, extensions);
        msg.put(FIELD_ENTITY, entity.to_vec());
        msg
    }

    pub fn response(
        format: &str,
        code: u32,
        error_message: &str,
        extensions: &BTreeMap<String, String>,
        entity: Option<&[u8]>,
    ) -> Message {
        let mut msg = Message::with_kind(MessageKind::Response);
        msg.put(FIELD_FORMAT, format.as_bytes().to_vec());
        msg.put_number(FIELD_ERROR_CODE, i64::from(code));
        if !error_message.is_empty() {
            msg.put(FIELD_ERROR_MESSAGE, error_message.as_bytes().to_vec());
        }
        msg.put_map(FIELD_EXTENSIONS, extensions);
        if let Some(entity) = entity {
            msg.put(FIELD_ENTITY, entity.to_vec());
        }
        msg
    }

    pub fn consume(channel: i64, entity: &[u8]) -> Message {
        let mut msg = Message::with_kind(MessageKind::Consume);
        msg.put_number(FIELD_CHANNEL, channel);
        msg.put(FIELD_ENTITY, entity.to_vec());
        msg
    }

    pub fn complete(channel: i64) -> Message {
        let mut msg = Message::with_kind(MessageKind::Complete);
        msg.put_number(FIELD_CHANNEL, channel);
        msg
    }

    pub fn fail(
        channel: i64,
        code: u32,
        error_message: &str,
        properties: &BTreeMap<String, String>,
    ) -> Message {
        let mut msg = Message::with_kind(MessageKind::Fail);
        msg.put_number(FIELD_CHANNEL, channel);
        msg.put_number(FIELD_ERROR_CODE, i64::from(code));
        msg.put(FIELD_ERROR_MESSAGE, error_message.as_bytes().to_vec());
        msg.put_map(FIELD_PROPERTIES, properties);
        msg
    }

    pub fn request_element(channel: i64, count: u64) -> Message {
        let mut msg = Message::with_kind(MessageKind::RequestElement);
        msg.put_number(FIELD_CHANNEL, channel);
        msg.put_number(FIELD_COUNT, count as i64);
        msg
    }

    pub fn cancel(channel: i64) -> Message {
        let mut msg = Message::with_kind(MessageKind::Cancel);
        msg.put_number(FIELD_CHANNEL, channel);
        msg
    }

    /// Insert a field, replacing any previous value for the tag.
    pub fn put(&mut self, tag: u8, value: Vec<u8>) {
        self.fields.insert(tag, value);
    }

    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.fields.get(&tag).map(|v| v.as_slice())
    }

    fn put_number(&mut self, tag: u8, value: i64) {
        self.put(tag, value.to_string().into_bytes());
    }

    fn number(&self, tag: u8) -> Option<i64> {
        let raw = self.get(tag)?;
        str::from_utf8(raw).ok()?.trim().parse().ok()
    }

    /// Encode a string map as a nested message: entries take tags 1..=255 in
    /// map order, each value the `key=value` text of one entry.  Maps larger
    /// than 255 entries lose the tail; no record in this protocol comes
    /// close.
    fn put_map(&mut self, tag: u8, map: &BTreeMap<String, String>) {
        if map.is_empty() {
            return;
        }
        let mut nested = Message::default();
        for (i, (key, value)) in map.iter().take(usize::from(u8::MAX)).enumerate() {
            nested.put((i + 1) as u8, format!("{}={}", key, value).into_bytes());
        }
        self.put(tag, nested.to_bytes().to_vec());
    }

    fn map(&self, tag: u8) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(raw) = self.get(tag) {
            let nested = Message::decode(raw);
            for value in nested.fields.values() {
                if let Ok(text) = str::from_utf8(value) {
                    if let Some((key, value)) = text.split_once('=') {
                        map.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }
        map
    }

    /// Message kind from the well-known type field, `Unknown` when absent or
    /// unrecognized.
    pub fn kind(&self) -> MessageKind {
        self.number(FIELD_KIND)
            .and_then(MessageKind::from_i64)
            .unwrap_or(MessageKind::Unknown)
    }

    /// Channel index, defaulting to the return sentinel when absent.
    pub fn channel(&self) -> i64 {
        self.number(FIELD_CHANNEL).unwrap_or(RETURN_CHANNEL)
    }

    /// Credit count of a REQUEST_ELEMENT record; zero when absent or
    /// unparsable.
    pub fn count(&self) -> u64 {
        self.number(FIELD_COUNT).filter(|n| *n >= 0).unwrap_or(0) as u64
    }

    pub fn error_code(&self) -> u32 {
        self.number(FIELD_ERROR_CODE)
            .filter(|n| *n >= 0)
            .unwrap_or(i64::from(STATUS_OK)) as u32
    }

    pub fn error_message(&self) -> String {
        self.get(FIELD_ERROR_MESSAGE)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    }

    pub fn entity(&self) -> Option<&[u8]> {
        self.get(FIELD_ENTITY)
    }

    pub fn data_format(&self) -> Option<&str> {
        self.get(FIELD_FORMAT).and_then(|raw| str::from_utf8(raw).ok())
    }

    pub fn operation_version(&self) -> Option<&str> {
        self.get(FIELD_VERSION).and_then(|raw| str::from_utf8(raw).ok())
    }

    pub fn extensions(&self) -> BTreeMap<String, String> {
        self.map(FIELD_EXTENSIONS)
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.map(FIELD_PROPERTIES)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut len_buf = [0u8; 4];
        for (tag, value) in &self.fields {
            buf.reserve(5 + value.len());
            buf.put_u8(*tag);
            BigEndian::write_u32(&mut len_buf, value.len() as u32);
            buf.put_slice(&len_buf);
            buf.put_slice(value);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a record.  Total: never fails, never panics.  Parsing stops at
    /// the first field whose declared length overruns the buffer; fields
    /// recognized up to that point are kept.
    pub fn decode(buf: &[u8]) -> Message {
        let mut fields = BTreeMap::new();
        let mut offset = 0;
        while buf.len() - offset >= 5 {
            let tag = buf[offset];
            let len = BigEndian::read_u32(&buf[offset + 1..offset + 5]) as usize;
            let end = offset + 5 + len;
            if end > buf.len() {
                break;
            }
            fields
                .entry(tag)
                .or_insert_with(|| buf[offset + 5..end].to_vec());
            offset = end;
        }
        Message { fields }
    }
}

/// Largest frame accepted off the wire.  A peer announcing more than this is
/// treated as a framing error rather than a buffering obligation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length-prefixed frame codec for byte-stream carriers (TCP, Unix
/// sockets).  Each frame is a 4-byte big-endian length followed by one
/// encoded [`Message`].  WebSocket carriers need no prefix; a binary frame
/// is already one message.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = BigEndian::read_u32(&src[..4]) as usize;
        if frame_len > MAX_FRAME_SIZE {
            let msg = format!("frame of {} bytes exceeds maximum", frame_len);
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        if item.len() > MAX_FRAME_SIZE {
            let msg = format!("frame of {} bytes exceeds maximum", item.len());
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, item.len() as u32);
        dst.reserve(4 + item.len());
        dst.put_slice(&len_buf);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn request_roundtrip() {
        let mut ext = BTreeMap::new();
        ext.insert("operation".to_string(), "getObject".to_string());
        ext.insert("ts".to_string(), "2026-01-05T00:00:00Z".to_string());
        let msg = Message::request("json", OPERATION_VERSION, &ext, b"[\"bucket\"]");

        let decoded = Message::decode(&msg.to_bytes());
        assert_eq!(decoded.kind(), MessageKind::Request);
        assert_eq!(decoded.data_format(), Some("json"));
        assert_eq!(decoded.operation_version(), Some(OPERATION_VERSION));
        assert_eq!(decoded.entity(), Some(&b"[\"bucket\"]"[..]));
        assert_eq!(decoded.extensions(), ext);
        // REQUEST carries no channel field; the accessor falls back to the
        // return sentinel.
        assert_eq!(decoded.channel(), RETURN_CHANNEL);
    }

    #[test]
    fn fail_roundtrip() {
        let mut props = BTreeMap::new();
        props.insert("bucket".to_string(), "manta".to_string());
        let msg = Message::fail(2, 404, "no such bucket", &props);

        let decoded = Message::decode(&msg.to_bytes());
        assert_eq!(decoded.kind(), MessageKind::Fail);
        assert_eq!(decoded.channel(), 2);
        assert_eq!(decoded.error_code(), 404);
        assert_eq!(decoded.error_message(), "no such bucket");
        assert_eq!(decoded.properties(), props);
    }

    #[test]
    fn request_element_roundtrip() {
        let msg = Message::request_element(RETURN_CHANNEL, 32);
        let decoded = Message::decode(&msg.to_bytes());
        assert_eq!(decoded.kind(), MessageKind::RequestElement);
        assert_eq!(decoded.channel(), RETURN_CHANNEL);
        assert_eq!(decoded.count(), 32);
        // Counts ride as decimal text on the wire.
        assert_eq!(decoded.get(FIELD_COUNT), Some(&b"32"[..]));
    }

    #[test]
    fn unknown_kind_decodes_as_unknown() {
        let mut msg = Message::default();
        msg.put(FIELD_KIND, b"99".to_vec());
        let decoded = Message::decode(&msg.to_bytes());
        assert_eq!(decoded.kind(), MessageKind::Unknown);
    }

    #[test]
    fn unknown_tags_are_skipped_not_fatal() {
        let mut msg = Message::complete(0);
        msg.put(0x7f, b"from a newer peer".to_vec());
        let decoded = Message::decode(&msg.to_bytes());
        assert_eq!(decoded.kind(), MessageKind::Complete);
        assert_eq!(decoded.channel(), 0);
        assert_eq!(decoded.get(0x7f), Some(&b"from a newer peer"[..]));
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let mut bytes = Message::cancel(1).to_bytes().to_vec();
        // A trailing field claiming more bytes than remain must not abort
        // what was already recognized.
        bytes.extend_from_slice(&[0x42, 0x00, 0x00, 0x10, 0x00, 0xde, 0xad]);
        let decoded = Message::decode(&bytes);
        assert_eq!(decoded.kind(), MessageKind::Cancel);
        assert_eq!(decoded.channel(), 1);
        assert_eq!(decoded.get(0x42), None);
    }

    #[test]
    fn duplicate_tag_keeps_first() {
        let mut buf = BytesMut::new();
        Message::complete(3).encode(&mut buf);
        Message::complete(9).encode(&mut buf);
        let decoded = Message::decode(&buf);
        assert_eq!(decoded.channel(), 3);
    }

    #[test]
    fn frame_codec_reassembles_split_frames() {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        let first = Message::consume(0, b"one").to_bytes();
        let second = Message::complete(0).to_bytes();
        codec.encode(first.clone(), &mut wire).unwrap();
        codec.encode(second.clone(), &mut wire).unwrap();

        // Feed the wire image one byte at a time.
        let mut decoded = Vec::new();
        let mut buf = BytesMut::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn frame_codec_rejects_oversized_claim() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(codec.decode(&mut buf).is_err());
    }

    quickcheck! {
        fn prop_fields_roundtrip(raw: Vec<(u8, Vec<u8>)>) -> bool {
            let mut msg = Message::default();
            let mut expected = BTreeMap::new();
            for (tag, value) in raw {
                // First write wins on the wire, so only mirror the first
                // value seen per tag.
                if !expected.contains_key(&tag) {
                    expected.insert(tag, value.clone());
                }
                msg.fields.entry(tag).or_insert(value);
            }
            Message::decode(&msg.to_bytes()).fields == expected
        }

        fn prop_decode_is_total(raw: Vec<u8>) -> bool {
            // Arbitrary bytes must decode to *something* without panicking.
            let msg = Message::decode(&raw);
            let _ = msg.kind();
            let _ = msg.channel();
            let _ = msg.count();
            true
        }
    }
}
