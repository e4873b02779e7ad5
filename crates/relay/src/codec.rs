//! Wire encoding for events and stage definitions.
//!
//! Every value crossing a process boundary shares one framing discipline:
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────────┐
//! │ length: u32 (BE)     │ body: `length` encoded bytes  │
//! └──────────────────────┴───────────────────────────────┘
//! ```
//!
//! Events use the Avro binary encoding of [`EVENT_SCHEMA`]; stage
//! definitions are carried as JSON. Frames are self-delimiting, so a body
//! that fails to decode does not affect the frames after it. A frame whose
//! declared length is not available is a [`RelayError::Framing`] error.

use crate::definition::StageDefinition;
use crate::error::{RelayError, Result};
use crate::event::Event;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Avro schema of the event record.
pub const EVENT_SCHEMA: &str = r#"{
  "type": "record",
  "name": "Event",
  "fields": [
    {"name": "id", "type": "string"},
    {"name": "timestamp", "type": "long"},
    {"name": "path", "type": {"type": "array", "items": "string"}},
    {"name": "headers", "type": {"type": "map", "values": "string"}},
    {"name": "body", "type": "bytes"}
  ]
}"#;

/// A value with a body encoding that can ride inside a frame.
pub trait WireCodec: Sized {
    /// Appends the body encoding of `self` to `buf`.
    fn encode_body(&self, buf: &mut BytesMut) -> Result<()>;

    /// Decodes a value from a complete frame body.
    fn decode_body(body: Bytes) -> Result<Self>;
}

/// Encodes `value` as one length-prefixed frame.
pub fn encode_frame<T: WireCodec>(value: &T) -> Result<Bytes> {
    let mut body = BytesMut::new();
    value.encode_body(&mut body)?;
    let len = u32::try_from(body.len())
        .map_err(|_| RelayError::Framing(format!("frame body of {} bytes", body.len())))?;

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32(len);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Decodes the next frame from `buf`, advancing past it.
///
/// The buffer is advanced past a well-framed message even when its body
/// fails to decode.
pub fn decode_frame<T: WireCodec>(buf: &mut Bytes) -> Result<T> {
    if buf.remaining() < FRAME_HEADER_LEN {
        return Err(RelayError::Framing(format!(
            "need {FRAME_HEADER_LEN} header bytes, have {}",
            buf.remaining()
        )));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.remaining() - FRAME_HEADER_LEN < len {
        return Err(RelayError::Framing(format!(
            "frame declares {len} bytes, only {} available",
            buf.remaining() - FRAME_HEADER_LEN
        )));
    }
    buf.advance(FRAME_HEADER_LEN);
    let body = buf.split_to(len);
    T::decode_body(body)
}

/// Decodes every frame in `buf`, one result per frame.
///
/// Stops at the first framing error, which is returned as the last item.
pub fn decode_frames<T: WireCodec>(mut buf: Bytes) -> Vec<Result<T>> {
    let mut out = Vec::new();
    while buf.has_remaining() {
        let before = buf.remaining();
        let item = decode_frame(&mut buf);
        let framing_failed = matches!(item, Err(RelayError::Framing(_)));
        out.push(item);
        if framing_failed || buf.remaining() == before {
            break;
        }
    }
    out
}

impl WireCodec for Event {
    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        avro::put_string(buf, self.id());
        avro::put_long(buf, self.timestamp());
        avro::put_string_array(buf, self.path());
        avro::put_string_map(buf, self.headers());
        avro::put_bytes(buf, self.body());
        Ok(())
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        let id = avro::get_string(&mut body)?;
        let timestamp = avro::get_long(&mut body)?;
        let path = avro::get_string_array(&mut body)?;
        let headers = avro::get_string_map(&mut body)?;
        let payload = avro::get_bytes(&mut body)?;
        if body.has_remaining() {
            return Err(RelayError::Decode(format!(
                "{} trailing bytes after event record",
                body.remaining()
            )));
        }
        Ok(Event::from_parts(id, timestamp, path, headers, payload))
    }
}

impl WireCodec for StageDefinition {
    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        buf.extend_from_slice(&json);
        Ok(())
    }

    fn decode_body(body: Bytes) -> Result<Self> {
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Avro binary primitives.
mod avro {
    use super::*;

    const MAX_VARINT_LEN: usize = 10;

    pub(super) fn put_long(buf: &mut BytesMut, value: i64) {
        let mut n = ((value << 1) ^ (value >> 63)) as u64;
        while n >= 0x80 {
            buf.put_u8((n as u8 & 0x7f) | 0x80);
            n >>= 7;
        }
        buf.put_u8(n as u8);
    }

    pub(super) fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
        put_long(buf, bytes.len() as i64);
        buf.extend_from_slice(bytes);
    }

    pub(super) fn put_string(buf: &mut BytesMut, s: &str) {
        put_bytes(buf, s.as_bytes());
    }

    /// One block holding every item, then the zero terminator.
    pub(super) fn put_string_array(buf: &mut BytesMut, items: &[String]) {
        if !items.is_empty() {
            put_long(buf, items.len() as i64);
            for item in items {
                put_string(buf, item);
            }
        }
        put_long(buf, 0);
    }

    pub(super) fn put_string_map(buf: &mut BytesMut, map: &HashMap<String, String>) {
        if !map.is_empty() {
            // sorted for a deterministic encoding
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort();
            put_long(buf, entries.len() as i64);
            for (k, v) in entries {
                put_string(buf, k);
                put_string(buf, v);
            }
        }
        put_long(buf, 0);
    }

    pub(super) fn get_long(buf: &mut Bytes) -> Result<i64> {
        let mut n: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            if !buf.has_remaining() {
                return Err(RelayError::Decode("truncated varint".into()));
            }
            let byte = buf.get_u8();
            n |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(((n >> 1) as i64) ^ -((n & 1) as i64));
            }
        }
        Err(RelayError::Decode("varint longer than 10 bytes".into()))
    }

    fn get_len(buf: &mut Bytes) -> Result<usize> {
        let len = get_long(buf)?;
        let len = usize::try_from(len)
            .map_err(|_| RelayError::Decode(format!("negative length {len}")))?;
        if buf.remaining() < len {
            return Err(RelayError::Decode(format!(
                "length {len} exceeds remaining {}",
                buf.remaining()
            )));
        }
        Ok(len)
    }

    pub(super) fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
        let len = get_len(buf)?;
        Ok(buf.split_to(len))
    }

    pub(super) fn get_string(buf: &mut Bytes) -> Result<String> {
        let raw = get_bytes(buf)?;
        String::from_utf8(raw.to_vec()).map_err(|e| RelayError::Decode(e.to_string()))
    }

    /// Reads a block count. Negative counts are followed by the block's
    /// byte size, which is skipped.
    fn get_block_count(buf: &mut Bytes) -> Result<usize> {
        let count = get_long(buf)?;
        if count < 0 {
            get_long(buf)?;
        }
        usize::try_from(count.unsigned_abs())
            .map_err(|_| RelayError::Decode(format!("block count {count}")))
    }

    pub(super) fn get_string_array(buf: &mut Bytes) -> Result<Vec<String>> {
        let mut items = Vec::new();
        loop {
            let count = get_block_count(buf)?;
            if count == 0 {
                return Ok(items);
            }
            for _ in 0..count {
                items.push(get_string(buf)?);
            }
        }
    }

    pub(super) fn get_string_map(buf: &mut Bytes) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        loop {
            let count = get_block_count(buf)?;
            if count == 0 {
                return Ok(map);
            }
            for _ in 0..count {
                let key = get_string(buf)?;
                let value = get_string(buf)?;
                map.insert(key, value);
            }
        }
    }
}
