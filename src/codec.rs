//! Wire framing: each message is one self-delimiting MessagePack array.
//!
//! There is no length-prefix header on top of the MessagePack encoding --
//! [`Decoder`] determines frame completeness by scanning marker bytes to
//! compute the exact length of the next top-level value, the same strategy
//! an incremental MessagePack unpacker uses, rather than relying on a
//! length field of our own.

use crate::value::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame exceeds maximum size of {max} bytes")]
    TooLarge { max: usize },
}

/// The wire tag distinguishing the four message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
    Error = 3,
    Event = 4,
}

impl MessageKind {
    fn from_tag(tag: u64) -> Result<Self, CodecError> {
        match tag {
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::Error),
            4 => Ok(MessageKind::Event),
            other => Err(CodecError::Malformed(format!("unknown message kind tag {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { method: String, args: Value, id: u64 },
    Response { id: u64, result: Value },
    Error { id: u64, message: String },
    Event { name: String, args: Value },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Request { method, args, id } => {
                rmp::encode::write_array_len(&mut buf, 4).expect("write to Vec cannot fail");
                write_tag(&mut buf, MessageKind::Request);
                rmp::encode::write_str(&mut buf, method).expect("write to Vec cannot fail");
                rmpv::encode::write_value(&mut buf, &args.to_rmpv()).expect("write to Vec cannot fail");
                rmp::encode::write_uint(&mut buf, *id).expect("write to Vec cannot fail");
            }
            Message::Response { id, result } => {
                rmp::encode::write_array_len(&mut buf, 3).expect("write to Vec cannot fail");
                write_tag(&mut buf, MessageKind::Response);
                rmp::encode::write_uint(&mut buf, *id).expect("write to Vec cannot fail");
                rmpv::encode::write_value(&mut buf, &result.to_rmpv()).expect("write to Vec cannot fail");
            }
            Message::Error { id, message } => {
                rmp::encode::write_array_len(&mut buf, 3).expect("write to Vec cannot fail");
                write_tag(&mut buf, MessageKind::Error);
                rmp::encode::write_uint(&mut buf, *id).expect("write to Vec cannot fail");
                rmp::encode::write_str(&mut buf, message).expect("write to Vec cannot fail");
            }
            Message::Event { name, args } => {
                rmp::encode::write_array_len(&mut buf, 3).expect("write to Vec cannot fail");
                write_tag(&mut buf, MessageKind::Event);
                rmp::encode::write_str(&mut buf, name).expect("write to Vec cannot fail");
                rmpv::encode::write_value(&mut buf, &args.to_rmpv()).expect("write to Vec cannot fail");
            }
        }
        buf
    }

    fn from_rmpv(v: rmpv::Value) -> Result<Message, CodecError> {
        let items = match v {
            rmpv::Value::Array(items) => items,
            other => {
                return Err(CodecError::Malformed(format!(
                    "top-level frame must be an array, got {other:?}"
                )))
            }
        };
        let mut it = items.into_iter();
        let tag = it
            .next()
            .ok_or_else(|| CodecError::Malformed("empty frame array".into()))?
            .as_u64()
            .ok_or_else(|| CodecError::Malformed("message kind tag must be an integer".into()))?;
        let kind = MessageKind::from_tag(tag)?;

        match kind {
            MessageKind::Request => {
                let method = next_str(&mut it, "method")?;
                let args = next_value(&mut it, "args")?;
                let id = next_uint(&mut it, "id")?;
                ensure_exhausted(it)?;
                Ok(Message::Request { method, args, id })
            }
            MessageKind::Response => {
                let id = next_uint(&mut it, "id")?;
                let result = next_value(&mut it, "result")?;
                ensure_exhausted(it)?;
                Ok(Message::Response { id, result })
            }
            MessageKind::Error => {
                let id = next_uint(&mut it, "id")?;
                let message = next_str(&mut it, "error")?;
                ensure_exhausted(it)?;
                Ok(Message::Error { id, message })
            }
            MessageKind::Event => {
                let name = next_str(&mut it, "name")?;
                let args = next_value(&mut it, "args")?;
                ensure_exhausted(it)?;
                Ok(Message::Event { name, args })
            }
        }
    }
}

fn write_tag(buf: &mut Vec<u8>, kind: MessageKind) {
    rmp::encode::write_uint(buf, kind as u64).expect("write to Vec cannot fail");
}

fn next_str(it: &mut impl Iterator<Item = rmpv::Value>, field: &str) -> Result<String, CodecError> {
    match it.next() {
        Some(rmpv::Value::String(s)) => s
            .into_str()
            .ok_or_else(|| CodecError::Malformed(format!("{field} is not valid UTF-8"))),
        Some(other) => Err(CodecError::Malformed(format!("{field} must be a string, got {other:?}"))),
        None => Err(CodecError::Malformed(format!("missing field {field}"))),
    }
}

fn next_uint(it: &mut impl Iterator<Item = rmpv::Value>, field: &str) -> Result<u64, CodecError> {
    match it.next() {
        Some(rmpv::Value::Integer(i)) => i
            .as_u64()
            .ok_or_else(|| CodecError::Malformed(format!("{field} must be a non-negative integer"))),
        Some(other) => Err(CodecError::Malformed(format!("{field} must be an integer, got {other:?}"))),
        None => Err(CodecError::Malformed(format!("missing field {field}"))),
    }
}

fn next_value(it: &mut impl Iterator<Item = rmpv::Value>, field: &str) -> Result<Value, CodecError> {
    match it.next() {
        Some(v) => Value::from_rmpv(v).map_err(CodecError::Malformed),
        None => Err(CodecError::Malformed(format!("missing field {field}"))),
    }
}

fn ensure_exhausted(mut it: impl Iterator<Item = rmpv::Value>) -> Result<(), CodecError> {
    if it.next().is_some() {
        Err(CodecError::Malformed("frame array has extra elements".into()))
    } else {
        Ok(())
    }
}

/// Incremental decoder over an append-only byte window.
///
/// Bytes arriving from the stream are appended via [`Decoder::feed`]; each
/// call to [`Decoder::try_decode`] consumes exactly one complete frame if
/// one is buffered, or returns `None` without consuming anything.
pub struct Decoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl Decoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Decoder {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one complete message from the front of the
    /// buffer. Returns `Ok(None)` if an insufficient number of bytes have
    /// been fed so far; the caller should `feed` more and retry.
    pub fn try_decode(&mut self) -> Result<Option<Message>, CodecError> {
        let len = match value_len(&self.buf, self.max_frame_bytes)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let frame = self.buf.drain(..len).collect::<Vec<u8>>();
        let mut cursor = &frame[..];
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| CodecError::Malformed(format!("invalid msgpack: {e}")))?;
        Message::from_rmpv(value).map(Some)
    }
}

/// Computes the byte length of the next complete top-level MessagePack
/// value in `buf`, without allocating or fully parsing it. Returns `None`
/// if `buf` does not yet contain a complete value.
fn value_len(buf: &[u8], max_frame_bytes: usize) -> Result<Option<usize>, CodecError> {
    match scan(buf, 0, max_frame_bytes)? {
        Some(end) => Ok(Some(end)),
        None => Ok(None),
    }
}

/// Reads a big-endian length field of `width` bytes (1, 2, or 4) starting
/// at `pos`, returning the decoded length and the position just past it,
/// or `None` if not enough bytes are buffered yet.
fn read_len(buf: &[u8], pos: usize, width: usize) -> Option<(usize, usize)> {
    let end = pos.checked_add(width)?;
    if buf.len() < end {
        return None;
    }
    let n = match width {
        1 => buf[pos] as usize,
        2 => u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize,
        4 => u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize,
        _ => unreachable!("read_len only supports width 1, 2, or 4"),
    };
    Some((n, end))
}

/// Advances `pos` by `n` bytes, bound-checking the resulting offset against
/// `max_frame_bytes` immediately rather than leaving that to the next
/// `scan` call's entry check -- a field's own declared length can push past
/// the cap with nothing scanned after it (e.g. it is the frame's last
/// field), so this check cannot be deferred. Returns `None` (not an error)
/// if the bytes simply haven't arrived yet.
fn skip(buf: &[u8], pos: usize, n: usize, max_frame_bytes: usize) -> Result<Option<usize>, CodecError> {
    let end = pos
        .checked_add(n)
        .ok_or_else(|| CodecError::Malformed("field length overflows usize".into()))?;
    if end > max_frame_bytes {
        return Err(CodecError::TooLarge { max: max_frame_bytes });
    }
    if buf.len() < end {
        Ok(None)
    } else {
        Ok(Some(end))
    }
}

/// Scans one MessagePack value starting at `pos`, returning the offset
/// just past it, or `None` if `buf` is not yet long enough.
fn scan(buf: &[u8], pos: usize, max_frame_bytes: usize) -> Result<Option<usize>, CodecError> {
    if pos >= max_frame_bytes {
        return Err(CodecError::TooLarge { max: max_frame_bytes });
    }
    let Some(&marker) = buf.get(pos) else {
        return Ok(None);
    };
    let p = pos + 1;

    let fixed_len: Option<usize> = match marker {
        0x00..=0x7f | 0xe0..=0xff => Some(0),
        0xc0 | 0xc2 | 0xc3 => Some(0),
        0xcc | 0xd0 => Some(1),
        0xcd | 0xd1 => Some(2),
        0xce | 0xd2 | 0xca => Some(4),
        0xcf | 0xd3 | 0xcb => Some(8),
        _ => None,
    };
    if let Some(n) = fixed_len {
        return skip(buf, p, n, max_frame_bytes);
    }

    match marker {
        0xc1 => Err(CodecError::Malformed("reserved marker 0xc1 used".into())),
        0x80..=0x8f => scan_collection(buf, p, (marker & 0x0f) as usize * 2, max_frame_bytes),
        0x90..=0x9f => scan_collection(buf, p, (marker & 0x0f) as usize, max_frame_bytes),
        0xa0..=0xbf => skip(buf, p, (marker & 0x1f) as usize, max_frame_bytes),
        0xc4 => match read_len(buf, p, 1) {
            Some((n, p)) => skip(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xc5 => match read_len(buf, p, 2) {
            Some((n, p)) => skip(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xc6 => match read_len(buf, p, 4) {
            Some((n, p)) => skip(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xc7 => match read_len(buf, p, 1) {
            Some((n, p)) => skip(buf, p, 1 + n, max_frame_bytes),
            None => Ok(None),
        },
        0xc8 => match read_len(buf, p, 2) {
            Some((n, p)) => skip(buf, p, 1 + n, max_frame_bytes),
            None => Ok(None),
        },
        0xc9 => match read_len(buf, p, 4) {
            Some((n, p)) => skip(buf, p, 1 + n, max_frame_bytes),
            None => Ok(None),
        },
        0xd4 => skip(buf, p, 1 + 1, max_frame_bytes),
        0xd5 => skip(buf, p, 1 + 2, max_frame_bytes),
        0xd6 => skip(buf, p, 1 + 4, max_frame_bytes),
        0xd7 => skip(buf, p, 1 + 8, max_frame_bytes),
        0xd8 => skip(buf, p, 1 + 16, max_frame_bytes),
        0xd9 => match read_len(buf, p, 1) {
            Some((n, p)) => skip(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xda => match read_len(buf, p, 2) {
            Some((n, p)) => skip(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xdb => match read_len(buf, p, 4) {
            Some((n, p)) => skip(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xdc => match read_len(buf, p, 2) {
            Some((n, p)) => scan_collection(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xdd => match read_len(buf, p, 4) {
            Some((n, p)) => scan_collection(buf, p, n, max_frame_bytes),
            None => Ok(None),
        },
        0xde => match read_len(buf, p, 2) {
            Some((n, p)) => scan_collection(buf, p, n * 2, max_frame_bytes),
            None => Ok(None),
        },
        0xdf => match read_len(buf, p, 4) {
            Some((n, p)) => scan_collection(buf, p, n * 2, max_frame_bytes),
            None => Ok(None),
        },
        _ => Err(CodecError::Malformed(format!("unknown marker byte 0x{marker:02x}"))),
    }
}

/// Scans `count` consecutive values starting at `pos`, returning the offset
/// just past the last one. Bound-checks the final offset too: a collection
/// made up entirely of small elements can still end past `max_frame_bytes`
/// with none of its individual elements having tripped the check on their
/// own.
fn scan_collection(
    buf: &[u8],
    mut pos: usize,
    count: usize,
    max_frame_bytes: usize,
) -> Result<Option<usize>, CodecError> {
    for _ in 0..count {
        match scan(buf, pos, max_frame_bytes)? {
            Some(end) => pos = end,
            None => return Ok(None),
        }
    }
    if pos > max_frame_bytes {
        return Err(CodecError::TooLarge { max: max_frame_bytes });
    }
    Ok(Some(pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_each_message_kind() {
        let messages = vec![
            Message::Request {
                method: "obj.method1".into(),
                args: Value::List(vec![Value::Int(1), Value::Int(2)]),
                id: 1,
            },
            Message::Response {
                id: 1,
                result: Value::Int(3),
            },
            Message::Error {
                id: 5,
                message: "RPC object not found".into(),
            },
            Message::Event {
                name: "obj.signal2".into(),
                args: Value::List(vec![Value::Int(42), Value::Str("Hello World".into())]),
            },
        ];
        for m in messages {
            let mut decoder = Decoder::new(1 << 20);
            decoder.feed(&m.encode());
            let decoded = decoder.try_decode().unwrap().unwrap();
            assert_eq!(decoded, m);
        }
    }

    #[test]
    fn decodes_when_fed_one_byte_at_a_time() {
        let m = Message::Request {
            method: "obj.method1".into(),
            args: Value::List(vec![Value::Int(1), Value::Int(2)]),
            id: 1,
        };
        let encoded = m.encode();
        let mut decoder = Decoder::new(1 << 20);
        for (i, byte) in encoded.iter().enumerate() {
            decoder.feed(std::slice::from_ref(byte));
            let result = decoder.try_decode().unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none(), "decoded too early at byte {i}");
            } else {
                assert_eq!(result.unwrap(), m);
            }
        }
    }

    #[test]
    fn yields_multiple_messages_fed_together() {
        let a = Message::Event {
            name: "a".into(),
            args: Value::Null,
        };
        let b = Message::Event {
            name: "b".into(),
            args: Value::Null,
        };
        let mut decoder = Decoder::new(1 << 20);
        decoder.feed(&a.encode());
        decoder.feed(&b.encode());
        assert_eq!(decoder.try_decode().unwrap().unwrap(), a);
        assert_eq!(decoder.try_decode().unwrap().unwrap(), b);
        assert!(decoder.try_decode().unwrap().is_none());
    }

    #[test]
    fn rejects_frame_exceeding_max_size() {
        let m = Message::Event {
            name: "x".repeat(100),
            args: Value::Null,
        };
        let mut decoder = Decoder::new(8);
        decoder.feed(&m.encode());
        assert!(matches!(decoder.try_decode(), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn rejects_oversized_last_field_of_frame() {
        // `message` is the Error frame's last array element -- there is no
        // subsequent field whose scan would trip the size cap, so the cap
        // must be enforced while scanning `message` itself.
        let m = Message::Error {
            id: 1,
            message: "x".repeat(1000),
        };
        let mut decoder = Decoder::new(16);
        decoder.feed(&m.encode());
        assert!(matches!(decoder.try_decode(), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn rejects_non_string_map_key() {
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, 3).unwrap();
        rmp::encode::write_uint(&mut buf, 4).unwrap();
        rmp::encode::write_str(&mut buf, "name").unwrap();
        rmp::encode::write_map_len(&mut buf, 1).unwrap();
        rmp::encode::write_uint(&mut buf, 1).unwrap();
        rmp::encode::write_nil(&mut buf).unwrap();

        let mut decoder = Decoder::new(1 << 20);
        decoder.feed(&buf);
        assert!(decoder.try_decode().is_err());
    }
}
