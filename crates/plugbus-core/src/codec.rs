//! msgpack-rpc framing.
//!
//! Frames are msgpack arrays: `[0, msgid, method, params]` for requests,
//! `[1, msgid, error, result]` for responses and `[2, method, params]` for
//! notifications. Declared container lengths come from untrusted peers:
//! [`FrameScanner`] finds the end of a frame without allocating, and values
//! are only built once the whole frame is in hand.

use rmp::encode;
use rmp::Marker;

use crate::message::{Message, MessageType};
use crate::value::Value;

/// Maximum nesting of arrays and maps inside one frame.
pub const MAX_DEPTH: usize = 64;

/// Upper bound on elements reserved up front for a decoded container.
const PREALLOC_LIMIT: usize = 256;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("frame is incomplete")]
    Incomplete,
    #[error("frame is not an array")]
    NotAnArray,
    #[error("unknown message type {0}")]
    UnknownType(u64),
    #[error("expected {expected} elements in frame, got {actual}")]
    InvalidArity { expected: usize, actual: usize },
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("response carries both an error and a result")]
    AmbiguousResponse,
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("extension types are not supported")]
    UnsupportedExt,
    #[error("reserved marker 0x{0:02x}")]
    ReservedMarker(u8),
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("encode failed: {0}")]
    Encode(String),
}

fn enc<E: std::fmt::Display>(e: E) -> CodecError {
    CodecError::Encode(e.to_string())
}

fn field_error(field: &'static str, reason: &str) -> CodecError {
    CodecError::InvalidField {
        field,
        reason: reason.to_owned(),
    }
}

// ── Encoding ────────────────────────────────────────────────────────

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(64);
    let ty = message.message_type();
    write_len(&mut buf, ty.arity(), encode::write_array_len)?;
    encode::write_uint(&mut buf, ty as u64).map_err(enc)?;

    match message {
        Message::Request {
            call_id,
            method,
            params,
        } => {
            encode::write_uint(&mut buf, *call_id).map_err(enc)?;
            encode::write_str(&mut buf, method).map_err(enc)?;
            write_array(&mut buf, params, 0)?;
        }
        Message::Response {
            call_id,
            error,
            result,
        } => {
            encode::write_uint(&mut buf, *call_id).map_err(enc)?;
            write_value(&mut buf, error.as_ref().unwrap_or(&Value::Nil), 0)?;
            write_value(&mut buf, result.as_ref().unwrap_or(&Value::Nil), 0)?;
        }
        Message::Notification { method, params } => {
            encode::write_str(&mut buf, method).map_err(enc)?;
            write_array(&mut buf, params, 0)?;
        }
    }
    Ok(buf)
}

fn write_len<F, E>(buf: &mut Vec<u8>, len: usize, write: F) -> Result<(), CodecError>
where
    F: FnOnce(&mut Vec<u8>, u32) -> Result<Marker, E>,
    E: std::fmt::Display,
{
    let len = u32::try_from(len).map_err(|_| CodecError::Encode(format!("length {len} exceeds u32")))?;
    write(buf, len).map_err(enc)?;
    Ok(())
}

fn write_array(buf: &mut Vec<u8>, items: &[Value], depth: usize) -> Result<(), CodecError> {
    write_len(buf, items.len(), encode::write_array_len)?;
    for item in items {
        write_value(buf, item, depth + 1)?;
    }
    Ok(())
}

fn write_value(buf: &mut Vec<u8>, value: &Value, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    match value {
        Value::Nil => encode::write_nil(buf).map_err(enc),
        Value::Boolean(b) => encode::write_bool(buf, *b).map_err(enc),
        Value::Integer(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => encode::write_uint(buf, u).map(|_| ()).map_err(enc),
            (None, Some(i)) => encode::write_sint(buf, i).map(|_| ()).map_err(enc),
            (None, None) => Err(CodecError::Encode(format!("integer {n} out of range"))),
        },
        Value::F32(x) => encode::write_f32(buf, *x).map_err(enc),
        Value::F64(x) => encode::write_f64(buf, *x).map_err(enc),
        Value::String(s) => encode::write_str(buf, s).map_err(enc),
        Value::Binary(b) => encode::write_bin(buf, b).map_err(enc),
        Value::Array(items) => write_array(buf, items, depth),
        Value::Map(entries) => {
            write_len(buf, entries.len(), encode::write_map_len)?;
            for (k, v) in entries {
                write_value(buf, k, depth + 1)?;
                write_value(buf, v, depth + 1)?;
            }
            Ok(())
        }
    }
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode exactly one frame; the buffer must contain nothing else.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    match decode_frame(bytes)? {
        Some((message, used)) if used == bytes.len() => Ok(message),
        Some((_, used)) => Err(CodecError::TrailingBytes(bytes.len() - used)),
        None => Err(CodecError::Incomplete),
    }
}

/// Decode the first frame in a stream buffer.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the message and
/// the number of bytes it occupied.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
    match FrameScanner::new().scan(bytes)? {
        Some(len) => Ok(Some((decode_complete(&bytes[..len])?, len))),
        None => Ok(None),
    }
}

/// Build the message from a slice already known to hold exactly one frame.
fn decode_complete(frame: &[u8]) -> Result<Message, CodecError> {
    let mut reader = Reader::new(frame);
    let value = reader.read_value(0)?;
    message_from_value(value)
}

/// Finds frame boundaries without building values.
///
/// The scanner keeps its position between calls, so a frame arriving in
/// many small reads is walked once in total. The buffer passed to
/// [`FrameScanner::scan`] must keep its already-scanned prefix unchanged
/// until a frame is reported.
#[derive(Debug)]
pub struct FrameScanner {
    pos: usize,
    /// Items still expected by each open container, outermost first.
    pending: Vec<u64>,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            pos: 0,
            pending: vec![1],
        }
    }

    /// Bytes of the current frame walked so far.
    pub fn scanned(&self) -> usize {
        self.pos
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.pending.clear();
        self.pending.push(1);
    }

    /// Continue scanning `buf`. Returns the frame length once the outer
    /// array is complete and resets for the next frame.
    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        if self.pos == 0 {
            let Some(&first) = buf.first() else {
                return Ok(None);
            };
            if !matches!(
                Marker::from_u8(first),
                Marker::FixArray(_) | Marker::Array16 | Marker::Array32
            ) {
                return Err(CodecError::NotAnArray);
            }
        }

        while !self.pending.is_empty() {
            let Some((size, children)) = item_at(&buf[self.pos.min(buf.len())..])? else {
                return Ok(None);
            };
            self.pos += size;
            if let Some(open) = self.pending.last_mut() {
                *open -= 1;
            }
            if children > 0 {
                if self.pending.len() > MAX_DEPTH {
                    return Err(CodecError::TooDeep);
                }
                self.pending.push(children);
            }
            while self.pending.last() == Some(&0) {
                self.pending.pop();
            }
        }

        let len = self.pos;
        self.reset();
        Ok(Some(len))
    }
}

fn be_len(buf: &[u8], width: usize) -> Option<u64> {
    let bytes = buf.get(1..1 + width)?;
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Size of the item starting at `buf[0]` (header plus scalar payload) and
/// how many child items follow it. `None` while the item is incomplete.
fn item_at(buf: &[u8]) -> Result<Option<(usize, u64)>, CodecError> {
    let Some(&byte) = buf.first() else {
        return Ok(None);
    };
    // (header bytes, payload bytes, children)
    let (header, payload, children) = match Marker::from_u8(byte) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => (1, 0, 0),
        Marker::U8 | Marker::I8 => (1, 1, 0),
        Marker::U16 | Marker::I16 => (1, 2, 0),
        Marker::U32 | Marker::I32 | Marker::F32 => (1, 4, 0),
        Marker::U64 | Marker::I64 | Marker::F64 => (1, 8, 0),
        Marker::FixStr(n) => (1, u64::from(n), 0),
        Marker::Str8 | Marker::Bin8 => match be_len(buf, 1) {
            Some(n) => (2, n, 0),
            None => return Ok(None),
        },
        Marker::Str16 | Marker::Bin16 => match be_len(buf, 2) {
            Some(n) => (3, n, 0),
            None => return Ok(None),
        },
        Marker::Str32 | Marker::Bin32 => match be_len(buf, 4) {
            Some(n) => (5, n, 0),
            None => return Ok(None),
        },
        Marker::FixArray(n) => (1, 0, u64::from(n)),
        Marker::Array16 => match be_len(buf, 2) {
            Some(n) => (3, 0, n),
            None => return Ok(None),
        },
        Marker::Array32 => match be_len(buf, 4) {
            Some(n) => (5, 0, n),
            None => return Ok(None),
        },
        Marker::FixMap(n) => (1, 0, 2 * u64::from(n)),
        Marker::Map16 => match be_len(buf, 2) {
            Some(n) => (3, 0, 2 * n),
            None => return Ok(None),
        },
        Marker::Map32 => match be_len(buf, 4) {
            Some(n) => (5, 0, 2 * n),
            None => return Ok(None),
        },
        Marker::FixExt1
        | Marker::FixExt2
        | Marker::FixExt4
        | Marker::FixExt8
        | Marker::FixExt16
        | Marker::Ext8
        | Marker::Ext16
        | Marker::Ext32 => return Err(CodecError::UnsupportedExt),
        Marker::Reserved => return Err(CodecError::ReservedMarker(byte)),
    };
    let size = header + payload;
    if (buf.len() as u64) < size {
        return Ok(None);
    }
    Ok(Some((size as usize, children)))
}

fn message_from_value(value: Value) -> Result<Message, CodecError> {
    let Value::Array(items) = value else {
        return Err(CodecError::NotAnArray);
    };
    let raw_type = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| field_error("type", "expected an unsigned integer"))?;
    let ty = MessageType::from_u64(raw_type).ok_or(CodecError::UnknownType(raw_type))?;
    if items.len() != ty.arity() {
        return Err(CodecError::InvalidArity {
            expected: ty.arity(),
            actual: items.len(),
        });
    }

    let mut fields = items.into_iter().skip(1);
    let mut next = || fields.next().unwrap_or(Value::Nil);

    let message = match ty {
        MessageType::Request => Message::Request {
            call_id: call_id_field(next())?,
            method: method_field(next())?,
            params: params_field(next())?,
        },
        MessageType::Response => {
            let call_id = call_id_field(next())?;
            let error = next();
            let result = next();
            match (error.is_nil(), result.is_nil()) {
                (false, false) => return Err(CodecError::AmbiguousResponse),
                (true, _) => Message::Response {
                    call_id,
                    error: None,
                    result: Some(result),
                },
                (false, true) => Message::Response {
                    call_id,
                    error: Some(error),
                    result: None,
                },
            }
        }
        MessageType::Notification => Message::Notification {
            method: method_field(next())?,
            params: params_field(next())?,
        },
    };
    Ok(message)
}

fn call_id_field(value: Value) -> Result<u64, CodecError> {
    value
        .as_u64()
        .ok_or_else(|| field_error("msgid", "expected an unsigned 64-bit integer"))
}

fn method_field(value: Value) -> Result<String, CodecError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(field_error("method", "expected a string")),
    }
}

fn params_field(value: Value) -> Result<Vec<Value>, CodecError> {
    value
        .into_array()
        .ok_or_else(|| field_error("params", "expected an array"))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep);
        }
        let byte = self.read_u8()?;
        let value = match Marker::from_u8(byte) {
            Marker::FixPos(n) => Value::from(u64::from(n)),
            Marker::FixNeg(n) => Value::from(i64::from(n)),
            Marker::Null => Value::Nil,
            Marker::True => Value::Boolean(true),
            Marker::False => Value::Boolean(false),
            Marker::U8 => Value::from(u64::from(self.read_u8()?)),
            Marker::U16 => Value::from(u64::from(self.read_u16()?)),
            Marker::U32 => Value::from(u64::from(self.read_u32()?)),
            Marker::U64 => Value::from(self.read_u64()?),
            Marker::I8 => Value::from(i64::from(i8::from_be_bytes(self.take_array()?))),
            Marker::I16 => Value::from(i64::from(i16::from_be_bytes(self.take_array()?))),
            Marker::I32 => Value::from(i64::from(i32::from_be_bytes(self.take_array()?))),
            Marker::I64 => Value::from(i64::from_be_bytes(self.take_array()?)),
            Marker::F32 => Value::F32(f32::from_bits(self.read_u32()?)),
            Marker::F64 => Value::F64(f64::from_bits(self.read_u64()?)),
            Marker::FixStr(len) => self.read_str(usize::from(len))?,
            Marker::Str8 => {
                let len = usize::from(self.read_u8()?);
                self.read_str(len)?
            }
            Marker::Str16 => {
                let len = usize::from(self.read_u16()?);
                self.read_str(len)?
            }
            Marker::Str32 => {
                let len = self.read_u32()? as usize;
                self.read_str(len)?
            }
            Marker::Bin8 => {
                let len = usize::from(self.read_u8()?);
                Value::Binary(self.take(len)?.to_vec())
            }
            Marker::Bin16 => {
                let len = usize::from(self.read_u16()?);
                Value::Binary(self.take(len)?.to_vec())
            }
            Marker::Bin32 => {
                let len = self.read_u32()? as usize;
                Value::Binary(self.take(len)?.to_vec())
            }
            Marker::FixArray(len) => self.read_array(usize::from(len), depth)?,
            Marker::Array16 => {
                let len = usize::from(self.read_u16()?);
                self.read_array(len, depth)?
            }
            Marker::Array32 => {
                let len = self.read_u32()? as usize;
                self.read_array(len, depth)?
            }
            Marker::FixMap(len) => self.read_map(usize::from(len), depth)?,
            Marker::Map16 => {
                let len = usize::from(self.read_u16()?);
                self.read_map(len, depth)?
            }
            Marker::Map32 => {
                let len = self.read_u32()? as usize;
                self.read_map(len, depth)?
            }
            Marker::FixExt1
            | Marker::FixExt2
            | Marker::FixExt4
            | Marker::FixExt8
            | Marker::FixExt16
            | Marker::Ext8
            | Marker::Ext16
            | Marker::Ext32 => return Err(CodecError::UnsupportedExt),
            Marker::Reserved => return Err(CodecError::ReservedMarker(byte)),
        };
        Ok(value)
    }

    fn read_str(&mut self, len: usize) -> Result<Value, CodecError> {
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(Value::String(s.to_owned()))
    }

    fn read_array(&mut self, len: usize, depth: usize) -> Result<Value, CodecError> {
        let mut items = Vec::with_capacity(len.min(self.remaining()).min(PREALLOC_LIMIT));
        for _ in 0..len {
            items.push(self.read_value(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn read_map(&mut self, len: usize, depth: usize) -> Result<Value, CodecError> {
        let mut entries = Vec::with_capacity(len.min(self.remaining() / 2).min(PREALLOC_LIMIT));
        for _ in 0..len {
            let key = self.read_value(depth + 1)?;
            let value = self.read_value(depth + 1)?;
            entries.push((key, value));
        }
        Ok(Value::Map(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> + Clone {
        let leaf = prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Boolean),
            any::<u64>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<f32>()
                .prop_filter("NaN never compares equal", |x| !x.is_nan())
                .prop_map(Value::F32),
            any::<f64>()
                .prop_filter("NaN never compares equal", |x| !x.is_nan())
                .prop_map(Value::F64),
            any::<String>().prop_map(Value::String),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Binary),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::vec((inner.clone(), inner), 0..8).prop_map(Value::Map),
            ]
        })
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        let params = prop::collection::vec(arb_value(), 0..6);
        prop_oneof![
            (any::<u64>(), "[a-z_]{1,12}", params.clone())
                .prop_map(|(id, method, params)| Message::request(id, method, params)),
            (any::<u64>(), arb_value()).prop_map(|(id, result)| Message::success(id, result)),
            (
                any::<u64>(),
                arb_value().prop_filter("errors are non-nil", |v| !v.is_nil())
            )
                .prop_map(|(id, error)| Message::failure(id, error)),
            ("[a-z_]{1,12}", params)
                .prop_map(|(method, params)| Message::notification(method, params)),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(msg in arb_message()) {
            let bytes = encode(&msg).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn request_wire_layout() {
        let bytes = encode(&Message::request(1, "run", vec![])).unwrap();
        assert_eq!(bytes, [0x94, 0x00, 0x01, 0xa3, b'r', b'u', b'n', 0x90]);
    }

    #[test]
    fn notification_has_three_elements() {
        let bytes = encode(&Message::notification("broadcast", vec![Value::from("e")])).unwrap();
        assert_eq!(bytes[0], 0x93);
        assert_eq!(bytes[1], 0x02);
    }

    #[test]
    fn large_call_id_roundtrips() {
        let msg = Message::request(u64::MAX, "run", vec![]);
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn embedded_nul_and_binary_survive() {
        let msg = Message::notification(
            "broadcast",
            vec![Value::from("a\0b"), Value::Binary(vec![0, 255, 0, 1])],
        );
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn nil_result_decodes_as_success() {
        let bytes = [0x94, 0x01, 0x05, 0xc0, 0xc0];
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg, Message::success(5, Value::Nil));
    }

    #[test]
    fn rejects_unknown_type() {
        let bytes = [0x93, 0x03, 0xa1, b'x', 0x90];
        assert_eq!(decode(&bytes), Err(CodecError::UnknownType(3)));
    }

    #[test]
    fn rejects_wrong_arity() {
        // request with only three elements
        let bytes = [0x93, 0x00, 0x01, 0xa3, b'r', b'u', b'n'];
        assert_eq!(
            decode(&bytes),
            Err(CodecError::InvalidArity {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn rejects_non_array_frame() {
        assert_eq!(decode(&[0xc0]), Err(CodecError::NotAnArray));
        assert_eq!(decode_frame(&[0xa1, b'x']), Err(CodecError::NotAnArray));
    }

    #[test]
    fn rejects_negative_msgid() {
        let bytes = [0x94, 0x00, 0xff, 0xa3, b'r', b'u', b'n', 0x90];
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::InvalidField { field: "msgid", .. })
        ));
    }

    #[test]
    fn rejects_params_that_are_not_an_array() {
        let bytes = [0x94, 0x00, 0x01, 0xa3, b'r', b'u', b'n', 0xc0];
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::InvalidField { field: "params", .. })
        ));
    }

    #[test]
    fn rejects_response_with_error_and_result() {
        let bytes = [0x94, 0x01, 0x01, 0xa1, b'e', 0x01];
        assert_eq!(decode(&bytes), Err(CodecError::AmbiguousResponse));
    }

    #[test]
    fn oversized_length_claim_is_incomplete_not_allocated() {
        // array32 claiming u32::MAX elements with nothing behind it
        let bytes = [0xdd, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(decode(&bytes), Err(CodecError::Incomplete));
        assert_eq!(decode_frame(&bytes), Ok(None));
    }

    #[test]
    fn declared_length_longer_than_content_is_rejected() {
        // params declares 3 elements but only one follows
        let bytes = [0x94, 0x00, 0x01, 0xa3, b'r', b'u', b'n', 0x93, 0x01];
        assert_eq!(decode(&bytes), Err(CodecError::Incomplete));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&Message::success(1, Value::Nil)).unwrap();
        bytes.push(0xc0);
        assert_eq!(decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let bytes = [0x93, 0x02, 0xa2, 0xff, 0xfe, 0x90];
        assert_eq!(decode(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn rejects_extension_types() {
        let bytes = [0x93, 0x02, 0xa1, b'x', 0x91, 0xd4, 0x01, 0x00];
        assert_eq!(decode(&bytes), Err(CodecError::UnsupportedExt));
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut bytes = vec![0x93, 0x02, 0xa1, b'x'];
        bytes.extend(std::iter::repeat(0x91).take(100));
        bytes.push(0xc0);
        assert_eq!(decode(&bytes), Err(CodecError::TooDeep));
    }

    #[test]
    fn decode_frame_waits_for_more_bytes() {
        let bytes = encode(&Message::request(42, "subscribe", vec![Value::from(1u64)])).unwrap();
        for cut in 1..bytes.len() {
            assert_eq!(decode_frame(&bytes[..cut]), Ok(None), "cut at {cut}");
        }
        let (msg, used) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(msg.call_id(), Some(42));
    }

    #[test]
    fn decode_frame_splits_back_to_back_frames() {
        let first = encode(&Message::notification("a", vec![])).unwrap();
        let second = encode(&Message::notification("b", vec![])).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let (msg, used) = decode_frame(&stream).unwrap().unwrap();
        assert_eq!(msg.method(), Some("a"));
        assert_eq!(used, first.len());
        let (msg, _) = decode_frame(&stream[used..]).unwrap().unwrap();
        assert_eq!(msg.method(), Some("b"));
    }

    fn counting_frame(n: usize) -> Vec<u8> {
        let items = (0..n).map(|i| Value::from((i % 100) as u64)).collect();
        encode(&Message::notification("x", vec![Value::Array(items)])).unwrap()
    }

    #[test]
    fn scanner_resumes_where_it_stopped() {
        let bytes = counting_frame(70_000);
        // 0x93 0x02 0xa1 'x' 0x91 then a 5-byte array32 header
        let header = 10;
        let mut scanner = FrameScanner::new();
        for cut in (header..bytes.len()).step_by(997) {
            assert_eq!(scanner.scan(&bytes[..cut]), Ok(None));
            assert_eq!(scanner.scanned(), cut);
        }
        assert_eq!(scanner.scan(&bytes), Ok(Some(bytes.len())));
        assert_eq!(scanner.scanned(), 0);
    }

    #[test]
    fn scanner_waits_inside_item_headers() {
        let bytes = encode(&Message::notification("x", vec![Value::Binary(vec![7; 300])])).unwrap();
        let mut scanner = FrameScanner::new();
        // stops before the bin16 item until its payload is complete
        assert_eq!(scanner.scan(&bytes[..bytes.len() - 1]), Ok(None));
        assert_eq!(scanner.scanned(), 5);
        assert_eq!(scanner.scan(&bytes), Ok(Some(bytes.len())));
    }

    #[test]
    fn scanner_stops_at_frame_end() {
        let first = encode(&Message::notification("a", vec![Value::from(1u64)])).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&encode(&Message::notification("b", vec![])).unwrap());
        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.scan(&stream), Ok(Some(first.len())));
    }

    #[test]
    fn scanner_rejects_bad_markers_early() {
        assert_eq!(FrameScanner::new().scan(&[0xc0]), Err(CodecError::NotAnArray));
        assert_eq!(
            FrameScanner::new().scan(&[0x93, 0x02, 0xc1]),
            Err(CodecError::ReservedMarker(0xc1))
        );
    }

    #[test]
    fn nested_length_claims_stay_incomplete() {
        let mut bytes = vec![0x93, 0x02, 0xa1, b'x'];
        for _ in 0..60 {
            bytes.extend_from_slice(&[0xdd, 0xff, 0xff, 0xff, 0xff]);
        }
        bytes.extend(std::iter::repeat(0xc0).take(4096));
        assert_eq!(decode_frame(&bytes), Ok(None));
    }

    #[test]
    fn negative_integers_keep_sign() {
        let msg = Message::notification("n", vec![Value::from(-1i64), Value::from(i64::MIN)]);
        let back = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(back.params().unwrap()[1].as_i64(), Some(i64::MIN));
        assert_eq!(back, msg);
    }
}
