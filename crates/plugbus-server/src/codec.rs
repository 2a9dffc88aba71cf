//! Stream framing for msgpack-rpc over TCP.
//!
//! msgpack frames are self-delimiting, so there is no length prefix: a frame
//! ends where its outer array ends. The codec keeps a [`FrameScanner`]
//! across reads, so a large frame arriving in pieces is walked once and
//! decoded once.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use plugbus_core::{codec, CodecError, FrameScanner, Message};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("frame exceeds {max} bytes")]
    TooLarge { max: usize },
}

#[derive(Debug)]
pub struct RpcCodec {
    max_frame_size: usize,
    scanner: FrameScanner,
}

impl RpcCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            scanner: FrameScanner::new(),
        }
    }

    /// Bytes of the pending frame already walked.
    pub fn scanned(&self) -> usize {
        self.scanner.scanned()
    }
}

impl Decoder for RpcCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        let too_large = FrameError::TooLarge {
            max: self.max_frame_size,
        };
        match self.scanner.scan(&src[..])? {
            Some(len) if len > self.max_frame_size => Err(too_large),
            Some(len) => {
                let message = codec::decode(&src[..len])?;
                src.advance(len);
                Ok(Some(message))
            }
            None if src.len() > self.max_frame_size => Err(too_large),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for RpcCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let bytes = codec::encode(&item)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugbus_core::Value;

    #[test]
    fn decodes_across_partial_reads() {
        let mut rpc = RpcCodec::new(1024);
        let msg = Message::request(3, "subscribe", vec![Value::Nil, Value::from("tick")]);
        let bytes = codec::encode(&msg).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..4]);
        assert!(rpc.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[4..]);
        assert_eq!(rpc.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn keeps_following_frame_in_buffer() {
        let mut rpc = RpcCodec::new(1024);
        let mut buf = BytesMut::new();
        rpc.encode(Message::notification("a", vec![]), &mut buf).unwrap();
        rpc.encode(Message::notification("b", vec![]), &mut buf).unwrap();

        assert_eq!(rpc.decode(&mut buf).unwrap().unwrap().method(), Some("a"));
        assert_eq!(rpc.decode(&mut buf).unwrap().unwrap().method(), Some("b"));
        assert!(rpc.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frames_rejected() {
        let mut rpc = RpcCodec::new(16);
        let mut buf = BytesMut::new();
        let big = Message::notification("broadcast", vec![Value::Binary(vec![0; 64])]);
        buf.extend_from_slice(&codec::encode(&big).unwrap());
        assert!(matches!(rpc.decode(&mut buf), Err(FrameError::TooLarge { max: 16 })));

        // incomplete but already past the limit
        let mut buf = BytesMut::from(&[0xdd, 0xff, 0xff, 0xff, 0xff][..]);
        buf.extend_from_slice(&[0xc0; 32]);
        assert!(matches!(rpc.decode(&mut buf), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn large_frame_in_small_reads_is_walked_once() {
        let items: Vec<Value> = (0..200_000u64).map(|i| Value::from(i % 100)).collect();
        let msg = Message::notification("x", vec![Value::Array(items)]);
        let bytes = codec::encode(&msg).unwrap();

        let mut rpc = RpcCodec::new(1 << 20);
        let mut buf = BytesMut::new();
        let mut chunks = bytes.chunks(8 * 1024).peekable();
        let mut decoded = None;
        while let Some(chunk) = chunks.next() {
            buf.extend_from_slice(chunk);
            match rpc.decode(&mut buf).unwrap() {
                Some(message) => {
                    assert!(chunks.peek().is_none());
                    decoded = Some(message);
                }
                // one-byte items: the scanner has consumed everything buffered
                None => assert_eq!(rpc.scanned(), buf.len()),
            }
        }
        assert_eq!(decoded, Some(msg));
        assert!(buf.is_empty());
        assert_eq!(rpc.scanned(), 0);
    }

    #[test]
    fn limit_applies_before_frame_completes() {
        let items: Vec<Value> = (0..4096u64).map(|i| Value::from(i % 100)).collect();
        let bytes = codec::encode(&Message::notification("x", vec![Value::Array(items)])).unwrap();

        let mut rpc = RpcCodec::new(1024);
        let mut buf = BytesMut::from(&bytes[..1000]);
        assert!(rpc.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[1000..1100]);
        assert!(matches!(rpc.decode(&mut buf), Err(FrameError::TooLarge { max: 1024 })));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let mut rpc = RpcCodec::new(1024);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(matches!(rpc.decode(&mut buf), Err(FrameError::Codec(CodecError::NotAnArray))));
    }
}
