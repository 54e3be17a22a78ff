//! Digest-checked framing for bench connections.
//!
//! Every frame is `<length>,<digest>,<payload>`: a 16-digit zero-padded
//! decimal byte count, a 64-char lowercase SHA-256 hex digest of the payload,
//! then exactly `length` payload bytes. The payload is a serde_json document.
//! Works over any AsyncRead/AsyncWrite (TCP, Unix sockets, duplex pipes).

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use super::ProtocolError;

pub const LENGTH_WIDTH: usize = 16;
pub const DIGEST_WIDTH: usize = 64;
/// `<length>` + `,` + `<digest>` + `,`
pub const HEADER_LEN: usize = LENGTH_WIDTH + 1 + DIGEST_WIDTH + 1;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const DELIMITER: u8 = b',';

/// Lowercase hex SHA-256 of a payload.
pub fn payload_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Raw frame codec: header validation and digest verification, no serialization.
#[derive(Debug, Clone)]
pub struct DigestFrameCodec {
    max_frame_len: usize,
}

impl Default for DigestFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestFrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    fn parse_header(&self, header: &[u8]) -> Result<(usize, [u8; DIGEST_WIDTH]), ProtocolError> {
        if header[LENGTH_WIDTH] != DELIMITER || header[HEADER_LEN - 1] != DELIMITER {
            return Err(ProtocolError::MalformedHeader(
                "missing field delimiter".to_string(),
            ));
        }

        let length_field = &header[..LENGTH_WIDTH];
        if !length_field.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::MalformedHeader(format!(
                "length field is not decimal: {:?}",
                String::from_utf8_lossy(length_field)
            )));
        }
        // 16 ascii digits always parse; overflow only past usize on 32-bit targets
        let length: usize = std::str::from_utf8(length_field)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::MalformedHeader("length out of range".to_string()))?;
        if length > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: self.max_frame_len,
            });
        }

        let mut digest = [0u8; DIGEST_WIDTH];
        digest.copy_from_slice(&header[LENGTH_WIDTH + 1..HEADER_LEN - 1]);
        Ok((length, digest))
    }
}

impl Decoder for DigestFrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let (length, expected) = self.parse_header(&src[..HEADER_LEN])?;
        let frame_len = HEADER_LEN + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        let actual = payload_digest(&payload);
        if actual.as_bytes() != expected {
            return Err(ProtocolError::DigestMismatch {
                expected: String::from_utf8_lossy(&expected).into_owned(),
                actual,
            });
        }

        tracing::trace!(target: "hilrig::wire", payload_bytes = length, "Decoded frame");
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for DigestFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                length: payload.len(),
                max: self.max_frame_len,
            });
        }

        let header = format!(
            "{:0width$},{},",
            payload.len(),
            payload_digest(&payload),
            width = LENGTH_WIDTH
        );
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Codec that frames messages with [`DigestFrameCodec`] and serializes with JSON.
pub struct FrameCodec<T> {
    inner: DigestFrameCodec,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: DigestFrameCodec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.inner = self.inner.with_max_frame_len(max_frame_len);
        self
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        let json_len = json.len();
        tracing::trace!(target: "hilrig::wire", json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                target: "hilrig::wire",
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
