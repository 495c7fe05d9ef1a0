//! Binary socket dialect.
//!
//! Each frame is seven big-endian `i32`s (magic, type, from, to, arg1,
//! arg2, payload length) followed by that many UTF-8 payload bytes. The
//! decoder consumes as many complete frames as the buffer holds and
//! leaves partial frames untouched.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::TxFrame;
use crate::constants::{FcType, MAGIC};
use crate::error::ClientError;
use crate::packet::{Packet, Payload};

/// Seven big-endian `i32` header slots.
pub const HEADER_LEN: usize = 28;

/// Upper bound on a single payload. Anything larger is treated as a
/// framing error rather than an allocation request.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Codec for the binary dialect, usable with `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct BinaryCodec;

impl Decoder for BinaryCodec {
    type Item = Packet;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ClientError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let magic = header.get_i32();
        if magic != MAGIC {
            return Err(ClientError::framing(format!(
                "bad magic {magic:#010x}, expected {MAGIC:#010x}"
            )));
        }

        let fc_raw = header.get_i32();
        let n_from = header.get_i32();
        let n_to = header.get_i32();
        let n_arg1 = header.get_i32();
        let n_arg2 = header.get_i32();
        let payload_len = header.get_i32();

        if payload_len < 0 {
            return Err(ClientError::framing(format!("negative payload length {payload_len}")));
        }
        let payload_len = payload_len as usize;
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(ClientError::framing(format!(
                "payload length {payload_len} exceeds {MAX_PAYLOAD_BYTES}"
            )));
        }

        if src.len() < HEADER_LEN + payload_len {
            // Partial frame; ask for the remainder without consuming.
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(payload_len);
        let payload = if payload_len == 0 {
            Payload::None
        } else {
            Payload::parse(&String::from_utf8_lossy(&body))
        };

        Ok(Some(Packet::new(
            FcType::from_raw(fc_raw),
            n_from,
            n_to,
            n_arg1,
            n_arg2,
            payload_len,
            payload,
        )))
    }
}

impl Encoder<TxFrame> for BinaryCodec {
    type Error = ClientError;

    fn encode(&mut self, frame: TxFrame, dst: &mut BytesMut) -> Result<(), ClientError> {
        let payload = frame.payload.as_deref().unwrap_or_default();
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_i32(MAGIC);
        dst.put_i32(frame.fc_type.to_raw());
        dst.put_i32(frame.n_from);
        dst.put_i32(frame.n_to);
        dst.put_i32(frame.n_arg1);
        dst.put_i32(frame.n_arg2);
        dst.put_i32(payload.len() as i32);
        dst.put_slice(payload.as_bytes());
        Ok(())
    }
}
