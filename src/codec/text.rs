//! Textual WebSocket dialect.
//!
//! Inbound frames are a 4-digit decimal length tag followed by the body
//! `fcType sessionId nTo nArg1 nArg2[ payload]\n\0`. The decoder keeps an
//! incremental buffer because message boundaries do not always align with
//! frame boundaries, and a noise filter drops stray bytes the server
//! occasionally injects between frames. Payloads are URL-encoded on the
//! wire and decoded before JSON parsing.

use bytes::{Buf, BytesMut};
use percent_encoding::percent_decode_str;

use crate::constants::FcType;
use crate::error::ClientError;
use crate::packet::{Packet, Payload};

use super::TxFrame;

/// Incremental decoder for the text dialect.
#[derive(Debug, Default)]
pub struct TextDecoder {
    buf: BytesMut,
}

impl TextDecoder {
    pub fn new() -> TextDecoder {
        TextDecoder::default()
    }

    /// Append one delivered WebSocket message to the buffer.
    pub fn push(&mut self, chunk: &str) {
        self.buf.extend_from_slice(chunk.as_bytes());
    }

    /// Decode the next complete frame, if the buffer holds one.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ClientError> {
        self.discard_noise();

        if self.buf.len() < 4 {
            return Ok(None);
        }
        let tag = std::str::from_utf8(&self.buf[..4])
            .ok()
            .and_then(|t| t.parse::<usize>().ok())
            .ok_or_else(|| ClientError::framing("unparseable length tag"))?;

        if self.buf.len() < 4 + tag {
            return Ok(None);
        }

        self.buf.advance(4);
        let body = self.buf.split_to(tag);
        let body = String::from_utf8_lossy(&body);
        parse_body(body.trim_end_matches(['\0', '\n'])).map(Some)
    }

    // Drop leading bytes until the buffer could be the start of a frame
    // (length tag followed by five space-separated integers) or fewer
    // than five bytes remain.
    fn discard_noise(&mut self) {
        let mut skip = 0;
        while self.buf.len() - skip >= 5 && !frame_start(&self.buf[skip..]) {
            skip += 1;
        }
        if skip > 0 {
            self.buf.advance(skip);
        }
    }
}

// Prefix check for `\d{4}\d+ \d+ \d+ \d+ \d+`. An incomplete buffer that
// is still consistent with the shape counts as a match so that frames
// split across messages are not discarded.
fn frame_start(b: &[u8]) -> bool {
    if !b[..4].iter().all(u8::is_ascii_digit) {
        return false;
    }
    let mut i = 4;
    for field in 0..5 {
        let start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            // No digit where one is required: only acceptable if the
            // buffer ended exactly here.
            return i == b.len();
        }
        if field < 4 {
            if i == b.len() {
                return true;
            }
            if b[i] != b' ' {
                return false;
            }
            i += 1;
        }
    }
    true
}

fn parse_body(body: &str) -> Result<Packet, ClientError> {
    let mut parts = body.splitn(6, ' ');
    let mut int = |name: &str| -> Result<i32, ClientError> {
        parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .ok_or_else(|| ClientError::framing(format!("bad {name} field in text frame")))
    };

    let fc_raw = int("type")?;
    let n_from = int("from")?;
    let n_to = int("to")?;
    let n_arg1 = int("arg1")?;
    let n_arg2 = int("arg2")?;

    let (payload_len, payload) = match parts.next() {
        None | Some("") => (0, Payload::None),
        Some(raw) => {
            let decoded = percent_decode_str(raw).decode_utf8_lossy();
            (raw.len(), Payload::parse(&decoded))
        }
    };

    Ok(Packet::new(
        FcType::from_raw(fc_raw),
        n_from,
        n_to,
        n_arg1,
        n_arg2,
        payload_len,
        payload,
    ))
}

/// Encode an outbound command for the text dialect. The server applies
/// its own framing, so no length tag is prepended.
pub fn encode_text(frame: &TxFrame) -> String {
    let mut out = format!(
        "{} {} {} {} {}",
        frame.fc_type.to_raw(),
        frame.n_from,
        frame.n_to,
        frame.n_arg1,
        frame.n_arg2
    );
    if let Some(payload) = &frame.payload {
        out.push(' ');
        out.push_str(payload);
    }
    out.push('\n');
    out.push('\0');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Frame a body the way the server does: 4-digit tag over the body
    // including its trailing terminator.
    fn server_frame(body_without_term: &str) -> String {
        let body = format!("{body_without_term}\n\0");
        format!("{:04}{}", body.len(), body)
    }

    #[test]
    fn noise_prefix_is_discarded() {
        let mut decoder = TextDecoder::new();
        decoder.push("garbage0123 5 6 7 8 9 ");
        decoder.push(&server_frame("11 1 0 0 0 {}"));

        let packet = decoder.next_packet().expect("ok").expect("one frame");
        assert_eq!(packet.fc_type, FcType::SessionState);
        assert_eq!(packet.payload, Payload::Json(json!({})));
        assert!(decoder.next_packet().expect("ok").is_none());
    }

    #[test]
    fn frames_split_across_messages_are_reassembled() {
        let raw = server_frame("13 10 100003113 0 0 %7B%22msg%22%3A%22hi%22%7D");
        let (a, b) = raw.split_at(9);

        let mut decoder = TextDecoder::new();
        decoder.push(a);
        assert!(decoder.next_packet().expect("ok").is_none());
        decoder.push(b);

        let packet = decoder.next_packet().expect("ok").expect("frame");
        assert_eq!(packet.fc_type, FcType::CMesg);
        assert_eq!(packet.n_to, 100003113);
        assert_eq!(packet.payload, Payload::Json(json!({"msg": "hi"})));
    }

    #[test]
    fn payloads_are_url_decoded_before_json_parsing() {
        let mut decoder = TextDecoder::new();
        decoder.push(&server_frame("5 0 0 0 0 %7B%22uid%22%3A42%2C%22vs%22%3A90%7D"));

        let packet = decoder.next_packet().expect("ok").expect("frame");
        let state = packet.payload_state().expect("object");
        assert_eq!(state.uid(), Some(42));
        assert_eq!(state.effective("vs"), Some(&json!(90)));
    }

    #[test]
    fn encode_has_no_length_prefix_and_terminates() {
        let frame = TxFrame::new(FcType::CMesg, 100003113, 0, 0).with_payload("hello");
        let mut tx = TxFrame::new(FcType::Null, 0, 0, 0);
        tx.n_from = 7;

        assert_eq!(encode_text(&frame), "13 0 100003113 0 0 hello\n\0");
        assert_eq!(encode_text(&tx), "0 7 0 0 0\n\0");
    }

    #[test]
    fn encoded_frames_decode_back() {
        let frame = TxFrame::new(FcType::UsernameLookup, 0, 21, 0).with_payload("alice");
        let encoded = encode_text(&frame);

        let mut decoder = TextDecoder::new();
        decoder.push(&format!("{:04}{}", encoded.len(), encoded));

        let packet = decoder.next_packet().expect("ok").expect("frame");
        assert_eq!(packet.fc_type, FcType::UsernameLookup);
        assert_eq!(packet.n_arg1, 21);
        assert_eq!(packet.payload, Payload::Raw("alice".to_string()));
    }

    #[test]
    fn all_noise_drains_to_quiet_buffer() {
        let mut decoder = TextDecoder::new();
        decoder.push("complete nonsense with no frame at all");
        assert!(decoder.next_packet().expect("ok").is_none());
        // Everything but an undecidable tail has been discarded.
        assert!(decoder.buf.len() <= 4);
    }
}
