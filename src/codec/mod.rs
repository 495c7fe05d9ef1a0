//! Wire codecs for the two protocol dialects.
//!
//! Both dialects carry the same logical packet shape; [`binary`] is the
//! length-prefixed socket framing and [`text`] is the tagged textual
//! framing used over WebSockets.

pub mod binary;
pub mod text;

pub use binary::BinaryCodec;
pub use text::{encode_text, TextDecoder};

use crate::constants::FcType;

/// An outbound command before dialect encoding.
///
/// `n_from` carries the session id on the wire; the connection manager
/// fills it in from the login handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct TxFrame {
    pub fc_type: FcType,
    pub n_from: i32,
    pub n_to: i32,
    pub n_arg1: i32,
    pub n_arg2: i32,
    pub payload: Option<String>,
}

impl TxFrame {
    pub fn new(fc_type: FcType, n_to: i32, n_arg1: i32, n_arg2: i32) -> TxFrame {
        TxFrame { fc_type, n_from: 0, n_to, n_arg1, n_arg2, payload: None }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> TxFrame {
        self.payload = Some(payload.into());
        self
    }
}
