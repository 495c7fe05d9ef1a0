//! Outbound emote encoding.
//!
//! Chat and PM text passes through an [`EmoteEncoder`] before it is sent,
//! so integrations can translate `:code` shorthands into the service's
//! inline image markup. The default implementation sends text as typed;
//! the server accepts plain text, it just renders no images for it.

use async_trait::async_trait;

use crate::error::Result;

/// Collaborator contract for outbound emote expansion.
#[async_trait]
pub trait EmoteEncoder: Send + Sync {
    async fn encode(&self, raw: &str) -> Result<String>;
}

/// Pass-through encoder used when no emote data source is wired in.
#[derive(Debug, Default)]
pub struct PlainEmoteEncoder;

#[async_trait]
impl EmoteEncoder for PlainEmoteEncoder {
    async fn encode(&self, raw: &str) -> Result<String> {
        Ok(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_encoder_passes_text_through() {
        let encoder = PlainEmoteEncoder;
        assert_eq!(encoder.encode(":wave hello").await.unwrap(), ":wave hello");
    }
}
