//! Outbound HTTPS fetches.
//!
//! The protocol leans on two HTTPS side channels: the server
//! configuration document fetched before dialing, and EXTDATA payload
//! indirection. Both go through [`HttpFetcher`] so tests can stub them.

use async_trait::async_trait;

use crate::error::{ClientError, Result};

/// Minimal fetch contract: GET a URL, return the body as text.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<String>;
}

/// Default fetcher backed by a shared `reqwest` client.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestFetcher {
    pub fn new() -> ReqwestFetcher {
        ReqwestFetcher { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::http(url, e))?;
        let response = response
            .error_for_status()
            .map_err(|e| ClientError::http(url, e))?;
        response.text().await.map_err(|e| ClientError::http(url, e))
    }
}
