//! Fingerprint server API provider

use super::{IdentificationProvider, ProviderError, SendRequest, SendResponse, VendorBody};
use async_trait::async_trait;
use reqwest::header::SET_COOKIE;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default server API origin (US region)
pub const DEFAULT_VENDOR_URL: &str = "https://api.fpjs.io";

/// Fingerprint `/send` endpoint client
pub struct FingerprintProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl FingerprintProvider {
    /// Create a provider for the default region
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(DEFAULT_VENDOR_URL, api_key)
    }

    /// Create with a specific API origin (other regions, or a test double)
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl IdentificationProvider for FingerprintProvider {
    fn name(&self) -> &str {
        "fingerprint"
    }

    async fn send(&self, request: &SendRequest) -> Result<SendResponse, ProviderError> {
        let url = format!("{}/send", self.base_url);
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("Auth-API-Key", &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Fingerprint API rejected request");
            return Err(ProviderError::VendorError {
                status: status.as_u16(),
                text,
            });
        }

        let set_cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();

        let body: VendorBody = response.json().await?;
        debug!(
            latency_ms = start.elapsed().as_secs_f64() * 1000.0,
            cookies = set_cookies.len(),
            "Fingerprint API responded"
        );

        Ok(body.into_response(set_cookies))
    }
}
