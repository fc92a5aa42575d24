//! Client side of the relay endpoints, used by the checkout session

use crate::api::{
    BackendData, IdentifyRequest, IdentifyResponse, StoreRequest, StoreResponse, CLEAR_PATH,
    IDENTIFY_PATH, STORE_PATH,
};
use crate::context::IDENTIFICATION_COOKIE;
use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend request failed with status {status}: {message}")]
    Status { status: u16, message: String },
}

/// Identify response together with the cookies the relay set
#[derive(Debug, Clone, Default)]
pub struct IdentifyOutcome {
    pub response: IdentifyResponse,
    pub set_cookies: Vec<String>,
}

/// The relay endpoints, as seen by the session
#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Store signals; `cookie` is the current `_iidt` value, if any
    async fn store(
        &self,
        payload: &Value,
        cookie: Option<&str>,
    ) -> Result<StoreResponse, RelayClientError>;

    /// Identify a previously stored record
    async fn identify(
        &self,
        stored: &BackendData,
        cookie: Option<&str>,
    ) -> Result<IdentifyOutcome, RelayClientError>;

    /// Ask the relay to expire identification cookies; returns its `Set-Cookie` values
    async fn clear(&self) -> Result<Vec<String>, RelayClientError>;
}

/// `RelayBackend` over HTTP
pub struct HttpRelayClient {
    client: Client,
    base_url: String,
}

impl HttpRelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RelayClientError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B>(&self, path: &str, body: &B, cookie: Option<&str>) -> Result<Response, RelayClientError>
    where
        B: serde::Serialize + ?Sized,
    {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);

        if let Some(cookie) = cookie {
            request = request.header(COOKIE, format!("{IDENTIFICATION_COOKIE}={cookie}"));
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Err(RelayClientError::Status {
            status,
            message: error_message(&text),
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Pull `error` out of a `{"error": ...}` body, or fall back to the raw text
fn error_message(text: &str) -> String {
    serde_json::from_str::<ErrorBody>(text)
        .map(|b| b.error)
        .unwrap_or_else(|_| text.to_string())
}

fn set_cookies(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, RelayClientError> {
    Ok(response.json().await?)
}

#[async_trait]
impl RelayBackend for HttpRelayClient {
    async fn store(
        &self,
        payload: &Value,
        cookie: Option<&str>,
    ) -> Result<StoreResponse, RelayClientError> {
        let body = StoreRequest {
            fingerprint_data: Some(payload.clone()),
        };
        json(self.post(STORE_PATH, &body, cookie).await?).await
    }

    async fn identify(
        &self,
        stored: &BackendData,
        cookie: Option<&str>,
    ) -> Result<IdentifyOutcome, RelayClientError> {
        let body = IdentifyRequest {
            fingerprint_data: None,
            backend_data: Some(stored.clone()),
        };
        let response = self.post(IDENTIFY_PATH, &body, cookie).await?;
        let set_cookies = set_cookies(&response);

        Ok(IdentifyOutcome {
            response: json(response).await?,
            set_cookies,
        })
    }

    async fn clear(&self) -> Result<Vec<String>, RelayClientError> {
        let response = self.post(CLEAR_PATH, &serde_json::json!({}), None).await?;
        Ok(set_cookies(&response))
    }
}
