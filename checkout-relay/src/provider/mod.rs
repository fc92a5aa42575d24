//! Identification provider abstraction and the Fingerprint implementation

mod fingerprint;

pub use fingerprint::{FingerprintProvider, DEFAULT_VENDOR_URL};

use crate::context::ClientRequestContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when talking to the identification service
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Non-success status from the vendor, with its response body
    #[error("Fingerprint API error: {status}, {text}")]
    VendorError { status: u16, text: String },
}

/// Payload forwarded to the vendor `/send` endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub fingerprint_data: Value,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    pub client_host: String,
    pub client_user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cookie: Option<String>,
    pub client_headers: BTreeMap<String, String>,
}

impl SendRequest {
    pub fn new(fingerprint_data: Value, context: ClientRequestContext) -> Self {
        Self {
            fingerprint_data,
            client_ip: context.client_ip,
            client_host: context.client_host,
            client_user_agent: context.client_user_agent,
            client_cookie: context.client_cookie,
            client_headers: context.client_headers,
        }
    }
}

/// Fields of the vendor response the relay cares about
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendResponse {
    pub visitor_id: Option<String>,
    pub request_id: Option<String>,
    /// Bot detection verdict, passed through untouched
    pub botd: Option<Value>,
    /// Follow-up instructions for the client agent
    pub agent_data: Option<Value>,
    /// Raw `Set-Cookie` header values to relay to the caller
    pub set_cookies: Vec<String>,
}

/// Vendor response body; every field is optional upstream
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VendorBody {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub agent_data: Option<Value>,
    #[serde(default)]
    pub products: Option<VendorProducts>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct VendorProducts {
    #[serde(default)]
    pub identification: Option<VendorProduct<Identification>>,
    #[serde(default)]
    pub botd: Option<VendorProduct<Value>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VendorProduct<T> {
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Identification {
    #[serde(default)]
    pub visitor_id: Option<String>,
}

impl VendorBody {
    pub(crate) fn into_response(self, set_cookies: Vec<String>) -> SendResponse {
        let products = self.products.unwrap_or_default();
        SendResponse {
            visitor_id: products
                .identification
                .and_then(|p| p.data)
                .and_then(|d| d.visitor_id),
            botd: products.botd.and_then(|p| p.data),
            request_id: self.request_id,
            agent_data: self.agent_data,
            set_cookies,
        }
    }
}

/// Trait for identification backends
#[async_trait]
pub trait IdentificationProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Forward collected signals for identification
    async fn send(&self, request: &SendRequest) -> Result<SendResponse, ProviderError>;
}
