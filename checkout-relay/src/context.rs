//! Per-request client context derived from HTTP headers

use crate::ip::{extract_client_ip, FALLBACK_IP};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cookie the vendor agent uses to carry its identification token.
pub const IDENTIFICATION_COOKIE: &str = "_iidt";

/// Data derived from a single incoming request. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequestContext {
    #[serde(rename = "clientIP", default = "default_client_ip")]
    pub client_ip: String,
    #[serde(default = "default_client_host")]
    pub client_host: String,
    #[serde(default)]
    pub client_user_agent: String,
    #[serde(default)]
    pub client_cookie: Option<String>,
    #[serde(default)]
    pub client_headers: BTreeMap<String, String>,
}

fn default_client_ip() -> String {
    FALLBACK_IP.to_string()
}

fn default_client_host() -> String {
    "localhost".to_string()
}

impl ClientRequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let client_headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            client_ip: extract_client_ip(headers),
            client_host: header("host").unwrap_or_else(default_client_host),
            client_user_agent: header("user-agent").unwrap_or_default(),
            client_cookie: header("cookie")
                .and_then(|c| cookie_value(&c, IDENTIFICATION_COOKIE).map(str::to_string)),
            client_headers,
        }
    }
}

/// Look up a single cookie value in a `Cookie` header.
pub fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}
