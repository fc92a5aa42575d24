use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Cookies the vendor agent uses to recognise a returning browser
pub const IDENTIFICATION_COOKIES: [&str; 3] = ["_iidt", "_vid_t", "_dd_s"];

/// Minimal cookie jar for one session; clones share the same cookies
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Arc<Mutex<BTreeMap<String, String>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Apply a `Set-Cookie` header value. Empty values, `Max-Age=0` and
    /// expiry dates in the past delete the cookie.
    pub fn absorb_set_cookie(&self, header: &str) {
        let mut parts = header.split(';').map(str::trim);
        let Some((name, value)) = parts.next().and_then(|p| p.split_once('=')) else {
            debug!(header, "Ignoring malformed Set-Cookie header");
            return;
        };

        let expired = value.is_empty()
            || parts.any(|attr| {
                let lower = attr.to_ascii_lowercase();
                lower == "max-age=0"
                    || lower.starts_with("max-age=-")
                    || lower
                        .strip_prefix("expires=")
                        .map_or(false, |date| is_past(date))
            });

        if expired {
            self.remove(name.trim());
        } else {
            self.set(name.trim(), value.trim());
        }
    }

    /// Drop every identification cookie
    pub fn clear_identification(&self) {
        let mut cookies = self.lock();
        for name in IDENTIFICATION_COOKIES {
            cookies.remove(name);
        }
    }
}

fn is_past(date: &str) -> bool {
    chrono::DateTime::parse_from_rfc2822(date)
        .map(|d| d < chrono::Utc::now())
        .unwrap_or(false)
}
