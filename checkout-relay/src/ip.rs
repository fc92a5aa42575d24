//! Client IP extraction from proxy headers

use axum::http::HeaderMap;
use tracing::debug;

/// Public address used when no usable client IP is present in the headers.
pub const FALLBACK_IP: &str = "8.8.8.8";

/// Check whether `ip` is a dotted-quad IPv4 address or a fully expanded IPv6 address.
///
/// IPv6 support is deliberately narrow: exactly eight colon-separated hextets of
/// one to four hex digits. Compressed forms (`::1`) are rejected.
pub fn is_valid_ip(ip: &str) -> bool {
    is_ipv4(ip) || is_expanded_ipv6(ip)
}

fn is_ipv4(ip: &str) -> bool {
    let octets: Vec<&str> = ip.split('.').collect();
    octets.len() == 4
        && octets.iter().all(|octet| {
            (1..=3).contains(&octet.len())
                && octet.bytes().all(|b| b.is_ascii_digit())
                && octet.parse::<u16>().map_or(false, |v| v <= 255)
        })
}

fn is_expanded_ipv6(ip: &str) -> bool {
    let hextets: Vec<&str> = ip.split(':').collect();
    hextets.len() == 8
        && hextets
            .iter()
            .all(|h| (1..=4).contains(&h.len()) && h.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Derive a best-effort client IP from request headers.
///
/// Reads the first entry of `x-forwarded-for`, else `x-real-ip`. An empty or
/// unreadable header counts as absent. Anything that fails validation is
/// replaced by [`FALLBACK_IP`].
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    let first_entry = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let candidate = first_entry("x-forwarded-for").or_else(|| first_entry("x-real-ip"));

    match candidate {
        Some(ip) if is_valid_ip(ip) => ip.to_string(),
        other => {
            debug!(candidate = ?other, fallback = FALLBACK_IP, "Using fallback IP address");
            FALLBACK_IP.to_string()
        }
    }
}
