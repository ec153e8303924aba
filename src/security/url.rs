//! Outbound URL validation.
//!
//! Scheme filtering is unconditional — `file:`, `javascript:`, `data:`,
//! `gopher:` and friends are rejected whether or not offline mode is active.
//! Offline mode adds a loopback-only host requirement, judged on the
//! *parsed* host so `localhost.evil.com`, `user@evil.com` userinfo tricks
//! and fragment/query injections all fail.
//!
//! Uses the `Url` type re-exported by reqwest, which is what every outbound
//! request is built from anyway — the validated value and the dialled value
//! cannot diverge.

use std::net::IpAddr;

use reqwest::Url;

use crate::error::CoreError;

/// Validate an outbound URL.
///
/// `offline` adds the loopback-only requirement on top of the scheme filter.
pub fn validate_url(raw: &str, offline: bool) -> Result<Url, CoreError> {
    let url = Url::parse(raw)
        .map_err(|e| CoreError::InvalidUrlScheme(format!("unparseable URL: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CoreError::InvalidUrlScheme(format!(
                "scheme {other:?} is not allowed"
            )))
        }
    }

    if offline && !is_loopback_host(&url) {
        return Err(CoreError::OfflineModeBlocks(format!(
            "SC-7: non-loopback host blocked in offline mode: {}",
            url.host_str().unwrap_or("<none>")
        )));
    }

    Ok(url)
}

/// Whether the URL's host is a loopback address or exactly `localhost`.
fn is_loopback_host(url: &Url) -> bool {
    match url.host_str() {
        Some(host) => {
            if host.eq_ignore_ascii_case("localhost") {
                return true;
            }
            // Bracketed IPv6 hosts parse through the IpAddr path too.
            let trimmed = host.trim_start_matches('[').trim_end_matches(']');
            trimmed
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
        }
        None => false,
    }
}
