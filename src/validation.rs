//! Destination URL checks guarding callback delivery against SSRF.
//!
//! Only `http`/`https` URLs whose host is neither textually nor (optionally)
//! by resolution a loopback, link-local, unspecified or RFC1918 private
//! address are accepted. The empty string is accepted and means
//! "no callback configured"; callers must handle that case before queueing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use url::{Host, Url};

use crate::error::ValidationError;

const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "localhost.localdomain", "ip6-localhost"];

/// Textual validation of a callback URL. Performs no I/O.
pub fn validate_url(raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Ok(());
    }
    parse_destination(raw).map(|_| ())
}

/// Validate a callback URL and, when `resolve_within` is set, also check every
/// address the host resolves to.
///
/// A lookup that fails or times out keeps the textual verdict; delivery to
/// such a host fails on its own.
pub async fn validate_destination(
    raw: &str,
    resolve_within: Option<Duration>,
) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Ok(());
    }
    let url = parse_destination(raw)?;

    let (Some(timeout), Some(Host::Domain(domain))) = (resolve_within, url.host()) else {
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let lookup = tokio::net::lookup_host((domain, port));
    let verdict = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => {
            for addr in addrs {
                if is_blocked_ip(&addr.ip()) {
                    return Err(ValidationError::BlockedHost(format!(
                        "{} resolves to {}",
                        domain,
                        addr.ip()
                    )));
                }
            }
            Ok(())
        }
        Ok(Err(err)) => {
            tracing::debug!(host = domain, error = %err, "callback host did not resolve");
            Ok(())
        }
        Err(_) => {
            tracing::debug!(host = domain, "callback host lookup timed out");
            Ok(())
        }
    };
    verdict
}

fn parse_destination(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::UnsupportedScheme(other.to_string())),
    }

    match url.host() {
        None => Err(ValidationError::MissingHost),
        Some(Host::Ipv4(ip)) if is_blocked_ipv4(&ip) => {
            Err(ValidationError::BlockedHost(ip.to_string()))
        }
        Some(Host::Ipv6(ip)) if is_blocked_ipv6(&ip) => {
            Err(ValidationError::BlockedHost(ip.to_string()))
        }
        Some(Host::Domain(domain)) if is_blocked_hostname(domain) => {
            Err(ValidationError::BlockedHost(domain.to_string()))
        }
        Some(_) => Ok(url),
    }
}

fn is_blocked_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    BLOCKED_HOSTNAMES.contains(&host.as_str()) || host.ends_with(".localhost")
}

/// Loopback, link-local, unspecified or private-range address.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(&v4);
    }
    let segments = ip.segments();
    // Unique local (fc00::/7)
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // Link-local (fe80::/10)
    (segments[0] & 0xffc0) == 0xfe80
}
