//! Optional HMAC-SHA256 signing of status callbacks.
//!
//! Delivery works unsigned. When a [`CallbackSigner`] is configured, every
//! callback carries a hex signature over `timestamp || body` plus the
//! timestamp itself, so receivers can reject forged or replayed requests.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Callback-Signature";
pub const DEFAULT_TIMESTAMP_HEADER: &str = "X-Callback-Timestamp";

type HmacSha256 = Hmac<Sha256>;

/// Signs outgoing callback bodies.
#[derive(Debug, Clone)]
pub struct CallbackSigner {
    secret: Vec<u8>,
    signature_header: String,
    timestamp_header: String,
}

impl CallbackSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            timestamp_header: DEFAULT_TIMESTAMP_HEADER.to_string(),
        }
    }

    pub fn with_headers(
        mut self,
        signature_header: impl Into<String>,
        timestamp_header: impl Into<String>,
    ) -> Self {
        self.signature_header = signature_header.into();
        self.timestamp_header = timestamp_header.into();
        self
    }

    /// Header pairs to attach to a request carrying `payload`.
    pub fn headers(&self, payload: &[u8]) -> Vec<(String, String)> {
        self.headers_at(payload, now_secs())
    }

    /// Receiver side: check a request signed by a signer with the same
    /// secret and header names.
    pub fn verify<'a, I>(
        &self,
        headers: I,
        payload: &[u8],
        max_age_secs: u64,
        now_secs: u64,
    ) -> Result<(), VerificationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        verify_with_headers(
            headers,
            payload,
            &self.secret,
            (self.signature_header.as_str(), self.timestamp_header.as_str()),
            max_age_secs,
            now_secs,
        )
    }

    fn headers_at(&self, payload: &[u8], timestamp_secs: u64) -> Vec<(String, String)> {
        let timestamp = timestamp_secs.to_string();
        let signature = compute_signature(&self.secret, payload, Some(&timestamp));
        vec![
            (self.signature_header.clone(), signature),
            (self.timestamp_header.clone(), timestamp),
        ]
    }
}

/// Compute the hex HMAC of `timestamp || payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let mut mac = keyed_mac(secret);
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature in constant time.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature_hex: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = keyed_mac(secret);
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this cannot fail.
    <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"))
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify an incoming callback using the default header names.
pub fn verify_callback<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    verify_with_headers(
        headers,
        payload,
        secret,
        (DEFAULT_SIGNATURE_HEADER, DEFAULT_TIMESTAMP_HEADER),
        max_age_secs,
        now_secs,
    )
}

fn verify_with_headers<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    (signature_header, timestamp_header): (&str, &str),
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut signature = None;
    let mut timestamp = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(signature_header) {
            signature = Some(value);
        } else if name.eq_ignore_ascii_case(timestamp_header) {
            timestamp = Some(value);
        }
    }

    let signature = signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, payload, Some(timestamp_str), signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
