//! Slack request signing.
//!
//! Slack signs every request with `v0=` followed by the hex encoded
//! HMAC-SHA256 of `v0:{timestamp}:{raw body}`, keyed by the app's signing
//! secret. Requests whose timestamp drifts further than the configured window
//! are rejected to block replays.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

const VERSION: &str = "v0";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing `{0}` header")]
    MissingHeader(&'static str),
    #[error("request timestamp `{0}` is not a unix timestamp")]
    InvalidTimestamp(String),
    #[error("request timestamp is {age_secs}s away from now")]
    Stale { age_secs: u64 },
    #[error("signature is not in `v0=<hex>` form")]
    Malformed,
    #[error("signature does not match request body")]
    Mismatch,
}

pub struct SignatureVerifier {
    signing_secret: SecretString,
    max_age_secs: u64,
}

impl SignatureVerifier {
    pub fn new(signing_secret: SecretString, max_age_secs: u64) -> Self {
        Self { signing_secret, max_age_secs }
    }

    /// Checks a request against its signature headers. `now` is unix seconds.
    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;
        let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;

        let issued_at = timestamp
            .trim()
            .parse::<i64>()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_owned()))?;
        let age_secs = now.abs_diff(issued_at);
        if age_secs > self.max_age_secs {
            return Err(SignatureError::Stale { age_secs });
        }

        let provided = signature
            .strip_prefix("v0=")
            .and_then(|digest| hex::decode(digest).ok())
            .ok_or(SignatureError::Malformed)?;

        self.mac(timestamp, body).verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
    }

    /// The `v0=...` signature Slack would send for this body.
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> String {
        let digest = self.mac(timestamp, body).finalize().into_bytes();
        format!("{VERSION}={}", hex::encode(digest))
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.expose_secret().as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts keys of any length"));
        mac.update(VERSION.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        mac
    }
}
