//! Post-call webhook signature validation.
//!
//! The header carries `t=<unix_seconds>,v0=<hex>`; the expected digest is
//! HMAC-SHA-256 of `"<t>.<raw_body>"` under the shared secret. Stale or
//! mismatched signatures are rejected before any payload parsing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Reject webhooks whose timestamp is older than this.
const MAX_AGE_SECONDS: i64 = 30 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    MissingHeader,
    MalformedHeader,
    Stale,
    Mismatch,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader => write!(f, "signature header missing"),
            Self::MalformedHeader => write!(f, "signature header malformed"),
            Self::Stale => write!(f, "signature timestamp too old"),
            Self::Mismatch => write!(f, "signature digest mismatch"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Validate `header` against `body` with the shared `secret` at time `now`.
pub fn verify(
    secret: &str,
    header: Option<&str>,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;
    let (timestamp, provided_hex) = parse_header(header)?;

    let age = now.timestamp() - timestamp;
    if age > MAX_AGE_SECONDS {
        return Err(SignatureError::Stale);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::MalformedHeader)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected_hex = hex::encode(mac.finalize().into_bytes());

    if constant_time_eq(expected_hex.as_bytes(), provided_hex.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Exact `t=…,v0=…` format; anything else is malformed.
fn parse_header(header: &str) -> Result<(i64, &str), SignatureError> {
    let (t_part, v0_part) = header.split_once(',').ok_or(SignatureError::MalformedHeader)?;
    let timestamp = t_part
        .strip_prefix("t=")
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or(SignatureError::MalformedHeader)?;
    let provided = v0_part
        .strip_prefix("v0=")
        .ok_or(SignatureError::MalformedHeader)?;
    if provided.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }
    Ok((timestamp, provided))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(body);
        format!("t={},v0={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 12, 0, 0).unwrap();
        let body = br#"{"type":"post_call_transcription"}"#;
        let header = sign("secret", now.timestamp() - 300, body);
        assert_eq!(verify("secret", Some(&header), body, now), Ok(()));
    }

    #[test]
    fn missing_header_is_rejected() {
        let now = Utc::now();
        assert_eq!(
            verify("secret", None, b"{}", now),
            Err(SignatureError::MissingHeader)
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let now = Utc::now();
        for header in ["", "t=abc,v0=00", "v0=00,t=123", "t=123", "t=123,v0="] {
            assert_eq!(
                verify("secret", Some(header), b"{}", now),
                Err(SignatureError::MalformedHeader),
                "header {:?}",
                header
            );
        }
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 12, 0, 0).unwrap();
        let body = b"{}";
        // 31 minutes old: past the 30 minute window.
        let header = sign("secret", now.timestamp() - 31 * 60, body);
        assert_eq!(
            verify("secret", Some(&header), body, now),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 12, 0, 0).unwrap();
        let header = sign("secret", now.timestamp(), b"original");
        assert_eq!(
            verify("secret", Some(&header), b"tampered", now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 12, 0, 0).unwrap();
        let body = b"{}";
        let header = sign("other-secret", now.timestamp(), body);
        assert_eq!(
            verify("secret", Some(&header), body, now),
            Err(SignatureError::Mismatch)
        );
    }
}
