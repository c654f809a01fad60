//! Reads claims out of a JWT-shaped credential without verifying it.
//!
//! The signature is never checked: the issuing provider is trusted and the only use of
//! the payload is to learn when the credential stops being worth caching.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected three dot-separated segments, found {0}")]
    Shape(usize),
    #[error("payload is not base64url: {0}")]
    Base64(String),
    #[error("payload is not a JSON object: {0}")]
    Json(String),
    #[error("payload has no numeric exp claim")]
    MissingExpiry,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnverifiedClaims {
    /// Expiry in seconds since the epoch.
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub sub: Option<String>,
    pub raw: Value,
}

impl UnverifiedClaims {
    pub fn expires_at_ms(&self) -> Option<i64> {
        self.exp.map(|secs| secs.saturating_mul(1000))
    }
}

pub fn decode_unverified(token: &str) -> Result<UnverifiedClaims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::Shape(segments.len()));
    }
    let payload = segments[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    let raw: Value = serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
    if !raw.is_object() {
        return Err(DecodeError::Json("not an object".into()));
    }
    Ok(UnverifiedClaims {
        exp: numeric_claim(&raw, "exp"),
        iat: numeric_claim(&raw, "iat"),
        sub: raw.get("sub").and_then(|v| v.as_str()).map(str::to_string),
        raw,
    })
}

/// Expiry of `token` in epoch milliseconds.
pub fn expiry_ms(token: &str) -> Result<i64, DecodeError> {
    decode_unverified(token)?
        .expires_at_ms()
        .ok_or(DecodeError::MissingExpiry)
}

fn numeric_claim(raw: &Value, name: &str) -> Option<i64> {
    let value = raw.get(name)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.c2ln")
    }

    #[test]
    fn reads_exp_in_milliseconds() {
        let token = token_with(json!({"exp": 1_700_000_000, "sub": "app"}));
        let claims = decode_unverified(&token).expect("claims");
        assert_eq!(claims.exp, Some(1_700_000_000));
        assert_eq!(claims.sub.as_deref(), Some("app"));
        assert_eq!(expiry_ms(&token), Ok(1_700_000_000_000));
    }

    #[test]
    fn accepts_float_exp_and_padded_payload() {
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let body = URL_SAFE_NO_PAD.encode(json!({"exp": 1_700_000_000.5}).to_string());
        let token = format!("{header}.{body}==.sig");
        assert_eq!(expiry_ms(&token), Ok(1_700_000_000_000));
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert_eq!(decode_unverified("opaque"), Err(DecodeError::Shape(1)));
        assert!(matches!(
            decode_unverified("a.!!!.c"),
            Err(DecodeError::Base64(_))
        ));
        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode("hello"));
        assert!(matches!(decode_unverified(&not_json), Err(DecodeError::Json(_))));
    }

    #[test]
    fn missing_exp_is_reported() {
        let token = token_with(json!({"sub": "app"}));
        assert_eq!(expiry_ms(&token), Err(DecodeError::MissingExpiry));
        let token = token_with(json!({"exp": "soon"}));
        assert_eq!(expiry_ms(&token), Err(DecodeError::MissingExpiry));
    }
}
