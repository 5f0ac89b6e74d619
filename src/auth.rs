//! HS256 JWT verification and channel ACL checks.
//!
//! Tokens arrive in `chan:join` payloads (`access_token`) and on the REST
//! surface as bearer headers. Claims may carry a `channels` array of allowed
//! topic patterns; `*` matches everything and a trailing `*` is a prefix
//! wildcard. A token without a `channels` claim may join any topic.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;

use crate::error::code;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingToken,
    #[error("malformed token")]
    MalformedToken,
    #[error("invalid token header")]
    InvalidHeader,
    #[error("unsupported algorithm (only HS256)")]
    UnsupportedAlgorithm,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid token payload")]
    InvalidPayload,
    #[error("token has expired")]
    TokenExpired,
    #[error("token not yet valid")]
    TokenNotYetValid,
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("channel not permitted")]
    ChannelForbidden,
}

impl AuthError {
    /// Wire code for reply payloads. Every variant stays inside the
    /// `AUTH_` family so clients suppress auto-rejoin uniformly.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => code::AUTH_MISSING,
            Self::TokenExpired => code::AUTH_EXPIRED,
            Self::TokenRevoked => code::AUTH_REVOKED,
            Self::InvalidSignature => code::AUTH_SIGNATURE,
            Self::ChannelForbidden => code::AUTH_FORBIDDEN,
            Self::MalformedToken
            | Self::InvalidHeader
            | Self::UnsupportedAlgorithm
            | Self::InvalidPayload
            | Self::TokenNotYetValid
            | Self::InvalidIssuer
            | Self::InvalidAudience => code::AUTH_INVALID,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: Vec<u8>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl JwtConfig {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            issuer: None,
            audience: None,
        }
    }
}

/// Decode and validate a token (HS256 only). Returns the claim set.
///
/// Validates signature, algorithm, `exp` (required), `nbf`, and the
/// configured issuer/audience constraints.
pub fn verify(token: &str, config: &JwtConfig) -> Result<Value, AuthError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(AuthError::MalformedToken);
    }
    let (header_b64, payload_b64, sig_b64) = (parts[0], parts[1], parts[2]);

    // Signature first: constant-time verify via the hmac crate.
    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| AuthError::MalformedToken)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&config.secret)
        .expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::InvalidSignature)?;

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| AuthError::InvalidHeader)?;
    let header: Value =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::InvalidHeader)?;
    let alg = header
        .get("alg")
        .and_then(Value::as_str)
        .ok_or(AuthError::InvalidHeader)?;
    if alg != "HS256" {
        return Err(AuthError::UnsupportedAlgorithm);
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidPayload)?;
    let claims: Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::InvalidPayload)?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    // exp is required; tokens without expiration are rejected.
    let exp = claims
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or(AuthError::TokenExpired)?;
    if now >= exp {
        return Err(AuthError::TokenExpired);
    }
    if let Some(nbf) = claims.get("nbf").and_then(Value::as_i64) {
        if now < nbf {
            return Err(AuthError::TokenNotYetValid);
        }
    }
    if let Some(expected) = config.issuer.as_deref() {
        if claims.get("iss").and_then(Value::as_str) != Some(expected) {
            return Err(AuthError::InvalidIssuer);
        }
    }
    if let Some(expected) = config.audience.as_deref() {
        let ok = match claims.get("aud") {
            Some(Value::String(aud)) => aud == expected,
            Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
            _ => false,
        };
        if !ok {
            return Err(AuthError::InvalidAudience);
        }
    }

    Ok(claims)
}

/// Sign a claim set into an HS256 token. Used by operational tooling and
/// tests; the server itself only verifies.
pub fn sign(claims: &Value, secret: &[u8]) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{header}.{payload}");
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{sig}")
}

/// Check a claim set against a topic. A missing or non-array `channels`
/// claim permits every topic.
pub fn can_access_channel(claims: &Value, topic: &str) -> bool {
    match claims.get("channels") {
        Some(Value::Array(patterns)) => patterns
            .iter()
            .filter_map(Value::as_str)
            .any(|p| topic_pattern_match(p, topic)),
        _ => true,
    }
}

/// ACL pattern match: a lone `*` admits every topic, a trailing `*` admits
/// any topic sharing the prefix, anything else must match the topic exactly.
/// A `*` anywhere but the end has no special meaning.
pub fn topic_pattern_match(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}
