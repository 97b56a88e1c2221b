//! Callback-token minting/verification and inbound webhook signatures.
//!
//! Two distinct mechanisms live here:
//!
//! - **Callback tokens**: HS256-signed tokens handed out when an approval
//!   is requested. The token binds the approval ID and the approval expiry
//!   under a keyed MAC over the entire payload; any mutation invalidates it.
//! - **Webhook signatures**: HMAC-SHA256 validation of inbound signed
//!   payloads from messaging platforms (`v0:{timestamp}:{body}` base
//!   string, five-minute replay window).
//!
//! Both mechanisms **fail closed**: with no signing key configured, every
//! verification call fails and every inbound payload is rejected.
//!
//! Note that token *expiry* is deliberately not enforced during decoding.
//! The decision intake must distinguish an expired approval (410) from a
//! forged token (401), so expiry is checked against the stored approval
//! row, where it can be ordered before the status check.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use ulid::Ulid;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew for inbound signed payloads, in seconds.
pub const WEBHOOK_MAX_SKEW_SECONDS: i64 = 300;

/// Version prefix carried by webhook signature headers.
const WEBHOOK_SIGNATURE_VERSION: &str = "v0";

/// Configuration for signing and verifying callback tokens.
#[derive(Debug, Clone, Default)]
pub struct SigningConfig {
    /// HS256 secret. `None` means unconfigured: minting fails and every
    /// verification call is rejected.
    secret: Option<String>,
}

impl SigningConfig {
    /// Creates a config with the given secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    /// Creates an unconfigured config that rejects all operations.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { secret: None }
    }

    /// Loads the config from the `SIGNING_KEY` environment variable.
    ///
    /// A missing or empty variable yields an unconfigured config rather
    /// than an error, so non-callback operation can proceed while every
    /// verification fails closed.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("SIGNING_KEY") {
            Ok(value) if !value.trim().is_empty() => Self::new(value),
            _ => Self::disabled(),
        }
    }

    /// Returns true when a signing key is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.secret
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    fn key(&self) -> Result<&str> {
        match self.secret.as_deref() {
            Some(secret) if !secret.trim().is_empty() => Ok(secret),
            _ => Err(Error::token_invalid("no signing key configured")),
        }
    }
}

/// Canonical callback-token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackClaims {
    /// The approval this token is bound to.
    #[serde(alias = "approval_id")]
    pub approval_id: String,
    /// Expiry (unix timestamp seconds). Mirrors the approval row's
    /// `expires_at`; enforcement happens against the row.
    pub exp: usize,
    /// Unique token identifier.
    pub jti: String,
}

/// Result of minting a callback token.
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// Signed token string.
    pub token: String,
    /// Expiry carried in the token.
    pub expires_at: DateTime<Utc>,
}

/// Mints a callback token bound to one approval ID and its expiry.
///
/// # Errors
///
/// Returns [`Error::TokenInvalid`] when no signing key is configured, and
/// an error when signing fails.
pub fn mint_callback_token(
    config: &SigningConfig,
    approval_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<MintedToken> {
    let key = config.key()?;

    let exp = usize::try_from(expires_at.timestamp())
        .map_err(|_| Error::InvalidInput("expiry timestamp out of range".to_string()))?;

    let claims = CallbackClaims {
        approval_id: approval_id.to_string(),
        exp,
        jti: Ulid::new().to_string(),
    };

    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .map_err(|e| Error::internal(format!("callback token minting failed: {e}")))?;

    Ok(MintedToken { token, expires_at })
}

/// Decodes and verifies a callback token, returning its claims.
///
/// Verification covers the signature over the entire payload; token expiry
/// is intentionally not validated here (see the module docs).
///
/// # Errors
///
/// Returns [`Error::TokenInvalid`] when no signing key is configured or
/// the token fails verification.
pub fn decode_callback_token(config: &SigningConfig, token: &str) -> Result<CallbackClaims> {
    let key = config.key()?;

    let mut validation = Validation::new(Algorithm::HS256);
    // Expiry is enforced against the approval row, not the token.
    validation.validate_exp = false;

    let data = jsonwebtoken::decode::<CallbackClaims>(
        token,
        &DecodingKey::from_secret(key.as_bytes()),
        &validation,
    )
    .map_err(|e| Error::token_invalid(format!("callback token rejected: {e}")))?;

    Ok(data.claims)
}

/// Signs a webhook payload, producing a `v0=<hex>` signature header value.
///
/// Counterpart of [`verify_webhook_signature`], used by tests and by
/// adapters that need to emit signed payloads.
#[must_use]
pub fn sign_webhook_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC-SHA256 accepts any key length");
    mac.update(format!("{WEBHOOK_SIGNATURE_VERSION}:{timestamp}:").as_bytes());
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("{WEBHOOK_SIGNATURE_VERSION}={}", hex_encode(&digest))
}

/// Verifies an inbound webhook signature.
///
/// Returns `false` (rejecting the payload) when:
/// - no secret is configured (fail closed),
/// - the timestamp is more than [`WEBHOOK_MAX_SKEW_SECONDS`] away from
///   `now` in either direction (replay resistance),
/// - the signature header does not match the recomputed MAC.
///
/// The comparison is constant-time.
#[must_use]
pub fn verify_webhook_signature(
    secret: Option<&str>,
    timestamp: i64,
    body: &[u8],
    signature: &str,
    now: DateTime<Utc>,
) -> bool {
    let Some(secret) = secret.filter(|s| !s.trim().is_empty()) else {
        tracing::error!("webhook signing secret not configured; rejecting signed payload");
        return false;
    };

    let skew = (now.timestamp() - timestamp).abs();
    if skew > WEBHOOK_MAX_SKEW_SECONDS {
        tracing::warn!(skew_seconds = skew, "webhook timestamp outside replay window");
        return false;
    }

    let expected = sign_webhook_payload(secret, timestamp, body);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Constant-time byte comparison. Length difference short-circuits, which
/// leaks only the length, never the content.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
