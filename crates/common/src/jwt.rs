//! Signed payload tokens.
//!
//! The signaling service hands out short tokens whose only job is to carry an
//! opaque payload string, for example `call:<callId>:<userId>` for a call join
//! or a login id for a notification session, together with an issuer and an
//! expiry. Tokens are HS256 JWTs with the claims `{pl, iss, exp}`.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted, and the issuer must match
//! - An expired token is reported separately so clients can re-authenticate
//! - The payload is redacted in `Debug` output

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum accepted token size in bytes (8KB).
///
/// Larger inputs are rejected before any decoding or signature work.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Errors from issuing or verifying a token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Token exceeds [`MAX_TOKEN_SIZE_BYTES`].
    #[error("The token is invalid")]
    TooLarge,

    /// Signature, issuer or structure did not check out.
    #[error("The token is invalid")]
    Invalid,

    /// Token was valid but its `exp` has passed.
    #[error("The token has expired")]
    Expired,

    /// Encoding failed while issuing.
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

/// Claims carried by every payload token.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadClaims {
    /// Opaque payload, redacted in Debug output.
    pub pl: String,

    /// Issuer.
    pub iss: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,
}

impl fmt::Debug for PayloadClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadClaims")
            .field("pl", &"[REDACTED]")
            .field("iss", &self.iss)
            .field("exp", &self.exp)
            .finish()
    }
}

/// Issues and verifies payload tokens with a shared HMAC secret.
#[derive(Clone)]
pub struct TokenSigner {
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("issuer", &self.issuer)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl TokenSigner {
    /// Create a signer from the shared secret and the issuer name placed in
    /// (and required of) every token.
    #[must_use]
    pub fn new(secret: &SecretString, issuer: impl Into<String>) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            issuer: issuer.into(),
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
        }
    }

    /// Issuer this signer stamps into tokens.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Issue a token carrying `payload`, valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue(&self, payload: &str, ttl: Duration) -> Result<String, TokenError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let exp = Utc::now().timestamp().saturating_add(ttl_secs);
        self.issue_with_expiry(payload, exp)
    }

    fn issue_with_expiry(&self, payload: &str, exp: i64) -> Result<String, TokenError> {
        let claims = PayloadClaims {
            pl: payload.to_string(),
            iss: self.issuer.clone(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verify a token and return its payload.
    ///
    /// # Errors
    ///
    /// - [`TokenError::TooLarge`] for oversized input
    /// - [`TokenError::Expired`] when `exp` has passed
    /// - [`TokenError::Invalid`] for anything else
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            tracing::debug!(
                target: "common.jwt",
                token_size = token.len(),
                "Token rejected: size exceeds maximum"
            );
            return Err(TokenError::TooLarge);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);

        match decode::<PayloadClaims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims.pl),
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => Err(TokenError::Expired),
            Err(e) => {
                tracing::debug!(target: "common.jwt", error = %e, "Token rejected");
                Err(TokenError::Invalid)
            }
        }
    }
}
