//! Authenticated Session
//!
//! The server issues a signed token on device authentication. The client
//! cannot verify the signature, it only reads the claims it needs:
//! `uid` (user id), `usn` (username) and `exp` (expiry).

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id.
    #[serde(default)]
    pub uid: String,
    /// Username.
    #[serde(default)]
    pub usn: Option<String>,
    /// Expiry timestamp (Unix seconds). Zero when absent.
    #[serde(default)]
    pub exp: i64,
}

/// Session token errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Token is not a decodable JWT.
    #[error("invalid session token: {0}")]
    InvalidToken(String),
    /// Token has no user id.
    #[error("session token has no user id")]
    MissingUserId,
}

/// Result of a successful device authentication. Immutable once issued.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: String,
    username: Option<String>,
    auth_token: String,
    refresh_token: Option<String>,
    expiry: DateTime<Utc>,
    created: bool,
}

impl Session {
    /// Build a session from already known parts.
    pub fn new(
        user_id: impl Into<String>,
        username: Option<String>,
        auth_token: impl Into<String>,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username,
            auth_token: auth_token.into(),
            refresh_token: None,
            expiry,
            created: false,
        }
    }

    /// Parse the server-issued token.
    pub fn from_token(
        auth_token: &str,
        refresh_token: Option<String>,
        created: bool,
    ) -> Result<Self, SessionError> {
        let claims = decode_claims(auth_token)?;
        if claims.uid.is_empty() {
            return Err(SessionError::MissingUserId);
        }

        // No expiry claim means the token never expires.
        let expiry = if claims.exp > 0 {
            Utc.timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        } else {
            DateTime::<Utc>::MAX_UTC
        };

        Ok(Self {
            user_id: claims.uid,
            username: claims.usn,
            auth_token: auth_token.to_string(),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expiry,
            created,
        })
    }

    /// Authenticated user id. Never empty.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Username, if the server assigned one.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Bearer token for HTTP and socket calls.
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Refresh token, if issued.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Token expiry.
    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    /// Whether the account was created by this authentication.
    pub fn created(&self) -> bool {
        self.created
    }

    /// True once the token has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True if the token is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// Short hash of the token, safe to log.
    pub fn token_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.auth_token.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("token", &self.token_fingerprint())
            .field("expiry", &self.expiry)
            .field("created", &self.created)
            .finish()
    }
}

/// Read claims without verifying the signature.
fn decode_claims(token: &str) -> Result<SessionClaims, SessionError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.required_spec_claims = HashSet::new();
    validation.validate_exp = false;
    validation.validate_aud = false;

    decode::<SessionClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| SessionError::InvalidToken(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================
