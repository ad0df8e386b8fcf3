//! Identity Verification
//!
//! Validates the signed token a client presents in its first frame and
//! turns it into a verified identity. Sessions are never trusted with a
//! self-asserted user id; every identity on the wire comes from here.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::now_secs;

/// Token lifetime in seconds (30 days).
const TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Authentication failures surfaced to the connection handler.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingToken,
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("Token subject is not a known user")]
    SubjectNotFound,
}

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Display name
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at time (Unix timestamp)
    pub iat: u64,
}

/// Identity established by a successful handshake.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
}

/// Verifies handshake tokens against a shared secret.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        TokenVerifier {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
        }
    }

    /// Verifies a token and extracts the identity it carries.
    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let validation = Validation::default();
        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e),
            }
        })?;

        Ok(VerifiedIdentity {
            user_id: token_data.claims.sub,
            username: token_data.claims.username,
            email: token_data.claims.email,
        })
    }

    /// Issues a token for a user. Used by provisioning tooling and tests;
    /// production clients obtain tokens from the account service.
    pub fn issue(
        &self,
        user_id: &str,
        username: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = now_secs();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            email: None,
            exp: now + TOKEN_TTL_SECS,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
    }
}
