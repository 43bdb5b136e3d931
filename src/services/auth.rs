//! Access-token verification for socket upgrades.
//!
//! ARCHITECTURE
//! ============
//! Tokens are minted by the account service as HS256 JWTs carrying the user
//! id in `uid`. The socket endpoint only verifies them; tests mint their
//! own with `new_access_token`, signed with the same secret.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOKEN_ISSUER: &str = "guess-who-game";

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("JWT secret too short (use 32+ chars)")]
    SecretTooShort,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("invalid token subject: {0}")]
    InvalidSubject(String),
}

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub iat: u64,
    pub nbf: u64,
    pub exp: u64,
    pub uid: String,
}

/// Signs and verifies access tokens with a shared secret.
pub struct TokenMaker {
    #[cfg(test)]
    encoding: jsonwebtoken::EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenMaker {
    /// # Errors
    ///
    /// Returns `SecretTooShort` if the secret is under 32 bytes.
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::SecretTooShort);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.validate_nbf = true;

        Ok(Self {
            #[cfg(test)]
            encoding: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Verify signature, issuer and expiry, returning the user id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` for a bad signature, issuer or expiry, and
    /// `InvalidSubject` if `uid` is not a UUID.
    pub fn parse_access_token(&self, raw: &str) -> Result<Uuid, AuthError> {
        let data = jsonwebtoken::decode::<AccessClaims>(raw, &self.decoding, &self.validation)?;
        data.claims
            .uid
            .parse()
            .map_err(|_| AuthError::InvalidSubject(data.claims.uid))
    }
}

#[cfg(test)]
impl TokenMaker {
    /// Mint an access token for `user_id` valid for `ttl`.
    pub fn new_access_token(&self, user_id: Uuid, ttl: std::time::Duration) -> Result<String, AuthError> {
        let now = unix_now();
        let claims = AccessClaims {
            iss: TOKEN_ISSUER.to_string(),
            iat: now,
            nbf: now,
            exp: now + ttl.as_secs(),
            uid: user_id.to_string(),
        };
        let header = jsonwebtoken::Header::new(Algorithm::HS256);
        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding)?)
    }
}

#[cfg(test)]
fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
