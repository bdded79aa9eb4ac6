use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// Bearer credentials for one session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("access token expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },
    #[error("access token is not a readable JWT: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: i64,
}

/// Reads the `exp` claim. The signature is the server's business; the client only
/// needs to know whether presenting the token is pointless.
pub fn token_expiry(token: &str) -> Result<DateTime<Utc>, AuthError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    let data = decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|err| match err.kind() {
            ErrorKind::MissingRequiredClaim(claim) => {
                AuthError::Malformed(format!("missing {claim} claim"))
            }
            _ => AuthError::Malformed(err.to_string()),
        })?;

    Utc.timestamp_opt(data.claims.exp, 0)
        .single()
        .ok_or_else(|| AuthError::Malformed(format!("exp {} out of range", data.claims.exp)))
}

/// Fails when the token cannot be read or has expired as of `now`.
pub fn ensure_token_fresh(token: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
    let expires_at = token_expiry(token)?;
    if expires_at <= now {
        return Err(AuthError::Expired {
            expired_at: expires_at,
        });
    }
    Ok(expires_at)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
