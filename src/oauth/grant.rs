//! PKCE verification for the grant-code exchange.

use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("unsupported grant_type")]
    UnsupportedGrantType,
    #[error("grant code is invalid or already used")]
    InvalidGrantCode,
    #[error("grant code has expired")]
    GrantCodeExpired,
    #[error("redirect_uri does not match the authorization request")]
    RedirectUriMismatch,
    #[error("PKCE verification failed")]
    PkceMismatch,
    #[error("unsupported code_challenge_method: {0}")]
    UnsupportedChallengeMethod(String),
}

/// Verify a PKCE `code_verifier` against the stored challenge (RFC 7636).
///
/// # Errors
///
/// Returns [`ExchangeError::PkceMismatch`] on verifier mismatch and
/// [`ExchangeError::UnsupportedChallengeMethod`] for methods other than
/// `S256` and `plain`.
pub fn verify_pkce(method: &str, challenge: &str, verifier: &str) -> Result<(), ExchangeError> {
    let matches = match method {
        "S256" => {
            let digest = Sha256::digest(verifier.as_bytes());
            Base64UrlUnpadded::encode_string(&digest) == challenge
        }
        "plain" => verifier == challenge,
        other => return Err(ExchangeError::UnsupportedChallengeMethod(other.to_string())),
    };
    if matches {
        Ok(())
    } else {
        Err(ExchangeError::PkceMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 appendix B vector.
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn s256_round_trip() {
        assert_eq!(verify_pkce("S256", CHALLENGE, VERIFIER), Ok(()));
        assert_eq!(
            verify_pkce("S256", CHALLENGE, "wrong-verifier"),
            Err(ExchangeError::PkceMismatch)
        );
    }

    #[test]
    fn plain_compares_directly() {
        assert_eq!(verify_pkce("plain", "abc", "abc"), Ok(()));
        assert_eq!(
            verify_pkce("plain", "abc", "abd"),
            Err(ExchangeError::PkceMismatch)
        );
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert_eq!(
            verify_pkce("S512", CHALLENGE, VERIFIER),
            Err(ExchangeError::UnsupportedChallengeMethod("S512".to_string()))
        );
    }
}
