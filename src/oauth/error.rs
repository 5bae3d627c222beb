//! Error taxonomy for the OAuth callback flow.
//!
//! Three classes exist, and they render differently at the HTTP boundary:
//! user-input errors become a direct 400, known flow errors may redirect to
//! the tenant's validated error page, and assertion errors are operator
//! failures that must never reach an end-user-controlled URL.

use thiserror::Error;

/// Known, end-user-presentable flow errors. Only these may terminate the
/// callback via a redirect to the outer state's `error_redirect_url`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KnownOAuthError {
    #[error("the OAuth flow has expired, please try again")]
    OuterOAuthTimeout,
    #[error("OAuth provider not found or not enabled for this project")]
    OAuthProviderNotFoundOrNotEnabled,
    #[error("the OAuth provider denied access")]
    OAuthProviderAccessDenied,
    #[error("this user is already connected to a different account on the same OAuth provider")]
    UserAlreadyConnectedToAnotherOAuthConnection,
    #[error("this OAuth connection is already attached to a different user")]
    OAuthConnectionAlreadyConnectedToAnotherUser,
    #[error("sign-up is not enabled for this project")]
    SignUpNotEnabled,
    #[error("redirect URL is not in the list of trusted domains")]
    RedirectUrlNotWhitelisted,
}

impl KnownOAuthError {
    /// Stable machine-readable code carried in the `errorCode` query
    /// parameter of error redirects.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::OuterOAuthTimeout => "OUTER_OAUTH_TIMEOUT",
            Self::OAuthProviderNotFoundOrNotEnabled => "OAUTH_PROVIDER_NOT_FOUND_OR_NOT_ENABLED",
            Self::OAuthProviderAccessDenied => "OAUTH_PROVIDER_ACCESS_DENIED",
            Self::UserAlreadyConnectedToAnotherOAuthConnection => {
                "USER_ALREADY_CONNECTED_TO_ANOTHER_OAUTH_CONNECTION"
            }
            Self::OAuthConnectionAlreadyConnectedToAnotherUser => {
                "OAUTH_CONNECTION_ALREADY_CONNECTED_TO_ANOTHER_USER"
            }
            Self::SignUpNotEnabled => "SIGN_UP_NOT_ENABLED",
            Self::RedirectUrlNotWhitelisted => "REDIRECT_URL_NOT_WHITELISTED",
        }
    }

    /// Structured details carried in the `details` query parameter.
    #[must_use]
    pub fn details(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.error_code() })
    }
}

/// Top-level callback failure.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Bad or missing user input before any redirect target is validated.
    /// Rendered directly as a 400, never redirected.
    #[error("{0}")]
    BadRequest(String),
    /// Known flow error; redirected to the validated error page when one
    /// exists, otherwise rethrown.
    #[error(transparent)]
    Known(#[from] KnownOAuthError),
    /// The authorization step rejected the requested scope. Indicates a
    /// client or local bug; logged for operators, surfaced as a generic 400.
    #[error("invalid scope")]
    InvalidScope,
    /// Invariant violation (missing tenancy, corrupt outer state, storage
    /// failure). Always fatal, always logged, never redirected.
    #[error(transparent)]
    Assertion(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            KnownOAuthError::OAuthProviderAccessDenied.error_code(),
            "OAUTH_PROVIDER_ACCESS_DENIED"
        );
        assert_eq!(
            KnownOAuthError::OuterOAuthTimeout.error_code(),
            "OUTER_OAUTH_TIMEOUT"
        );
        assert_eq!(
            KnownOAuthError::RedirectUrlNotWhitelisted.error_code(),
            "REDIRECT_URL_NOT_WHITELISTED"
        );
    }

    #[test]
    fn details_embed_the_code() {
        let details = KnownOAuthError::SignUpNotEnabled.details();
        assert_eq!(details["code"], "SIGN_UP_NOT_ENABLED");
    }

    #[test]
    fn known_errors_convert_into_callback_errors() {
        let err: CallbackError = KnownOAuthError::SignUpNotEnabled.into();
        assert!(matches!(
            err,
            CallbackError::Known(KnownOAuthError::SignUpNotEnabled)
        ));
    }
}
