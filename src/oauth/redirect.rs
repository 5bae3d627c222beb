//! Redirect-URL validation and redirect construction.
//!
//! Every redirect the callback emits goes through [`validate_redirect_url`]
//! against the tenancy's trusted domains first. Error redirects use only the
//! URL captured in the outer state when the flow began, never anything taken
//! from the callback request itself.

use url::{Host, Url};

use crate::oauth::error::{CallbackError, KnownOAuthError};
use crate::tenancy::Tenancy;

/// A 307 redirect terminating the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackRedirect {
    pub location: Url,
}

fn is_localhost(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => *domain == "localhost" || domain.ends_with(".localhost"),
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => ip.is_loopback(),
    }
}

/// Check a candidate redirect URL against a tenancy's trusted domains.
///
/// A trusted domain entry is a base URL like `https://app.example.com`; the
/// candidate matches when its scheme and host equal the entry's, and the
/// candidate's path starts with the entry's path. Localhost (including
/// loopback IPs) is trusted only when the tenancy permits it.
#[must_use]
pub fn validate_redirect_url(candidate: &str, domains: &[String], allow_localhost: bool) -> bool {
    let Ok(url) = Url::parse(candidate) else {
        return false;
    };
    let Some(host) = url.host() else {
        return false;
    };

    if allow_localhost && is_localhost(&host) {
        return true;
    }

    domains.iter().any(|domain| {
        let Ok(trusted) = Url::parse(domain) else {
            return false;
        };
        trusted.scheme() == url.scheme()
            && trusted.host() == url.host()
            && trusted.port_or_known_default() == url.port_or_known_default()
            && url.path().starts_with(trusted.path())
    })
}

/// Build the error redirect for a known flow error: the validated error page
/// with `errorCode`, `message`, and `details` query parameters appended.
///
/// # Errors
///
/// Returns an error if the stored URL does not parse. Callers validate the
/// URL before calling, so a parse failure here is unexpected.
pub fn error_redirect(
    error_redirect_url: &str,
    error: &KnownOAuthError,
) -> Result<CallbackRedirect, CallbackError> {
    let mut location = Url::parse(error_redirect_url)
        .map_err(|err| anyhow::anyhow!("stored error redirect URL failed to parse: {err}"))?;
    location
        .query_pairs_mut()
        .append_pair("errorCode", error.error_code())
        .append_pair("message", &error.to_string())
        .append_pair("details", &error.details().to_string());
    Ok(CallbackRedirect { location })
}

/// Terminate the flow for a known error: redirect when the outer state
/// carries an error page that validates against this tenancy, otherwise
/// rethrow the error unredirected.
///
/// # Errors
///
/// Returns the original error when no validated redirect target exists.
pub fn redirect_or_error(
    error: KnownOAuthError,
    tenancy: &Tenancy,
    error_redirect_url: Option<&str>,
) -> Result<CallbackRedirect, CallbackError> {
    match error_redirect_url {
        Some(url) if validate_redirect_url(url, &tenancy.domains, tenancy.allow_localhost) => {
            error_redirect(url, &error)
        }
        _ => Err(CallbackError::Known(error)),
    }
}

/// Build the success redirect carrying the authorization grant code back to
/// the tenant application.
///
/// # Errors
///
/// Returns an error if `redirect_uri` does not parse; the orchestrator
/// validates it before issuing a grant code, so this is unexpected.
pub fn authorization_redirect(
    redirect_uri: &str,
    code: &str,
    state: &str,
) -> Result<CallbackRedirect, CallbackError> {
    let mut location = Url::parse(redirect_uri)
        .map_err(|err| anyhow::anyhow!("validated redirect_uri failed to parse: {err}"))?;
    location
        .query_pairs_mut()
        .append_pair("code", code)
        .append_pair("state", state);
    Ok(CallbackRedirect { location })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains() -> Vec<String> {
        vec![
            "https://app.example.com".to_string(),
            "https://other.example.org/auth".to_string(),
        ]
    }

    #[test]
    fn accepts_exact_domain_match() {
        assert!(validate_redirect_url(
            "https://app.example.com/oauth/done?x=1",
            &domains(),
            false
        ));
    }

    #[test]
    fn enforces_scheme_host_and_path_prefix() {
        assert!(!validate_redirect_url(
            "http://app.example.com/oauth/done",
            &domains(),
            false
        ));
        assert!(!validate_redirect_url(
            "https://evil.example.com/oauth/done",
            &domains(),
            false
        ));
        assert!(!validate_redirect_url(
            "https://app.example.com.evil.net/",
            &domains(),
            false
        ));
        // Path prefix must hold for entries that carry one.
        assert!(validate_redirect_url(
            "https://other.example.org/auth/callback",
            &domains(),
            false
        ));
        assert!(!validate_redirect_url(
            "https://other.example.org/elsewhere",
            &domains(),
            false
        ));
    }

    #[test]
    fn localhost_only_when_permitted() {
        for url in [
            "http://localhost:3000/done",
            "http://127.0.0.1:3000/done",
            "http://[::1]:3000/done",
        ] {
            assert!(validate_redirect_url(url, &domains(), true), "{url}");
            assert!(!validate_redirect_url(url, &domains(), false), "{url}");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(!validate_redirect_url("not a url", &domains(), true));
        assert!(!validate_redirect_url("data:text/html,hi", &domains(), true));
    }

    #[test]
    fn error_redirect_carries_code_message_details() {
        let redirect = error_redirect(
            "https://app.example.com/error",
            &KnownOAuthError::OAuthProviderAccessDenied,
        )
        .unwrap();
        let query: Vec<(String, String)> = redirect
            .location
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&(
            "errorCode".to_string(),
            "OAUTH_PROVIDER_ACCESS_DENIED".to_string()
        )));
        assert!(query.iter().any(|(k, _)| k == "message"));
        assert!(query.iter().any(|(k, _)| k == "details"));
    }

    #[test]
    fn redirect_or_error_rethrows_for_unvalidated_target() {
        let tenancy = Tenancy::test_fixture();
        let result = redirect_or_error(
            KnownOAuthError::OuterOAuthTimeout,
            &tenancy,
            Some("https://attacker.example.net/error"),
        );
        assert!(matches!(
            result,
            Err(CallbackError::Known(KnownOAuthError::OuterOAuthTimeout))
        ));

        let result = redirect_or_error(KnownOAuthError::OuterOAuthTimeout, &tenancy, None);
        assert!(matches!(
            result,
            Err(CallbackError::Known(KnownOAuthError::OuterOAuthTimeout))
        ));
    }

    #[test]
    fn redirect_or_error_redirects_validated_target() {
        let tenancy = Tenancy::test_fixture();
        let redirect = redirect_or_error(
            KnownOAuthError::SignUpNotEnabled,
            &tenancy,
            Some("https://app.example.com/error"),
        )
        .unwrap();
        assert_eq!(redirect.location.host_str(), Some("app.example.com"));
    }

    #[test]
    fn authorization_redirect_appends_code_and_state() {
        let redirect =
            authorization_redirect("https://app.example.com/done?keep=1", "grant-1", "st-9")
                .unwrap();
        let query: Vec<(String, String)> = redirect
            .location
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("keep".to_string(), "1".to_string())));
        assert!(query.contains(&("code".to_string(), "grant-1".to_string())));
        assert!(query.contains(&("state".to_string(), "st-9".to_string())));
    }
}
