//! Provider adapter: normalizes third-party OAuth providers into a uniform
//! callback result.
//!
//! Providers differ only in endpoint URLs and userinfo response shape, so
//! each [`ProviderKind`](crate::tenancy::ProviderKind) contributes endpoint
//! data and a normalization function rather than its own type.

use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::oauth::types::{OAuthTokenSet, OAuthUserInfo, ProviderCallback};
use crate::tenancy::{ProviderConfig, ProviderKind};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The end user declined consent at the provider. The only provider
    /// failure allowed to redirect back to the caller's error page.
    #[error("the user denied access at the provider")]
    AccessDenied,
    #[error("provider returned error '{error}': {description}")]
    Protocol { error: String, description: String },
    #[error("provider callback is missing the authorization code")]
    MissingCode,
    #[error("token exchange with provider failed")]
    TokenExchange(#[source] reqwest::Error),
    #[error("userinfo fetch from provider failed")]
    UserInfo(#[source] reqwest::Error),
    #[error("provider response is malformed: {0}")]
    Malformed(String),
}

/// Fixed endpoint set per provider kind.
pub struct ProviderEndpoints {
    pub token_url: &'static str,
    pub userinfo_url: &'static str,
    pub default_scope: &'static str,
}

impl ProviderEndpoints {
    #[must_use]
    pub const fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Github => Self {
                token_url: "https://github.com/login/oauth/access_token",
                userinfo_url: "https://api.github.com/user",
                default_scope: "user:email",
            },
            ProviderKind::Google => Self {
                token_url: "https://oauth2.googleapis.com/token",
                userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
                default_scope: "openid email profile",
            },
            ProviderKind::Microsoft => Self {
                token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
                userinfo_url: "https://graph.microsoft.com/oidc/userinfo",
                default_scope: "openid email profile",
            },
            ProviderKind::Gitlab => Self {
                token_url: "https://gitlab.com/oauth/token",
                userinfo_url: "https://gitlab.com/oauth/userinfo",
                default_scope: "openid email profile",
            },
        }
    }
}

/// Inputs for one callback exchange.
pub struct ProviderCallbackRequest<'a> {
    /// PKCE verifier generated when the flow began.
    pub code_verifier: &'a str,
    pub state: &'a str,
    /// Our own callback URL, replayed as `redirect_uri` in the exchange.
    pub callback_url: &'a str,
    /// Raw provider callback parameters (query and/or form body).
    pub params: &'a HashMap<String, String>,
}

/// Capability interface over the provider exchange, so the orchestrator can
/// be driven by a fake in tests.
#[allow(async_fn_in_trait)]
pub trait ProviderExchange {
    async fn get_callback(
        &self,
        provider: &ProviderConfig,
        request: ProviderCallbackRequest<'_>,
    ) -> Result<ProviderCallback, ProviderError>;
}

/// Inspect provider-reported errors before touching the code parameter.
fn check_callback_error(params: &HashMap<String, String>) -> Result<(), ProviderError> {
    let Some(error) = params.get("error") else {
        return Ok(());
    };
    match error.as_str() {
        "access_denied" | "consent_required" | "interaction_required" => {
            Err(ProviderError::AccessDenied)
        }
        _ => Err(ProviderError::Protocol {
            error: error.clone(),
            description: params
                .get("error_description")
                .cloned()
                .unwrap_or_default(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Normalize a raw userinfo JSON document into [`OAuthUserInfo`].
///
/// GitHub uses its REST user document; the rest speak OIDC userinfo.
///
/// # Errors
///
/// Returns [`ProviderError::Malformed`] when the account id is missing.
pub fn normalize_user_info(
    kind: ProviderKind,
    raw: &serde_json::Value,
) -> Result<OAuthUserInfo, ProviderError> {
    match kind {
        ProviderKind::Github => {
            let account_id = raw
                .get("id")
                .and_then(serde_json::Value::as_i64)
                .map(|id| id.to_string())
                .ok_or_else(|| ProviderError::Malformed("github user has no id".to_string()))?;
            let email = raw
                .get("email")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            Ok(OAuthUserInfo {
                account_id,
                // GitHub only exposes verified addresses on the user document.
                email_verified: email.is_some(),
                email,
                display_name: raw
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .or_else(|| raw.get("login").and_then(serde_json::Value::as_str))
                    .map(str::to_string),
                profile_image_url: raw
                    .get("avatar_url")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
            })
        }
        ProviderKind::Google | ProviderKind::Microsoft | ProviderKind::Gitlab => {
            let account_id = raw
                .get("sub")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ProviderError::Malformed(format!("{} userinfo has no sub", kind.as_str()))
                })?;
            let email_verified = raw
                .get("email_verified")
                .and_then(serde_json::Value::as_bool)
                // Microsoft's OIDC userinfo omits the flag; emails it returns
                // are account-verified.
                .unwrap_or(kind == ProviderKind::Microsoft);
            Ok(OAuthUserInfo {
                account_id,
                email: raw
                    .get("email")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                email_verified,
                display_name: raw
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                profile_image_url: raw
                    .get("picture")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
            })
        }
    }
}

/// Production exchange over HTTP.
pub struct HttpProviderExchange {
    client: reqwest::Client,
}

impl HttpProviderExchange {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

impl ProviderExchange for HttpProviderExchange {
    async fn get_callback(
        &self,
        provider: &ProviderConfig,
        request: ProviderCallbackRequest<'_>,
    ) -> Result<ProviderCallback, ProviderError> {
        check_callback_error(request.params)?;
        let code = request
            .params
            .get("code")
            .ok_or(ProviderError::MissingCode)?;

        let endpoints = ProviderEndpoints::for_kind(provider.kind);

        debug!(provider = provider.id, "exchanging authorization code");
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
            ("code", code.as_str()),
            ("code_verifier", request.code_verifier),
            ("redirect_uri", request.callback_url),
        ];
        let token: TokenResponse = self
            .client
            .post(endpoints.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(ProviderError::TokenExchange)?
            .json()
            .await
            .map_err(ProviderError::TokenExchange)?;

        let raw_user: serde_json::Value = self
            .client
            .get(endpoints.userinfo_url)
            .bearer_auth(&token.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(ProviderError::UserInfo)?
            .json()
            .await
            .map_err(ProviderError::UserInfo)?;

        let user_info = normalize_user_info(provider.kind, &raw_user)?;

        Ok(ProviderCallback {
            user_info,
            token_set: OAuthTokenSet {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                access_token_expired_at: token
                    .expires_in
                    .map(|seconds| Utc::now() + Duration::seconds(seconds)),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn consent_denial_maps_to_access_denied() {
        for error in ["access_denied", "consent_required", "interaction_required"] {
            let result = check_callback_error(&params(&[("error", error)]));
            assert!(matches!(result, Err(ProviderError::AccessDenied)), "{error}");
        }
    }

    #[test]
    fn other_provider_errors_are_protocol_failures() {
        let result = check_callback_error(&params(&[
            ("error", "temporarily_unavailable"),
            ("error_description", "maintenance"),
        ]));
        match result {
            Err(ProviderError::Protocol { error, description }) => {
                assert_eq!(error, "temporarily_unavailable");
                assert_eq!(description, "maintenance");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn clean_params_pass_the_error_check() {
        assert!(check_callback_error(&params(&[("code", "abc")])).is_ok());
    }

    #[test]
    fn normalizes_github_user_document() {
        let raw = serde_json::json!({
            "id": 583231,
            "login": "octocat",
            "name": "The Octocat",
            "email": "octocat@github.com",
            "avatar_url": "https://avatars.githubusercontent.com/u/583231",
        });
        let info = normalize_user_info(ProviderKind::Github, &raw).unwrap();
        assert_eq!(info.account_id, "583231");
        assert_eq!(info.email.as_deref(), Some("octocat@github.com"));
        assert!(info.email_verified);
        assert_eq!(info.display_name.as_deref(), Some("The Octocat"));
    }

    #[test]
    fn github_login_is_display_name_fallback() {
        let raw = serde_json::json!({ "id": 1, "login": "octocat", "name": null });
        let info = normalize_user_info(ProviderKind::Github, &raw).unwrap();
        assert_eq!(info.display_name.as_deref(), Some("octocat"));
        assert_eq!(info.email, None);
        assert!(!info.email_verified);
    }

    #[test]
    fn normalizes_oidc_userinfo() {
        let raw = serde_json::json!({
            "sub": "10769150350006150715113082367",
            "email": "a@x.com",
            "email_verified": true,
            "name": "A",
            "picture": "https://lh3.googleusercontent.com/p",
        });
        let info = normalize_user_info(ProviderKind::Google, &raw).unwrap();
        assert_eq!(info.account_id, "10769150350006150715113082367");
        assert!(info.email_verified);
        assert_eq!(info.profile_image_url.as_deref(), Some("https://lh3.googleusercontent.com/p"));
    }

    #[test]
    fn missing_account_id_is_malformed() {
        let raw = serde_json::json!({ "email": "a@x.com" });
        assert!(matches!(
            normalize_user_info(ProviderKind::Google, &raw),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            normalize_user_info(ProviderKind::Github, &raw),
            Err(ProviderError::Malformed(_))
        ));
    }
}
