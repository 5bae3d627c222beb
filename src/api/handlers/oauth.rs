//! HTTP boundary of the OAuth flow: the provider callback endpoint and the
//! grant-code token exchange.

use axum::{
    extract::{Extension, Form, Path, Query},
    http::{
        header::{CACHE_CONTROL, LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::{collections::HashMap, sync::Arc};
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::oauth::callback::{run_callback, CallbackRequest, InnerCookieJar};
use crate::oauth::error::CallbackError;
use crate::oauth::grant::{verify_pkce, ExchangeError};
use crate::oauth::provider::HttpProviderExchange;
use crate::oauth::redirect::CallbackRedirect;
use crate::oauth::storage::{consume_grant_code, PgCallbackStore};
use crate::oauth::OAuthConfig;
use crate::tenancy;
use crate::tokens::{create_auth_tokens, AccessTokenKey, AuthTokenOptions};

/// Shared per-process federation state, injected as an axum Extension.
pub struct FederationState {
    pub config: OAuthConfig,
    pub key: AccessTokenKey,
    pub exchange: HttpProviderExchange,
}

/// Cookies parsed from the request, tracking which names were consumed so
/// the response can clear them in the browser.
struct RequestCookies {
    cookies: HashMap<String, String>,
    taken: Vec<String>,
}

impl RequestCookies {
    fn from_headers(headers: &HeaderMap) -> Self {
        let mut cookies = HashMap::new();
        for value in headers.get_all(axum::http::header::COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.to_string(), value.to_string());
                }
            }
        }
        Self {
            cookies,
            taken: Vec::new(),
        }
    }
}

impl InnerCookieJar for RequestCookies {
    fn take(&mut self, name: &str) -> Option<String> {
        self.taken.push(name.to_string());
        self.cookies.remove(name)
    }
}

#[utoipa::path(
    get,
    path= "/v1/auth/oauth/callback/{provider_id}",
    params(
        ("provider_id" = String, Path, description = "Tenancy-scoped OAuth provider id")
    ),
    responses (
        (status = 307, description = "Flow completed; redirect back to the tenant application"),
        (status = 400, description = "Missing/invalid cookie or state, or a known flow error without a validated error page"),
        (status = 500, description = "Internal invariant violation")
    ),
    tag= "oauth"
)]
// axum handler for the provider callback; also mounted for POST (form_post
// response modes) outside the documented routes
pub async fn callback(
    Path(provider_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<FederationState>>,
    form: Option<Form<HashMap<String, String>>>,
) -> Response {
    let mut params = query;
    if let Some(Form(body)) = form {
        params.extend(body);
    }

    let mut cookies = RequestCookies::from_headers(&headers);
    let store = PgCallbackStore::new(pool.0.clone());
    let request = CallbackRequest {
        provider_id,
        params,
    };

    let result = run_callback(
        &store,
        &state.exchange,
        &mut cookies,
        &state.config,
        Utc::now(),
        &request,
    )
    .await;

    render_callback(result, &cookies.taken)
}

/// Translate the orchestrator's outcome into an HTTP response, always
/// clearing any inner cookie that was consumed.
fn render_callback(
    result: Result<CallbackRedirect, CallbackError>,
    cleared_cookies: &[String],
) -> Response {
    let mut headers = HeaderMap::new();
    for name in cleared_cookies {
        if let Ok(value) = HeaderValue::from_str(&format!("{name}=; Max-Age=0; Path=/")) {
            headers.append(SET_COOKIE, value);
        }
    }

    match result {
        Ok(redirect) => match HeaderValue::from_str(redirect.location.as_str()) {
            Ok(location) => {
                headers.insert(LOCATION, location);
                (StatusCode::TEMPORARY_REDIRECT, headers).into_response()
            }
            Err(err) => {
                error!("redirect location is not a valid header value: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    headers,
                    "Internal server error".to_string(),
                )
                    .into_response()
            }
        },
        Err(CallbackError::BadRequest(message)) => {
            warn!("OAuth callback rejected: {message}");
            (StatusCode::BAD_REQUEST, headers, message).into_response()
        }
        Err(CallbackError::InvalidScope) => (
            StatusCode::BAD_REQUEST,
            headers,
            "Invalid scope".to_string(),
        )
            .into_response(),
        Err(CallbackError::Known(known)) => {
            // No validated error page existed; render the error directly.
            let body = Json(serde_json::json!({
                "code": known.error_code(),
                "message": known.to_string(),
                "details": known.details(),
            }));
            (StatusCode::BAD_REQUEST, headers, body).into_response()
        }
        Err(CallbackError::Assertion(err)) => {
            error!("OAuth callback invariant violation: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                "Internal server error".to_string(),
            )
                .into_response()
        }
    }
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct TokenExchangeRequest {
    grant_type: String,
    code: String,
    code_verifier: String,
    redirect_uri: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct TokenExchangeResponse {
    access_token: String,
    refresh_token: String,
    is_new_user: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    after_callback_redirect_url: Option<String>,
}

#[utoipa::path(
    post,
    path= "/v1/auth/oauth/token",
    request_body(content = TokenExchangeRequest, content_type = "application/x-www-form-urlencoded"),
    responses (
        (status = 200, description = "Grant code exchanged for a token pair", body = [TokenExchangeResponse]),
        (status = 400, description = "Invalid grant, PKCE failure, or redirect_uri mismatch"),
    ),
    tag= "oauth"
)]
// axum handler for the authorization-code exchange
pub async fn token_exchange(
    pool: Extension<PgPool>,
    state: Extension<Arc<FederationState>>,
    payload: Option<Form<TokenExchangeRequest>>,
) -> Response {
    let Some(Form(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    if request.grant_type != "authorization_code" {
        return exchange_error(&ExchangeError::UnsupportedGrantType);
    }

    // Single-use: of two racing exchanges for the same code, one gets None.
    let grant = match consume_grant_code(&pool, &request.code).await {
        Ok(Some(grant)) => grant,
        Ok(None) => return exchange_error(&ExchangeError::InvalidGrantCode),
        Err(err) => {
            error!("failed to consume grant code: {err:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
                .into_response();
        }
    };

    if grant.expires_at <= Utc::now() {
        return exchange_error(&ExchangeError::GrantCodeExpired);
    }
    if grant.redirect_uri != request.redirect_uri {
        return exchange_error(&ExchangeError::RedirectUriMismatch);
    }
    if let Err(err) = verify_pkce(
        &grant.code_challenge_method,
        &grant.code_challenge,
        &request.code_verifier,
    ) {
        return exchange_error(&err);
    }

    let tenancy = match tenancy::get_tenancy(&pool, grant.tenancy_id).await {
        Ok(Some(tenancy)) => tenancy,
        Ok(None) => {
            error!(tenancy_id = %grant.tenancy_id, "grant code references missing tenancy");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
                .into_response();
        }
        Err(err) => {
            error!("failed to load tenancy for token exchange: {err:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
                .into_response();
        }
    };

    let tokens = match create_auth_tokens(
        &pool,
        &state.key,
        &tenancy,
        grant.user_id,
        AuthTokenOptions::default(),
        state.config.access_token_ttl_seconds(),
    )
    .await
    {
        Ok(tokens) => tokens,
        Err(err) => {
            error!("failed to create auth tokens: {err:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
                .into_response();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    (
        StatusCode::OK,
        headers,
        Json(TokenExchangeResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            is_new_user: grant.new_user,
            after_callback_redirect_url: grant.after_callback_redirect_url,
        }),
    )
        .into_response()
}

fn exchange_error(err: &ExchangeError) -> Response {
    warn!("token exchange rejected: {err}");
    (StatusCode::BAD_REQUEST, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::error::KnownOAuthError;
    use url::Url;

    fn cookie_headers(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str(raw).unwrap(),
        );
        headers
    }

    #[test]
    fn parses_and_consumes_cookies() {
        let headers = cookie_headers("a=1; federato-oauth-inner-xyz=true; b=2");
        let mut cookies = RequestCookies::from_headers(&headers);
        assert_eq!(
            cookies.take("federato-oauth-inner-xyz").as_deref(),
            Some("true")
        );
        assert_eq!(cookies.take("federato-oauth-inner-xyz"), None);
        assert_eq!(cookies.taken.len(), 2);
    }

    #[test]
    fn render_redirect_sets_location_and_clears_cookie() {
        let redirect = CallbackRedirect {
            location: Url::parse("https://app.example.com/done?code=c").unwrap(),
        };
        let response = render_callback(Ok(redirect), &["federato-oauth-inner-xyz".to_string()]);
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://app.example.com/done?code=c"
        );
        let set_cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.starts_with("federato-oauth-inner-xyz=;"));
    }

    #[test]
    fn render_bad_request_is_400() {
        let response = render_callback(
            Err(CallbackError::BadRequest("nope".to_string())),
            &[],
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn render_known_error_is_400() {
        let response = render_callback(
            Err(CallbackError::Known(KnownOAuthError::SignUpNotEnabled)),
            &[],
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn render_assertion_is_500() {
        let response = render_callback(
            Err(CallbackError::Assertion(anyhow::anyhow!("boom"))),
            &[],
        );
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
